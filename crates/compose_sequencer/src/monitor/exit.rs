//! Exit-code monitor

use super::{signalled, MonitorError};
use crate::config::{ExitCodeRule, Verdict};
use crate::container::{ContainerHandle, ContainerRuntime};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::watch;

/// Classifies the termination code of a container on its first `die` event
pub struct ExitCodeMonitor {
    handle: ContainerHandle,
    rule: ExitCodeRule,
    runtime: Arc<dyn ContainerRuntime>,
}

impl ExitCodeMonitor {
    pub fn new(handle: ContainerHandle, rule: ExitCodeRule, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            handle,
            rule,
            runtime,
        }
    }

    pub async fn run(self, mut cancel: watch::Receiver<()>) -> Result<Option<Verdict>, MonitorError> {
        let service = &self.handle.service;

        let mut events = tokio::select! {
            biased;
            _ = signalled(&mut cancel) => return Ok(None),
            events = self.runtime.events(&self.handle) => events?,
        };

        loop {
            let event = tokio::select! {
                biased;
                _ = signalled(&mut cancel) => {
                    log::debug!("[{}] Exit code monitor cancelled", service);
                    return Ok(None);
                }
                event = events.next() => event,
            };

            let Some(event) = event else {
                log::debug!("[{}] Event stream closed before the container terminated", service);
                return Ok(None);
            };

            let event = event?;
            if !event.concerns(&self.handle) {
                log::trace!("[{}] Ignoring event for container {}", service, event.container);
                continue;
            }
            if !event.is_termination() {
                log::trace!("[{}] Ignoring '{}' event", service, event.action);
                continue;
            }

            let code = tokio::select! {
                biased;
                _ = signalled(&mut cancel) => return Ok(None),
                code = self.runtime.inspect(&self.handle) => code?,
            };

            log::debug!("[{}] Container terminated with code {}", service, code);
            return Ok(Some(self.rule.classify(code)));
        }
    }
}
