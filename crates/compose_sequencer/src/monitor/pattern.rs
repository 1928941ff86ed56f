//! Log and file pattern monitor

use super::{signalled, FileTail, MonitorError};
use crate::config::{match_line, PatternRule, StreamTarget, Verdict};
use crate::container::{ContainerHandle, ContainerRuntime, LogStream};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Matches the lines of one stream against an ordered list of rules
pub struct PatternMonitor {
    handle: ContainerHandle,
    target: StreamTarget,
    rules: Vec<PatternRule>,
    runtime: Arc<dyn ContainerRuntime>,
    poll_interval: Duration,
}

impl PatternMonitor {
    pub fn new(
        handle: ContainerHandle,
        target: StreamTarget,
        rules: Vec<PatternRule>,
        runtime: Arc<dyn ContainerRuntime>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            handle,
            target,
            rules,
            runtime,
            poll_interval,
        }
    }

    pub fn target(&self) -> &StreamTarget {
        &self.target
    }

    async fn open(&self) -> Result<BoxStream<'static, Result<String, MonitorError>>, MonitorError> {
        let stream = match &self.target {
            StreamTarget::Stdout => LogStream::Stdout,
            StreamTarget::Stderr => LogStream::Stderr,
            StreamTarget::File(path) => {
                return Ok(FileTail::new(path.clone(), self.poll_interval).into_stream());
            }
        };

        let lines = self.runtime.logs(&self.handle, stream).await?;
        Ok(lines.map(|line| line.map_err(MonitorError::from)).boxed())
    }

    pub async fn run(self, mut cancel: watch::Receiver<()>) -> Result<Option<Verdict>, MonitorError> {
        let service = &self.handle.service;

        let mut lines = tokio::select! {
            biased;
            _ = signalled(&mut cancel) => return Ok(None),
            lines = self.open() => lines?,
        };

        loop {
            let line = tokio::select! {
                biased;
                _ = signalled(&mut cancel) => {
                    log::debug!("[{}] {} monitor cancelled", service, self.target);
                    return Ok(None);
                }
                line = lines.next() => line,
            };

            let Some(line) = line else {
                log::debug!("[{}] {} closed without a match", service, self.target);
                return Ok(None);
            };

            let line = line?;
            log::trace!("[{}] {}: {}", service, self.target, line);

            if let Some(verdict) = match_line(&self.rules, &line) {
                return Ok(Some(verdict));
            }
        }
    }
}
