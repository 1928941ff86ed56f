//! Readiness gate: races the monitors of one service to a single verdict

use super::{
    signalled, ExitCodeMonitor, Monitor, MonitorError, PatternMonitor, TimeoutMonitor,
};
use crate::config::{StateConditions, Verdict};
use crate::container::{ContainerHandle, ContainerRuntime};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Supervisor for the monitors of one started service
pub struct ReadinessGate {
    service: String,
    monitors: Vec<Monitor>,
}

impl ReadinessGate {
    /// One monitor per configured rule; pattern rules get one monitor per stream
    pub fn new(
        conditions: &StateConditions,
        handle: &ContainerHandle,
        runtime: Arc<dyn ContainerRuntime>,
        poll_interval: Duration,
    ) -> Self {
        let mut monitors = Vec::with_capacity(conditions.monitor_count());

        if let Some(rule) = &conditions.exit {
            monitors.push(Monitor::ExitCode(ExitCodeMonitor::new(
                handle.clone(),
                rule.clone(),
                runtime.clone(),
            )));
        }

        if let Some(rule) = &conditions.timeout {
            monitors.push(Monitor::Timeout(TimeoutMonitor::new(
                handle.service.clone(),
                rule.clone(),
            )));
        }

        for (target, rules) in &conditions.patterns {
            monitors.push(Monitor::Pattern(PatternMonitor::new(
                handle.clone(),
                target.clone(),
                rules.clone(),
                runtime.clone(),
                poll_interval,
            )));
        }

        Self {
            service: handle.service.clone(),
            monitors,
        }
    }

    pub fn monitor_count(&self) -> usize {
        self.monitors.len()
    }

    /// Run every monitor and return the first verdict.
    ///
    /// Once a verdict (or a monitor error) is observed, the remaining monitors
    /// are cancelled and joined before this returns; their verdicts are
    /// dropped. If every monitor ends without a verdict the gate keeps
    /// waiting until `shutdown` fires.
    pub async fn resolve(self, mut shutdown: watch::Receiver<()>) -> Result<Verdict, GateError> {
        let service = self.service;

        if self.monitors.is_empty() {
            return Ok(Verdict::success("No readiness conditions configured"));
        }

        let (cancel_tx, cancel_rx) = watch::channel(());
        let mut tasks = JoinSet::new();

        for monitor in self.monitors {
            let name = monitor.describe();
            let cancel = cancel_rx.clone();
            log::debug!("[{}] Starting {} monitor", service, name);
            tasks.spawn(async move {
                let result = monitor.run(cancel).await;
                (name, result)
            });
        }

        let mut exhausted = false;
        let outcome = loop {
            tokio::select! {
                biased;
                _ = signalled(&mut shutdown) => break Err(GateError::Interrupted),
                joined = tasks.join_next(), if !tasks.is_empty() => match joined {
                    Some(Ok((name, Ok(Some(verdict))))) => {
                        log::debug!("[{}] {} monitor reported {}", service, name, verdict.outcome);
                        break Ok(verdict);
                    }
                    Some(Ok((name, Ok(None)))) => {
                        log::debug!("[{}] {} monitor finished without a verdict", service, name);
                    }
                    Some(Ok((name, Err(source)))) => {
                        break Err(GateError::Monitor { monitor: name, source });
                    }
                    Some(Err(e)) => break Err(GateError::Task(e)),
                    None => {}
                },
            }

            if tasks.is_empty() && !exhausted {
                exhausted = true;
                log::warn!(
                    "[{}] All monitors finished without a verdict; waiting until interrupted",
                    service
                );
            }
        };

        let _ = cancel_tx.send(());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, Ok(Some(late)))) => {
                    log::debug!("[{}] Discarding late verdict from {} monitor: {}", service, name, late);
                }
                Ok((name, Err(e))) => {
                    log::debug!("[{}] {} monitor failed after resolution: {}", service, name, e);
                }
                Ok((_, Ok(None))) => {}
                Err(e) => log::debug!("[{}] Monitor task ended abnormally: {}", service, e),
            }
        }

        outcome
    }
}

/// Errors that end a readiness gate without a verdict
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("{monitor} monitor failed: {source}")]
    Monitor {
        monitor: String,
        #[source]
        source: MonitorError,
    },

    #[error("Monitor task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Interrupted while waiting for readiness")]
    Interrupted,
}
