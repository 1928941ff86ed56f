//! Deadline monitor

use super::signalled;
use crate::config::{TimeoutRule, Verdict};
use std::time::Duration;
use tokio::sync::watch;

/// Reports the configured status once the deadline passes
#[derive(Debug, Clone)]
pub struct TimeoutMonitor {
    service: String,
    rule: TimeoutRule,
}

impl TimeoutMonitor {
    pub fn new(service: impl Into<String>, rule: TimeoutRule) -> Self {
        Self {
            service: service.into(),
            rule,
        }
    }

    pub fn duration(&self) -> Duration {
        self.rule.duration
    }

    /// The timer starts on the first poll; cancellation discards it
    pub async fn run(self, mut cancel: watch::Receiver<()>) -> Option<Verdict> {
        tokio::select! {
            biased;
            _ = signalled(&mut cancel) => {
                log::debug!("[{}] Timeout monitor cancelled", self.service);
                None
            }
            _ = tokio::time::sleep(self.rule.duration) => {
                let status = self.rule.status;
                let message = format!(
                    "{} triggered after {} seconds",
                    status,
                    self.rule.duration.as_secs_f64()
                );
                Some(Verdict::new(status, message))
            }
        }
    }
}
