//! Readiness monitors and the gate that races them
//!
//! Every configured rule becomes one [`Monitor`]. A monitor watches a single
//! source (lifecycle events, a timer, a log stream or a file) and reports at
//! most one [`Verdict`]. Monitors check their cancellation channel at every
//! await point so a resolved gate can stop them promptly.

mod exit;
mod gate;
mod pattern;
mod tail;
mod timeout;

pub use exit::ExitCodeMonitor;
pub use gate::{GateError, ReadinessGate};
pub use pattern::PatternMonitor;
pub use tail::FileTail;
pub use timeout::TimeoutMonitor;

use crate::config::Verdict;
use crate::container::RuntimeError;
use tokio::sync::watch;

/// One readiness observer
pub enum Monitor {
    ExitCode(ExitCodeMonitor),
    Timeout(TimeoutMonitor),
    Pattern(PatternMonitor),
}

impl Monitor {
    /// Short name used in logs and errors
    pub fn describe(&self) -> String {
        match self {
            Monitor::ExitCode(_) => "exit code".to_string(),
            Monitor::Timeout(m) => format!("timeout ({}s)", m.duration().as_secs_f64()),
            Monitor::Pattern(m) => format!("{} pattern", m.target()),
        }
    }

    /// Run until a verdict, cancellation or the end of the watched source
    pub async fn run(self, cancel: watch::Receiver<()>) -> Result<Option<Verdict>, MonitorError> {
        match self {
            Monitor::ExitCode(m) => m.run(cancel).await,
            Monitor::Timeout(m) => Ok(m.run(cancel).await),
            Monitor::Pattern(m) => m.run(cancel).await,
        }
    }
}

/// Resolves once a signal is sent on `rx`.
///
/// A dropped sender never signals, so a receiver whose owner went away
/// keeps waiting instead of spinning.
pub(crate) async fn signalled(rx: &mut watch::Receiver<()>) {
    if rx.changed().await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Errors raised inside a monitor
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("Container runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Failed to tail '{path}': {source}")]
    Tail {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
