//! Container runtime collaborator
//!
//! The sequencer never talks to a container engine directly. It asks a
//! [`ContainerRuntime`] to start a service and then observes the resulting
//! container through inspection, lifecycle events and log streams.

mod docker;

pub use docker::DockerCompose;

use async_trait::async_trait;
use futures::stream::BoxStream;

/// Live lifecycle events of one container
pub type EventStream = BoxStream<'static, Result<LifecycleEvent, RuntimeError>>;

/// Live output lines of one container stream
pub type LineStream = BoxStream<'static, Result<String, RuntimeError>>;

/// Reference to the container started for a service
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerHandle {
    /// Service the container belongs to
    pub service: String,
    /// Runtime-specific container id
    pub id: String,
    /// Unix timestamp (seconds) taken just before the start request
    pub since: u64,
}

/// Output stream of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// A container lifecycle event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    /// Event action, e.g. `start`, `die`, `destroy`
    pub action: String,
    /// Container id the event refers to
    pub container: String,
}

impl LifecycleEvent {
    /// True for the "container terminated" event
    pub fn is_termination(&self) -> bool {
        self.action == "die"
    }

    /// True if the event refers to the container of `handle`. Ids may be
    /// abbreviated on either side, so a prefix match is enough.
    pub fn concerns(&self, handle: &ContainerHandle) -> bool {
        !self.container.is_empty()
            && !handle.id.is_empty()
            && (self.container.starts_with(&handle.id) || handle.id.starts_with(&self.container))
    }
}

/// A container carrying a project's label, as listed for removal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectContainer {
    pub id: String,
    pub name: String,
    /// Engine state, e.g. `running`, `exited`, `created`
    pub state: String,
}

impl ProjectContainer {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

/// Operations the sequencer needs from a container engine.
///
/// Implementations must be safe for concurrent use: several monitors of the
/// same readiness gate call `inspect`, `events` and `logs` at the same time.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Start (or recreate) the containers of a service
    async fn start(&self, service: &str) -> Result<ContainerHandle, RuntimeError>;

    /// Termination code of a stopped container
    async fn inspect(&self, handle: &ContainerHandle) -> Result<i64, RuntimeError>;

    /// Follow lifecycle events of a container, starting at `handle.since`
    async fn events(&self, handle: &ContainerHandle) -> Result<EventStream, RuntimeError>;

    /// Follow one output stream of a container from its beginning
    async fn logs(
        &self,
        handle: &ContainerHandle,
        stream: LogStream,
    ) -> Result<LineStream, RuntimeError>;
}

/// Errors reported by a container runtime
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Failed to read output of '{command}': {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unexpected output from '{command}': {output}")]
    UnexpectedOutput { command: String, output: String },

    #[error("No container found for service '{0}'")]
    NoContainer(String),
}
