//! Compose Sequencer
//!
//! Starts the services of a compose project one at a time, in dependency
//! order, and waits for each one to become ready before starting the next.
//!
//! # Overview
//!
//! - Compose files are loaded with their `require` stanzas and merged
//! - Services are ordered so that every dependency starts first
//! - After a service is started, its readiness conditions are raced:
//!   exit code, timeout and log/file patterns. The first verdict wins
//! - A non-success verdict aborts the run before any dependent is started
//! - `-a <image>:<version>` swaps the image of matching services for the run
//! - `rm` removes the containers of a project
//!
//! # Example Compose File
//!
//! ```yaml
//! services:
//!   db:
//!     image: postgres:16
//!     state_conditions:
//!       timeout:
//!         duration: 60
//!         status: failure
//!       filemonitor:
//!         - file: STDERR
//!           regex: "ready to accept connections"
//!           status: success
//!
//!   migrate:
//!     image: app-migrations
//!     depends_on: [db]
//!     state_conditions:
//!       exit: [0]
//!
//!   api:
//!     image: app
//!     depends_on: [migrate]
//! ```

pub mod cli;
pub mod config;
pub mod container;
pub mod monitor;
pub mod runtime;

pub use cli::{Command, RmArgs, SequencerArgs, UpArgs};
pub use config::{
    AppVersion, ComposeFileError, ComposeProject, Interpolator, Outcome, StateConditions,
    Verdict,
};
pub use container::{ContainerHandle, ContainerRuntime, DockerCompose, RuntimeError};
pub use monitor::{GateError, Monitor, MonitorError, ReadinessGate};
pub use runtime::{
    remove_project, DependencyError, DependencyGraph, Executor, ExecutorError, LaunchPlan,
    RemoveError, SequencerConfig, ServiceStatus,
};
