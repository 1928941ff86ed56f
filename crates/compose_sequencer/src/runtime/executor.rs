//! Startup executor - starts services in dependency order and waits for readiness

use crate::config::{ComposeProject, StateConditions, Verdict};
use crate::container::{ContainerRuntime, RuntimeError};
use crate::monitor::{signalled, GateError, ReadinessGate};
use crate::runtime::dependency::{DependencyError, DependencyGraph, ResolvedService};
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Startup executor configuration
#[derive(Debug, Clone)]
pub struct SequencerConfig {
    /// Failing timeout added to conditioned services that have none
    pub default_timeout: Option<Duration>,
    /// How often a file monitor checks for new data
    pub file_poll_interval: Duration,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            default_timeout: None,
            file_poll_interval: Duration::from_millis(250),
        }
    }
}

/// Progress of a single service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Not started yet
    Pending,
    /// Start requested from the container runtime
    Starting,
    /// Started; readiness gate running
    Awaiting,
    /// Started without readiness conditions
    Started,
    /// Readiness gate resolved with success
    Ready(Verdict),
    /// Start or readiness failed
    Failed(String),
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceStatus::Pending => write!(f, "pending"),
            ServiceStatus::Starting => write!(f, "starting"),
            ServiceStatus::Awaiting => write!(f, "awaiting readiness"),
            ServiceStatus::Started => write!(f, "started"),
            ServiceStatus::Ready(verdict) => write!(f, "ready ({})", verdict.message),
            ServiceStatus::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

/// Start plan for dry-run mode
#[derive(Debug)]
pub struct LaunchPlan {
    /// Compose files handed to the runtime
    pub files: Vec<String>,
    /// Services in start order
    pub services: Vec<LaunchPlanService>,
}

/// A service in the start plan
#[derive(Debug)]
pub struct LaunchPlanService {
    pub name: String,
    pub dependencies: Vec<String>,
    /// Condition summary; `None` when the service is not waited for
    pub conditions: Option<String>,
}

/// Startup executor state
pub struct Executor {
    /// Configuration
    config: SequencerConfig,
    /// Resolved compose project
    project: ComposeProject,
    /// Container runtime shared with the monitors
    runtime: Arc<dyn ContainerRuntime>,
    /// Per-service progress in start order
    statuses: IndexMap<String, ServiceStatus>,
}

impl Executor {
    /// Create a new executor
    pub fn new(
        project: ComposeProject,
        runtime: Arc<dyn ContainerRuntime>,
        config: SequencerConfig,
    ) -> Self {
        let statuses = project
            .services
            .keys()
            .map(|name| (name.clone(), ServiceStatus::Pending))
            .collect();

        Self {
            config,
            project,
            runtime,
            statuses,
        }
    }

    pub fn project(&self) -> &ComposeProject {
        &self.project
    }

    fn build_dependency_graph(&self) -> Result<DependencyGraph, ExecutorError> {
        DependencyGraph::build(&self.project).map_err(ExecutorError::Dependency)
    }

    /// Readiness conditions with the configured default timeout applied
    fn conditions_for(&self, service: &ResolvedService) -> Option<StateConditions> {
        let conditions = service.conditions.clone()?;
        Some(match self.config.default_timeout {
            Some(timeout) => conditions.with_default_timeout(timeout),
            None => conditions,
        })
    }

    /// Service names in start order
    pub fn start_order(&self) -> Result<Vec<String>, ExecutorError> {
        let graph = self.build_dependency_graph()?;
        Ok(graph.names().into_iter().map(str::to_string).collect())
    }

    /// Services held back directly by `service`, in start order
    pub fn dependents_of(&self, service: &str) -> Result<Vec<String>, ExecutorError> {
        let graph = self.build_dependency_graph()?;
        Ok(graph
            .dependents(service)
            .into_iter()
            .map(|s| s.name.clone())
            .collect())
    }

    /// Generate a start plan (for dry-run mode)
    pub fn plan(&self) -> Result<LaunchPlan, ExecutorError> {
        let graph = self.build_dependency_graph()?;

        let services = graph
            .launch_order()
            .map(|service| LaunchPlanService {
                name: service.name.clone(),
                dependencies: service.dependencies.clone(),
                conditions: self
                    .conditions_for(service)
                    .filter(|c| !c.is_empty())
                    .map(|c| c.summary()),
            })
            .collect();

        Ok(LaunchPlan {
            files: self
                .project
                .files
                .iter()
                .map(|f| f.display().to_string())
                .collect(),
            services,
        })
    }

    fn set_status(&mut self, service: &str, status: ServiceStatus) {
        self.statuses.insert(service.to_string(), status);
    }

    /// Start every service in dependency order.
    ///
    /// A service is only started once the readiness gate of the service
    /// before it has resolved with success. The first start failure, monitor
    /// error or non-success verdict aborts the run.
    pub async fn launch(&mut self, mut shutdown: watch::Receiver<()>) -> Result<(), ExecutorError> {
        let graph = self.build_dependency_graph()?;

        log::info!("Starting {} services...", graph.services.len());
        self.statuses = graph
            .launch_order()
            .map(|service| (service.name.clone(), ServiceStatus::Pending))
            .collect();

        for service in graph.launch_order() {
            let name = service.name.as_str();

            // Check for shutdown signal
            if shutdown.has_changed().unwrap_or(false) {
                log::info!("Shutdown requested, aborting startup");
                return Err(ExecutorError::Interrupted);
            }

            self.set_status(name, ServiceStatus::Starting);
            log::info!("[{}] Starting", name);

            let started = tokio::select! {
                biased;
                _ = signalled(&mut shutdown) => Err(ExecutorError::Interrupted),
                result = self.runtime.start(name) => result.map_err(|source| ExecutorError::Start {
                    service: name.to_string(),
                    source,
                }),
            };
            let handle = match started {
                Ok(handle) => handle,
                Err(e) => {
                    self.set_status(name, ServiceStatus::Failed(e.to_string()));
                    return Err(e);
                }
            };
            log::debug!("[{}] Container {}", name, handle.id);

            let Some(conditions) = self.conditions_for(service) else {
                log::info!("[{}] Started", name);
                self.set_status(name, ServiceStatus::Started);
                continue;
            };

            if conditions.timeout.is_none() && !conditions.is_empty() {
                log::warn!(
                    "[{}] No timeout configured; readiness may be awaited indefinitely",
                    name
                );
            }

            self.set_status(name, ServiceStatus::Awaiting);
            log::info!("[{}] Waiting for readiness ({})", name, conditions.summary());

            let gate = ReadinessGate::new(
                &conditions,
                &handle,
                self.runtime.clone(),
                self.config.file_poll_interval,
            );

            let verdict = match gate.resolve(shutdown.clone()).await {
                Ok(verdict) => verdict,
                Err(GateError::Interrupted) => {
                    self.set_status(name, ServiceStatus::Failed("interrupted".to_string()));
                    return Err(ExecutorError::Interrupted);
                }
                Err(source) => {
                    self.set_status(name, ServiceStatus::Failed(source.to_string()));
                    return Err(ExecutorError::Monitor {
                        service: name.to_string(),
                        source,
                    });
                }
            };

            if !verdict.is_success() {
                log::error!("[{}] {}", name, verdict);
                self.set_status(name, ServiceStatus::Failed(verdict.message.clone()));
                return Err(ExecutorError::NotReady {
                    service: name.to_string(),
                    verdict,
                });
            }

            log::info!("[{}] Ready: {}", name, verdict.message);
            self.set_status(name, ServiceStatus::Ready(verdict));
        }

        log::info!("All services started successfully");
        Ok(())
    }

    /// Get service status summary
    pub fn status(&self) -> Vec<(&str, &ServiceStatus)> {
        self.statuses
            .iter()
            .map(|(name, status)| (name.as_str(), status))
            .collect()
    }
}

/// Errors that can occur in the executor
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Dependency error: {0}")]
    Dependency(#[from] DependencyError),

    #[error("Failed to start service '{service}': {source}")]
    Start {
        service: String,
        #[source]
        source: RuntimeError,
    },

    #[error("Readiness check failed for service '{service}': {source}")]
    Monitor {
        service: String,
        #[source]
        source: GateError,
    },

    #[error("Service '{service}' did not become ready: {verdict}")]
    NotReady { service: String, verdict: Verdict },

    #[error("Startup interrupted")]
    Interrupted,
}

impl ExecutorError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            ExecutorError::NotReady { .. } => 1,
            ExecutorError::Dependency(_) => 2,
            ExecutorError::Start { .. } | ExecutorError::Monitor { .. } => 3,
            ExecutorError::Interrupted => 130,
        }
    }

    /// Service the run failed on, if any
    pub fn service(&self) -> Option<&str> {
        match self {
            ExecutorError::Start { service, .. }
            | ExecutorError::Monitor { service, .. }
            | ExecutorError::NotReady { service, .. } => Some(service),
            ExecutorError::Dependency(_) | ExecutorError::Interrupted => None,
        }
    }
}

/// Display the start plan in a human-readable format
impl fmt::Display for LaunchPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Startup Plan")?;
        writeln!(f, "============")?;
        writeln!(f)?;

        if !self.files.is_empty() {
            writeln!(f, "Compose files:")?;
            for file in &self.files {
                writeln!(f, "  {}", file)?;
            }
            writeln!(f)?;
        }

        writeln!(f, "Services (in start order):")?;
        for (i, service) in self.services.iter().enumerate() {
            writeln!(f)?;
            writeln!(f, "  {}. {}", i + 1, service.name)?;

            if !service.dependencies.is_empty() {
                writeln!(f, "     Depends on: {}", service.dependencies.join(", "))?;
            }

            match &service.conditions {
                Some(conditions) => writeln!(f, "     Waits for: {}", conditions)?,
                None => writeln!(f, "     Waits for: nothing")?,
            }
        }

        Ok(())
    }
}
