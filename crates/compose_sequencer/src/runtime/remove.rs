//! Project teardown (`rm`)

use crate::container::{DockerCompose, ProjectContainer, RuntimeError};

/// Remove every container of the runtime's project.
///
/// Without `force` nothing is removed while any container is still running.
/// `on_removed` is called after each container is gone.
pub async fn remove_project(
    runtime: &DockerCompose,
    force: bool,
    mut on_removed: impl FnMut(&ProjectContainer),
) -> Result<Vec<ProjectContainer>, RemoveError> {
    let project = runtime.project_name().ok_or(RemoveError::NoProjectName)?;

    let containers = runtime.project_containers(project).await?;
    log::debug!("Project '{}' has {} containers", project, containers.len());

    let running: Vec<String> = containers
        .iter()
        .filter(|c| c.is_running())
        .map(|c| c.name.clone())
        .collect();
    if !running.is_empty() && !force {
        return Err(RemoveError::StillRunning(running));
    }

    for container in &containers {
        log::info!("Removing {}", container.name);
        runtime.remove(container).await?;
        on_removed(container);
    }
    Ok(containers)
}

/// Errors that stop a project teardown
#[derive(Debug, thiserror::Error)]
pub enum RemoveError {
    #[error("A project name is required to remove containers (-p)")]
    NoProjectName,

    #[error("The following containers are still running (use -f to stop them): {}", .0.join(", "))]
    StillRunning(Vec<String>),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl RemoveError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            RemoveError::StillRunning(_) => 1,
            RemoveError::NoProjectName => 2,
            RemoveError::Runtime(_) => 3,
        }
    }
}
