//! Docker Compose runtime driven through the `docker` CLI

use super::{
    ContainerHandle, ContainerRuntime, EventStream, LifecycleEvent, LineStream, LogStream,
    ProjectContainer, RuntimeError,
};
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;

/// Trailing stderr lines kept for the error of a failed follow command
const STDERR_TAIL_LINES: usize = 20;

/// Label docker compose puts on every container of a project
const PROJECT_LABEL: &str = "com.docker.compose.project";

/// Runs `docker compose` for a fixed set of compose files
#[derive(Debug, Clone)]
pub struct DockerCompose {
    /// Docker CLI binary
    docker: String,
    /// Explicit project name (`--project-name`)
    project_name: Option<String>,
    /// Compose files in merge order
    files: Vec<PathBuf>,
}

impl DockerCompose {
    pub fn new(files: Vec<PathBuf>) -> Self {
        Self {
            docker: "docker".to_string(),
            project_name: None,
            files,
        }
    }

    pub fn with_project_name(mut self, name: impl Into<String>) -> Self {
        self.project_name = Some(name.into());
        self
    }

    pub fn with_docker_binary(mut self, docker: impl Into<String>) -> Self {
        self.docker = docker.into();
        self
    }

    fn compose_command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.docker);
        cmd.arg("compose");
        if let Some(name) = &self.project_name {
            cmd.arg("--project-name").arg(name);
        }
        for file in &self.files {
            cmd.arg("--file").arg(file);
        }
        cmd.args(args);
        cmd
    }

    fn docker_command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.docker);
        cmd.args(args);
        cmd
    }

    pub fn project_name(&self) -> Option<&str> {
        self.project_name.as_deref()
    }

    /// Every container of the named project, running or not
    pub async fn project_containers(
        &self,
        project: &str,
    ) -> Result<Vec<ProjectContainer>, RuntimeError> {
        // compose stores the normalized (lowercase) project name in the label
        let filter = format!("label={}={}", PROJECT_LABEL, project.to_lowercase());
        let cmd = self.docker_command(&[
            "ps",
            "--all",
            "--no-trunc",
            "--filter",
            &filter,
            "--format",
            "{{.ID}}\t{{.Names}}\t{{.State}}",
        ]);
        let command = describe(&cmd);
        let output = Self::output(cmd).await?;

        output
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| parse_container(&command, line))
            .collect()
    }

    /// Remove a container together with its anonymous volumes, stopping it
    /// first if it is running
    pub async fn remove(&self, container: &ProjectContainer) -> Result<(), RuntimeError> {
        Self::output(self.docker_command(&["rm", "--force", "--volumes", &container.id])).await?;
        Ok(())
    }

    /// Run a command to completion and return its stdout
    async fn output(mut cmd: Command) -> Result<String, RuntimeError> {
        let command = describe(&cmd);
        log::debug!("Running: {}", command);

        let output = cmd
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| RuntimeError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(RuntimeError::CommandFailed {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Spawn a long-running command and stream one of its outputs line by line.
    /// The child is killed when the stream is dropped. When the output ends the
    /// child is reaped; a non-zero exit is yielded as a final error.
    fn follow(mut cmd: Command, stream: LogStream) -> Result<LineStream, RuntimeError> {
        let command = describe(&cmd);
        log::debug!("Following: {}", command);

        let stdout = match stream {
            LogStream::Stdout => Stdio::piped(),
            LogStream::Stderr => Stdio::null(),
        };

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RuntimeError::Spawn {
                command: command.clone(),
                source,
            })?;

        let (reader, stderr_tail) = match stream {
            LogStream::Stdout => {
                let reader = child
                    .stdout
                    .take()
                    .map(|r| Box::new(r) as Box<dyn AsyncRead + Send + Unpin>);
                (reader, child.stderr.take().map(capture_stderr))
            }
            LogStream::Stderr => {
                let reader = child
                    .stderr
                    .take()
                    .map(|r| Box::new(r) as Box<dyn AsyncRead + Send + Unpin>);
                (reader, None)
            }
        };
        let reader = reader.ok_or_else(|| RuntimeError::Io {
            command: command.clone(),
            source: std::io::Error::other("output not piped"),
        })?;

        Ok(line_stream(command, child, reader, stderr_tail))
    }
}

#[async_trait]
impl ContainerRuntime for DockerCompose {
    async fn start(&self, service: &str) -> Result<ContainerHandle, RuntimeError> {
        let since = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        Self::output(self.compose_command(&[
            "up",
            "--detach",
            "--no-deps",
            "--force-recreate",
            service,
        ]))
        .await?;

        // --all so a container that already exited is still found
        let ids = Self::output(self.compose_command(&["ps", "--all", "--quiet", service])).await?;
        let id = ids
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .ok_or_else(|| RuntimeError::NoContainer(service.to_string()))?;

        Ok(ContainerHandle {
            service: service.to_string(),
            id: id.to_string(),
            since,
        })
    }

    async fn inspect(&self, handle: &ContainerHandle) -> Result<i64, RuntimeError> {
        let cmd = self.docker_command(&["inspect", "--format", "{{.State.ExitCode}}", &handle.id]);
        let command = describe(&cmd);
        let output = Self::output(cmd).await?;

        output
            .trim()
            .parse::<i64>()
            .map_err(|_| RuntimeError::UnexpectedOutput {
                command,
                output: output.trim().to_string(),
            })
    }

    async fn events(&self, handle: &ContainerHandle) -> Result<EventStream, RuntimeError> {
        let since = handle.since.to_string();
        let filter = format!("container={}", handle.id);
        let cmd = self.docker_command(&[
            "events",
            "--since",
            &since,
            "--filter",
            &filter,
            "--filter",
            "type=container",
            "--format",
            "{{json .}}",
        ]);
        let command = describe(&cmd);
        let lines = Self::follow(cmd, LogStream::Stdout)?;

        Ok(lines
            .filter_map(move |line| {
                let event = match line {
                    Ok(line) if line.trim().is_empty() => None,
                    Ok(line) => Some(parse_event(&command, &line)),
                    Err(e) => Some(Err(e)),
                };
                futures::future::ready(event)
            })
            .boxed())
    }

    async fn logs(
        &self,
        handle: &ContainerHandle,
        stream: LogStream,
    ) -> Result<LineStream, RuntimeError> {
        let cmd = self.docker_command(&["logs", "--follow", &handle.id]);
        Self::follow(cmd, stream)
    }
}

/// `docker events --format '{{json .}}'` record
#[derive(Debug, Deserialize)]
struct DockerEvent {
    #[serde(rename = "Action")]
    action: String,
    #[serde(rename = "Actor")]
    actor: DockerActor,
}

#[derive(Debug, Deserialize)]
struct DockerActor {
    #[serde(rename = "ID")]
    id: String,
}

fn parse_event(command: &str, line: &str) -> Result<LifecycleEvent, RuntimeError> {
    let event: DockerEvent =
        serde_json::from_str(line).map_err(|_| RuntimeError::UnexpectedOutput {
            command: command.to_string(),
            output: line.to_string(),
        })?;

    Ok(LifecycleEvent {
        action: event.action,
        container: event.actor.id,
    })
}

/// One `ID<TAB>NAMES<TAB>STATE` line of `docker ps`
fn parse_container(command: &str, line: &str) -> Result<ProjectContainer, RuntimeError> {
    let mut fields = line.trim().split('\t');
    match (fields.next(), fields.next(), fields.next()) {
        (Some(id), Some(name), Some(state)) if !id.is_empty() => Ok(ProjectContainer {
            id: id.to_string(),
            name: name.to_string(),
            state: state.to_lowercase(),
        }),
        _ => Err(RuntimeError::UnexpectedOutput {
            command: command.to_string(),
            output: line.to_string(),
        }),
    }
}

fn describe(cmd: &Command) -> String {
    let cmd = cmd.as_std();
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|part| part.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Collect the last lines a child writes to stderr
fn capture_stderr(stderr: ChildStderr) -> JoinHandle<String> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);

        while let Ok(Some(line)) = lines.next_line().await {
            log::trace!("stderr: {}", line);
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }

        Vec::from(tail).join("\n")
    })
}

/// State of a followed child: holds the child so it lives as long as the stream
struct FollowState {
    command: String,
    child: Child,
    reader: Option<BufReader<Box<dyn AsyncRead + Send + Unpin>>>,
    /// Drain of the child's stderr when stdout is the followed stream
    stderr_tail: Option<JoinHandle<String>>,
    /// Last line read when stderr itself is followed
    last_line: String,
}

impl FollowState {
    /// Reap the child after its output closed
    async fn exit_error(&mut self) -> Option<RuntimeError> {
        let status = match self.child.wait().await {
            Ok(status) => status,
            Err(source) => {
                return Some(RuntimeError::Io {
                    command: self.command.clone(),
                    source,
                })
            }
        };

        let stderr = match self.stderr_tail.take() {
            Some(drain) => drain.await.unwrap_or_default(),
            None => std::mem::take(&mut self.last_line),
        };

        if status.success() {
            return None;
        }

        Some(RuntimeError::CommandFailed {
            command: self.command.clone(),
            status: status.to_string(),
            stderr: stderr.trim().to_string(),
        })
    }
}

fn line_stream(
    command: String,
    child: Child,
    reader: Box<dyn AsyncRead + Send + Unpin>,
    stderr_tail: Option<JoinHandle<String>>,
) -> LineStream {
    let state = FollowState {
        command,
        child,
        reader: Some(BufReader::new(reader)),
        stderr_tail,
        last_line: String::new(),
    };

    futures::stream::unfold(state, |mut state| async move {
        let reader = state.reader.as_mut()?;
        let mut buf = Vec::new();

        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                state.reader = None;
                let error = state.exit_error().await?;
                Some((Err(error), state))
            }
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                if state.stderr_tail.is_none() {
                    state.last_line.clone_from(&line);
                }
                Some((Ok(line), state))
            }
            Err(source) => {
                state.reader = None;
                let command = state.command.clone();
                Some((Err(RuntimeError::Io { command, source }), state))
            }
        }
    })
    .boxed()
}
