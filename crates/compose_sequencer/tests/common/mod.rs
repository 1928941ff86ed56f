//! Test helpers: a scripted in-memory container runtime

#![allow(dead_code)]

use async_trait::async_trait;
use compose_sequencer::container::{
    ContainerHandle, ContainerRuntime, EventStream, LifecycleEvent, LineStream, LogStream,
    RuntimeError,
};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Scripted behaviour of one service's container
#[derive(Debug, Clone)]
pub struct ServiceScript {
    /// `start` fails for this service
    pub fail_start: bool,
    /// `logs` fails for this service
    pub fail_logs: bool,
    /// Termination code and delay after start; `None` keeps running
    pub exit: Option<(i64, Duration)>,
    /// Output lines, each with a delay after the previous one
    pub stdout: Vec<(Duration, String)>,
    pub stderr: Vec<(Duration, String)>,
    /// Keep log streams open after the last line, like `docker logs --follow`
    pub hold_logs_open: bool,
    /// Delay after start of a `die` event for some other container
    pub foreign_die: Option<Duration>,
}

impl Default for ServiceScript {
    fn default() -> Self {
        Self {
            fail_start: false,
            fail_logs: false,
            exit: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
            hold_logs_open: true,
            foreign_die: None,
        }
    }
}

impl ServiceScript {
    pub fn running() -> Self {
        Self::default()
    }

    pub fn exits(code: i64, after: Duration) -> Self {
        Self {
            exit: Some((code, after)),
            ..Default::default()
        }
    }

    pub fn failing_start() -> Self {
        Self {
            fail_start: true,
            ..Default::default()
        }
    }

    pub fn stdout(mut self, after: Duration, line: &str) -> Self {
        self.stdout.push((after, line.to_string()));
        self
    }

    pub fn stderr(mut self, after: Duration, line: &str) -> Self {
        self.stderr.push((after, line.to_string()));
        self
    }

    pub fn closing_logs(mut self) -> Self {
        self.hold_logs_open = false;
        self
    }

    pub fn failing_logs(mut self) -> Self {
        self.fail_logs = true;
        self
    }

    /// Also report another container terminating, as an unfiltered event feed would
    pub fn foreign_die(mut self, after: Duration) -> Self {
        self.foreign_die = Some(after);
        self
    }
}

/// Decrements the shared counter when the stream holding it is dropped
struct StreamGuard(Arc<AtomicUsize>);

impl StreamGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory [`ContainerRuntime`] driven by per-service scripts
#[derive(Default)]
pub struct MockRuntime {
    scripts: HashMap<String, ServiceScript>,
    started: Mutex<Vec<String>>,
    active_streams: Arc<AtomicUsize>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn service(mut self, name: &str, script: ServiceScript) -> Self {
        self.scripts.insert(name.to_string(), script);
        self
    }

    /// Services started so far, in order
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    /// Event and log streams that have not been dropped yet
    pub fn active_streams(&self) -> usize {
        self.active_streams.load(Ordering::SeqCst)
    }

    fn script(&self, service: &str) -> ServiceScript {
        self.scripts.get(service).cloned().unwrap_or_default()
    }

    fn scripted<T: Send + 'static>(
        &self,
        items: Vec<(Duration, T)>,
        hold_open: bool,
    ) -> BoxStream<'static, Result<T, RuntimeError>> {
        let guard = StreamGuard::new(&self.active_streams);

        futures::stream::unfold((items.into_iter(), guard), move |(mut items, guard)| async move {
            match items.next() {
                Some((delay, item)) => {
                    tokio::time::sleep(delay).await;
                    Some((Ok(item), (items, guard)))
                }
                None => {
                    if hold_open {
                        std::future::pending::<()>().await;
                    }
                    None
                }
            }
        })
        .boxed()
    }
}

pub fn handle(service: &str) -> ContainerHandle {
    ContainerHandle {
        service: service.to_string(),
        id: format!("{}-container", service),
        since: 0,
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn start(&self, service: &str) -> Result<ContainerHandle, RuntimeError> {
        if self.script(service).fail_start {
            return Err(RuntimeError::CommandFailed {
                command: format!("docker compose up {}", service),
                status: "exit status: 1".to_string(),
                stderr: "no such image".to_string(),
            });
        }
        self.started.lock().unwrap().push(service.to_string());
        Ok(handle(service))
    }

    async fn inspect(&self, handle: &ContainerHandle) -> Result<i64, RuntimeError> {
        Ok(self
            .script(&handle.service)
            .exit
            .map(|(code, _)| code)
            .unwrap_or_default())
    }

    async fn events(&self, handle: &ContainerHandle) -> Result<EventStream, RuntimeError> {
        let event = |action: &str, container: &str| LifecycleEvent {
            action: action.to_string(),
            container: container.to_string(),
        };
        let script = self.script(&handle.service);

        // Absolute offsets from start, turned into delays between events
        let mut timeline = vec![(Duration::ZERO, event("start", &handle.id))];
        if let Some(after) = script.foreign_die {
            timeline.push((after, event("die", "ffffffff0000")));
        }
        if let Some((_, after)) = script.exit {
            timeline.push((after, event("die", &handle.id)));
        }
        timeline.sort_by_key(|(at, _)| *at);

        let mut previous = Duration::ZERO;
        let events = timeline
            .into_iter()
            .map(|(at, event)| {
                let delay = at - previous;
                previous = at;
                (delay, event)
            })
            .collect();
        Ok(self.scripted(events, true))
    }

    async fn logs(
        &self,
        handle: &ContainerHandle,
        stream: LogStream,
    ) -> Result<LineStream, RuntimeError> {
        let script = self.script(&handle.service);
        if script.fail_logs {
            return Err(RuntimeError::NoContainer(handle.service.clone()));
        }

        let lines = match stream {
            LogStream::Stdout => script.stdout,
            LogStream::Stderr => script.stderr,
        };
        Ok(self.scripted(lines, script.hold_logs_open))
    }
}
