//! Follow-mode file reader

use super::MonitorError;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Streams the lines of a file as they are written.
///
/// Reading starts at the beginning of the file. A file that does not exist
/// yet is polled for until it appears; a file that shrinks, disappears or is
/// replaced by a new file at the same path (rename rotation) is reopened from
/// the start. A trailing line without a newline is held back
/// until it is completed.
#[derive(Debug, Clone)]
pub struct FileTail {
    path: PathBuf,
    poll_interval: Duration,
}

struct TailState {
    path: PathBuf,
    poll_interval: Duration,
    reader: Option<BufReader<File>>,
    /// Device and inode of the open file
    identity: Option<(u64, u64)>,
    position: u64,
    partial: Vec<u8>,
    failed: bool,
}

impl TailState {
    fn reset(&mut self) {
        self.reader = None;
        self.identity = None;
        self.position = 0;
        self.partial.clear();
    }

    fn error(&mut self, source: std::io::Error) -> MonitorError {
        self.failed = true;
        MonitorError::Tail {
            path: self.path.display().to_string(),
            source,
        }
    }

    /// Next complete line, waiting for one to be written
    async fn next_line(&mut self) -> Result<String, MonitorError> {
        loop {
            if self.reader.is_none() {
                match File::open(&self.path).await {
                    Ok(file) => {
                        log::debug!("Following {}", self.path.display());
                        self.identity = file.metadata().await.ok().as_ref().and_then(identity);
                        self.reader = Some(BufReader::new(file));
                    }
                    Err(e) if e.kind() == ErrorKind::NotFound => {
                        tokio::time::sleep(self.poll_interval).await;
                        continue;
                    }
                    Err(e) => return Err(self.error(e)),
                }
            }
            let Some(reader) = self.reader.as_mut() else {
                continue;
            };

            let read = match reader.read_until(b'\n', &mut self.partial).await {
                Ok(read) => read,
                Err(e) => return Err(self.error(e)),
            };
            self.position += read as u64;

            if read > 0 {
                if self.partial.last() == Some(&b'\n') {
                    let mut line = std::mem::take(&mut self.partial);
                    while matches!(line.last(), Some(b'\n' | b'\r')) {
                        line.pop();
                    }
                    return Ok(String::from_utf8_lossy(&line).into_owned());
                }
                continue;
            }

            // At end of file: detect truncation, replacement or removal, then wait
            match tokio::fs::metadata(&self.path).await {
                Ok(meta) if meta.len() < self.position => {
                    log::debug!("{} was truncated, reopening", self.path.display());
                    self.reset();
                    continue;
                }
                Ok(meta) if self.identity.is_some() && identity(&meta) != self.identity => {
                    log::debug!("{} was replaced, reopening", self.path.display());
                    self.reset();
                    continue;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    log::debug!("{} was removed, waiting for it to reappear", self.path.display());
                    self.reset();
                    continue;
                }
                _ => {}
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(unix)]
fn identity(meta: &std::fs::Metadata) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    Some((meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn identity(_: &std::fs::Metadata) -> Option<(u64, u64)> {
    None
}

impl FileTail {
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            path: path.into(),
            poll_interval,
        }
    }

    /// Endless stream of lines; ends only after an I/O error has been yielded
    pub fn into_stream(self) -> BoxStream<'static, Result<String, MonitorError>> {
        let state = TailState {
            path: self.path,
            poll_interval: self.poll_interval,
            reader: None,
            identity: None,
            position: 0,
            partial: Vec::new(),
            failed: false,
        };

        futures::stream::unfold(state, |mut state| async move {
            if state.failed {
                return None;
            }
            let line = state.next_line().await;
            Some((line, state))
        })
        .boxed()
    }
}
