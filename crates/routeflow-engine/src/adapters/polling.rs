//! Generic polling source and the file tail poller.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::time::{interval, Interval, MissedTickBehavior};

use super::{Message, Source};
use crate::error::SourceError;

/// A protocol client that can be asked for whatever arrived since the last call.
#[async_trait]
pub trait Poller: Send {
    async fn poll(&mut self) -> Result<Vec<Message>, SourceError>;
}

/// Turns a [`Poller`] into a [`Source`]: polls every `interval` and yields
/// the polled messages one at a time, in order.
pub struct PollingSource<P> {
    poller: P,
    interval: Interval,
    pending: VecDeque<Message>,
}

impl<P: Poller> PollingSource<P> {
    /// The first poll happens immediately.
    pub fn new(poller: P, every: Duration) -> Self {
        let mut interval = interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            poller,
            interval,
            pending: VecDeque::new(),
        }
    }
}

#[async_trait]
impl<P: Poller> Source for PollingSource<P> {
    async fn next(&mut self) -> Result<Option<Message>, SourceError> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                return Ok(Some(message));
            }
            self.interval.tick().await;
            self.pending.extend(self.poller.poll().await?);
        }
    }
}

/// Tails a file: one message per complete new line.
///
/// Lines that parse as JSON become structured payloads, the rest are strings.
/// A missing file yields nothing; a truncated file is read again from the start.
pub struct FileTailPoller {
    path: PathBuf,
    offset: u64,
    partial: Vec<u8>,
}

impl FileTailPoller {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            partial: Vec::new(),
        }
    }

    fn line_message(&self, line: &[u8]) -> Option<Message> {
        let text = String::from_utf8_lossy(line);
        let text = text.trim_end_matches('\r');
        if text.trim().is_empty() {
            return None;
        }
        let payload = serde_json::from_str(text).unwrap_or_else(|_| serde_json::json!(text));
        Some(
            Message::new(payload)
                .with_metadata("file", serde_json::json!(self.path.display().to_string())),
        )
    }
}

#[async_trait]
impl Poller for FileTailPoller {
    async fn poll(&mut self) -> Result<Vec<Message>, SourceError> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata().await?.len();
        if len < self.offset {
            tracing::debug!(path = %self.path.display(), "File truncated, reading from start");
            self.offset = 0;
            self.partial.clear();
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        file.seek(std::io::SeekFrom::Start(self.offset)).await?;
        let mut chunk = Vec::new();
        let read = file.read_to_end(&mut chunk).await?;
        self.offset += read as u64;
        self.partial.extend_from_slice(&chunk);

        let mut messages = Vec::new();
        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=pos).collect();
            if let Some(message) = self.line_message(&line[..line.len() - 1]) {
                messages.push(message);
            }
        }
        Ok(messages)
    }
}
