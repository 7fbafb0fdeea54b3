//! Source and sink adapters.
//!
//! The engine only talks to adapters through [`Source`] and [`Sink`].
//! Concrete kinds are looked up by endpoint scheme in the [`AdapterRegistry`].

mod channel;
mod file;
mod http;
mod log;
mod memory;
mod polling;
mod registry;
mod timer;

pub use self::channel::ChannelSource;
pub use self::file::FileSink;
pub use self::http::{HttpPoller, HttpSink};
pub use self::log::LogSink;
pub use self::memory::MemorySink;
pub use self::polling::{FileTailPoller, Poller, PollingSource};
pub use self::registry::{AdapterRegistry, SinkFactory, SourceFactory};
pub use self::timer::TimerSource;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{DeliveryError, SourceError};

/// A trigger event produced by a source, or a finished message handed to a sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub payload: serde_json::Value,

    /// Adapter-supplied metadata, exposed to templates as `meta`.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Message {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Lazy, possibly infinite sequence of trigger events.
#[async_trait]
pub trait Source: Send {
    /// Wait for the next message. `Ok(None)` means the source is exhausted.
    ///
    /// Must be cancel-safe: the route loop drops the future on shutdown.
    async fn next(&mut self) -> Result<Option<Message>, SourceError>;

    /// Release any resources held by the source.
    async fn close(&mut self) {}
}

/// Delivery target.
///
/// Delivery may be attempted more than once for the same message.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Name used in delivery errors and logs.
    fn name(&self) -> &str;

    async fn deliver(&self, message: &Message) -> Result<(), DeliveryError>;
}
