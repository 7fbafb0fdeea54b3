//! Log sink.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{Message, Sink};
use crate::definition::Endpoint;
use crate::error::{ConfigError, DeliveryError};
use crate::logging::LogLevel;

/// Writes each message as a tracing event. Never fails.
pub struct LogSink {
    name: String,
    level: LogLevel,
    delivered: AtomicU64,
}

impl LogSink {
    pub fn new(name: impl Into<String>, level: LogLevel) -> Self {
        Self {
            name: name.into(),
            level,
            delivered: AtomicU64::new(0),
        }
    }

    /// `log:<level>`; an empty path means `info`.
    pub fn from_endpoint(endpoint: &Endpoint) -> Result<Self, ConfigError> {
        let level = LogLevel::parse(&endpoint.path).ok_or_else(|| ConfigError::InvalidEndpoint {
            uri: endpoint.uri.clone(),
            message: format!("unknown log level '{}'", endpoint.path),
        })?;
        Ok(Self::new(endpoint.uri.clone(), level))
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Sink for LogSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, message: &Message) -> Result<(), DeliveryError> {
        let text = match &message.payload {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        self.level.emit(&self.name, "sink", &text);
        self.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::parse_endpoint;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_log_sink() {
        let ep = parse_endpoint("log:warn", BTreeMap::new()).unwrap();
        let sink = LogSink::from_endpoint(&ep).unwrap();
        assert_eq!(sink.name(), "log:warn");

        sink.deliver(&Message::new(serde_json::json!("hello"))).await.unwrap();
        assert_eq!(sink.delivered(), 1);

        let ep = parse_endpoint("log:loud", BTreeMap::new()).unwrap();
        assert!(LogSink::from_endpoint(&ep).is_err());
    }
}
