//! File sink.

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

use super::{Message, Sink};
use crate::definition::Endpoint;
use crate::error::{ConfigError, DeliveryError};

/// Appends one JSON line per delivered payload.
pub struct FileSink {
    name: String,
    path: PathBuf,
}

impl FileSink {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    pub fn from_endpoint(endpoint: &Endpoint) -> Result<Self, ConfigError> {
        if endpoint.path.trim().is_empty() {
            return Err(ConfigError::InvalidEndpoint {
                uri: endpoint.uri.clone(),
                message: "file path must not be empty".to_string(),
            });
        }
        Ok(Self::new(endpoint.uri.clone(), &endpoint.path))
    }

    fn unreachable(&self, e: impl std::fmt::Display) -> DeliveryError {
        DeliveryError::Unreachable {
            sink: self.name.clone(),
            reason: format!("{}: {}", self.path.display(), e),
        }
    }
}

#[async_trait]
impl Sink for FileSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, message: &Message) -> Result<(), DeliveryError> {
        let mut line = serde_json::to_vec(&message.payload).map_err(|e| DeliveryError::Rejected {
            sink: self.name.clone(),
            reason: e.to_string(),
        })?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.unreachable(e))?;
        file.write_all(&line).await.map_err(|e| self.unreachable(e))?;
        file.flush().await.map_err(|e| self.unreachable(e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let sink = FileSink::new("file:out", &path);

        sink.deliver(&Message::new(serde_json::json!({"a": 1}))).await.unwrap();
        sink.deliver(&Message::new(serde_json::json!("two"))).await.unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, "{\"a\":1}\n\"two\"\n");
    }

    #[tokio::test]
    async fn test_missing_directory_is_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new("file:bad", dir.path().join("missing").join("out.jsonl"));

        let err = sink.deliver(&Message::new(serde_json::json!(1))).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Unreachable { .. }));
    }
}
