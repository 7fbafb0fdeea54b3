//! HTTP polling source and HTTP sink.

use async_trait::async_trait;
use std::time::Duration;

use super::{Message, Poller, Sink};
use crate::definition::Endpoint;
use crate::error::{ConfigError, DeliveryError, SourceError};

/// Shared client for HTTP adapters.
pub(crate) fn default_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_default()
}

fn request_timeout(endpoint: &Endpoint) -> Result<Option<Duration>, ConfigError> {
    endpoint.option_duration("timeout")
}

/// Polls a URL with GET.
///
/// A JSON array body yields one message per element, any other JSON body
/// yields one message, an empty body yields none.
pub struct HttpPoller {
    client: reqwest::Client,
    url: String,
    timeout: Option<Duration>,
}

impl HttpPoller {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            timeout: None,
        }
    }

    pub fn from_endpoint(client: reqwest::Client, endpoint: &Endpoint) -> Result<Self, ConfigError> {
        let mut poller = Self::new(client, endpoint.path.clone());
        poller.timeout = request_timeout(endpoint)?;
        Ok(poller)
    }

    fn failed(&self, reason: impl std::fmt::Display) -> SourceError {
        SourceError::Poll {
            uri: self.url.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl Poller for HttpPoller {
    async fn poll(&mut self) -> Result<Vec<Message>, SourceError> {
        let mut request = self.client.get(&self.url);
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await.map_err(|e| self.failed(e))?;
        let status_code = response.status().as_u16();
        if !response.status().is_success() {
            return Err(self.failed(format!("HTTP {} response", status_code)));
        }

        let text = response.text().await.map_err(|e| self.failed(e))?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let body: serde_json::Value =
            serde_json::from_str(&text).unwrap_or_else(|_| serde_json::json!(text));

        let items = match body {
            serde_json::Value::Array(items) => items,
            other => vec![other],
        };
        Ok(items
            .into_iter()
            .map(|payload| {
                Message::new(payload)
                    .with_metadata("url", serde_json::json!(self.url))
                    .with_metadata("status_code", serde_json::json!(status_code))
            })
            .collect())
    }
}

/// POSTs each payload as JSON. Non-2xx responses are rejections.
pub struct HttpSink {
    name: String,
    client: reqwest::Client,
    url: String,
    timeout: Option<Duration>,
}

impl HttpSink {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            name: url.clone(),
            client,
            url,
            timeout: None,
        }
    }

    pub fn from_endpoint(client: reqwest::Client, endpoint: &Endpoint) -> Result<Self, ConfigError> {
        let mut sink = Self::new(client, endpoint.path.clone());
        sink.timeout = request_timeout(endpoint)?;
        Ok(sink)
    }
}

#[async_trait]
impl Sink for HttpSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, message: &Message) -> Result<(), DeliveryError> {
        let mut request = self.client.post(&self.url).json(&message.payload);
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                DeliveryError::Timeout {
                    sink: self.name.clone(),
                    after: self.timeout.unwrap_or(Duration::from_secs(30)),
                }
            } else {
                DeliveryError::Unreachable {
                    sink: self.name.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(DeliveryError::Rejected {
                sink: self.name.clone(),
                reason: format!("HTTP {} response: {}", status.as_u16(), body.trim()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::parse_endpoint;
    use std::collections::BTreeMap;

    #[test]
    fn test_from_endpoint_keeps_full_url() {
        let mut extra = BTreeMap::new();
        extra.insert("timeout".to_string(), serde_json::json!("2s"));
        let ep = parse_endpoint("https://example.com/hook?x=1", extra).unwrap();

        let sink = HttpSink::from_endpoint(default_client(), &ep).unwrap();
        assert_eq!(sink.url, "https://example.com/hook?x=1");
        assert_eq!(sink.timeout, Some(Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn test_unreachable_sink() {
        let sink = HttpSink::new(default_client(), "http://127.0.0.1:1/hook");
        let err = sink.deliver(&Message::new(serde_json::json!(1))).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Unreachable { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_poller() {
        let mut poller = HttpPoller::new(default_client(), "http://127.0.0.1:1/feed");
        assert!(matches!(poller.poll().await, Err(SourceError::Poll { .. })));
    }
}
