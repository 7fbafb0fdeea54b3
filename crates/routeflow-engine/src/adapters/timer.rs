//! Fixed-interval trigger.

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use super::{Message, Source};
use crate::config::parse_duration;
use crate::definition::Endpoint;
use crate::error::{ConfigError, SourceError};

/// Fires every `period`, the first tick one period after creation.
///
/// Ticks missed while the route is busy are delayed, never burst.
pub struct TimerSource {
    interval: Interval,
    period: Duration,
    payload: Option<serde_json::Value>,
    ticks: u64,
}

impl TimerSource {
    pub fn new(period: Duration, payload: Option<serde_json::Value>) -> Self {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            interval,
            period,
            payload,
            ticks: 0,
        }
    }

    /// `timer:<interval>` with an optional `payload` option.
    pub fn from_endpoint(endpoint: &Endpoint) -> Result<Self, ConfigError> {
        let period = parse_duration(&endpoint.path).map_err(|e| ConfigError::InvalidEndpoint {
            uri: endpoint.uri.clone(),
            message: e.to_string(),
        })?;
        if period.is_zero() {
            return Err(ConfigError::InvalidEndpoint {
                uri: endpoint.uri.clone(),
                message: "timer interval must be greater than zero".to_string(),
            });
        }
        Ok(Self::new(period, endpoint.options.get("payload").cloned()))
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

#[async_trait]
impl Source for TimerSource {
    async fn next(&mut self) -> Result<Option<Message>, SourceError> {
        self.interval.tick().await;
        self.ticks += 1;

        let timestamp = chrono::Utc::now().to_rfc3339();
        let payload = match &self.payload {
            Some(payload) => payload.clone(),
            None => serde_json::json!({"tick": self.ticks, "timestamp": timestamp}),
        };

        Ok(Some(
            Message::new(payload)
                .with_metadata("tick", serde_json::json!(self.ticks))
                .with_metadata("timestamp", serde_json::json!(timestamp)),
        ))
    }
}
