//! Per-route status for health introspection.

use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};

use crate::outcome::ExecutionResult;

/// Execution-loop state of a route.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteState {
    /// Waiting for the next trigger.
    #[default]
    Idle,
    /// A trigger is waiting for a concurrency slot.
    Triggered,
    /// The chain or delivery is executing.
    Running,
    /// The loop has ended.
    Stopped,
}

/// Snapshot of one route.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RouteStatus {
    pub name: String,
    pub state: RouteState,
    pub delivered: u64,
    pub filtered_out: u64,
    pub failed: u64,
    /// Triggers dropped because the route queue was full.
    pub dropped_triggers: u64,
    pub source_errors: u64,
    pub last_outcome: Option<String>,
    pub last_error: Option<String>,
    pub last_attempts: Option<u32>,
}

/// Shared, cheaply cloned status cell written by the route loop.
#[derive(Debug, Clone)]
pub struct StatusTracker {
    inner: Arc<Mutex<RouteStatus>>,
}

impl StatusTracker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RouteStatus {
                name: name.into(),
                ..RouteStatus::default()
            })),
        }
    }

    fn update(&self, f: impl FnOnce(&mut RouteStatus)) {
        f(&mut self.inner.lock().unwrap_or_else(PoisonError::into_inner));
    }

    pub fn snapshot(&self) -> RouteStatus {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_state(&self, state: RouteState) {
        self.update(|s| s.state = state);
    }

    pub fn record_dropped(&self) {
        self.update(|s| s.dropped_triggers += 1);
    }

    pub fn record_source_error(&self, error: &str) {
        self.update(|s| {
            s.source_errors += 1;
            s.last_error = Some(error.to_string());
        });
    }

    pub fn record(&self, result: &ExecutionResult) {
        self.update(|s| {
            match result {
                ExecutionResult::Delivered { .. } => s.delivered += 1,
                ExecutionResult::FilteredOut { .. } => s.filtered_out += 1,
                ExecutionResult::Failed { error, .. } => {
                    s.failed += 1;
                    s.last_error = Some(error.to_string());
                }
            }
            s.last_outcome = Some(result.label().to_string());
            s.last_attempts = Some(result.attempts());
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RouteError;

    #[test]
    fn test_record_outcomes() {
        let tracker = StatusTracker::new("alerts");
        tracker.record(&ExecutionResult::Delivered {
            attempts: 1,
            failed_sinks: vec![],
        });
        tracker.record(&ExecutionResult::FilteredOut {
            step: 0,
            reason: "condition is false".to_string(),
            attempts: 1,
        });
        tracker.record(&ExecutionResult::Failed {
            error: RouteError::Cancelled,
            attempts: 2,
        });
        tracker.record_dropped();

        let status = tracker.snapshot();
        assert_eq!(status.name, "alerts");
        assert_eq!((status.delivered, status.filtered_out, status.failed), (1, 1, 1));
        assert_eq!(status.dropped_triggers, 1);
        assert_eq!(status.last_outcome.as_deref(), Some("failed"));
        assert_eq!(status.last_attempts, Some(2));
        assert_eq!(status.last_error.as_deref(), Some("execution cancelled"));
    }

    #[test]
    fn test_state_serializes_lowercase() {
        let json = serde_json::to_value(RouteState::Triggered).unwrap();
        assert_eq!(json, serde_json::json!("triggered"));
    }
}
