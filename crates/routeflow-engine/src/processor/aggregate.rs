//! Cross-firing aggregation.

use routeflow_tools::MessageContext;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use super::StepOutcome;
use crate::definition::AggregateStrategy;
use crate::error::StepFailure;

#[derive(Default)]
struct Buffer {
    items: Vec<serde_json::Value>,
    started: Option<Instant>,
}

/// Buffers payloads across firings of a route.
///
/// While buffering, the firing ends filtered out. Once `max_size` items are
/// buffered, or `window` has elapsed since the first one, the aggregate
/// replaces the payload and the chain continues.
pub struct AggregateProcessor {
    strategy: AggregateStrategy,
    max_size: usize,
    window: Option<Duration>,
    buffer: Mutex<Buffer>,
}

impl AggregateProcessor {
    pub fn new(strategy: AggregateStrategy, max_size: usize, window: Option<Duration>) -> Self {
        Self {
            strategy,
            max_size,
            window,
            buffer: Mutex::new(Buffer::default()),
        }
    }

    pub fn process(&self, ctx: &mut MessageContext) -> Result<StepOutcome, StepFailure> {
        let items = {
            let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
            let started = *buffer.started.get_or_insert_with(Instant::now);
            buffer.items.push(ctx.payload.clone());

            let full = buffer.items.len() >= self.max_size;
            let expired = self.window.is_some_and(|w| started.elapsed() >= w);
            if !(full || expired) {
                return Ok(StepOutcome::Filtered(format!(
                    "buffered {} of {}",
                    buffer.items.len(),
                    self.max_size
                )));
            }

            buffer.started = None;
            std::mem::take(&mut buffer.items)
        };

        self.release(ctx, items);
        Ok(StepOutcome::Continue)
    }

    /// When the buffered window closes, if anything is buffered.
    pub fn deadline(&self) -> Option<Instant> {
        let buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        match (buffer.started, self.window) {
            (Some(started), Some(window)) if !buffer.items.is_empty() => Some(started + window),
            _ => None,
        }
    }

    /// Release the buffer into `ctx` if its window has closed.
    ///
    /// Returns false when there was nothing due.
    pub fn flush_expired(&self, ctx: &mut MessageContext) -> bool {
        let items = {
            let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
            let due = match (buffer.started, self.window) {
                (Some(started), Some(window)) => started.elapsed() >= window,
                _ => false,
            };
            if !due || buffer.items.is_empty() {
                return false;
            }
            buffer.started = None;
            std::mem::take(&mut buffer.items)
        };

        self.release(ctx, items);
        true
    }

    fn release(&self, ctx: &mut MessageContext, items: Vec<serde_json::Value>) {
        tracing::debug!(
            route = %ctx.route,
            strategy = %self.strategy,
            count = items.len(),
            "Aggregate released"
        );

        ctx.set_variable("aggregate_count", serde_json::json!(items.len()));
        ctx.payload = aggregate(self.strategy, items);
    }
}

fn numeric(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::Object(obj) => obj.get("value").and_then(serde_json::Value::as_f64),
        _ => None,
    }
}

fn aggregate(strategy: AggregateStrategy, items: Vec<serde_json::Value>) -> serde_json::Value {
    match strategy {
        AggregateStrategy::Collect => serde_json::Value::Array(items),
        AggregateStrategy::Count => serde_json::json!(items.len()),
        AggregateStrategy::Sum => serde_json::json!(items.iter().filter_map(numeric).sum::<f64>()),
        AggregateStrategy::Average => {
            let values: Vec<f64> = items.iter().filter_map(numeric).collect();
            if values.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::json!(values.iter().sum::<f64>() / values.len() as f64)
            }
        }
    }
}
