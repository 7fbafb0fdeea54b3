//! Terminal outcome of one route firing.

use crate::error::{DeliveryError, RouteError};

/// How a firing ended.
#[derive(Debug)]
pub enum ExecutionResult {
    /// The chain completed and at least one sink accepted the message.
    Delivered {
        attempts: u32,
        /// Sinks that failed while another one succeeded.
        failed_sinks: Vec<DeliveryError>,
    },
    /// A step stopped the chain. Never retried or notified.
    FilteredOut {
        step: usize,
        reason: String,
        attempts: u32,
    },
    /// Attempts were exhausted, or the execution was cancelled.
    Failed { error: RouteError, attempts: u32 },
}

impl ExecutionResult {
    /// Short outcome label (`delivered`, `filtered_out`, `failed`).
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionResult::Delivered { .. } => "delivered",
            ExecutionResult::FilteredOut { .. } => "filtered_out",
            ExecutionResult::Failed { .. } => "failed",
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            ExecutionResult::Delivered { attempts, .. }
            | ExecutionResult::FilteredOut { attempts, .. }
            | ExecutionResult::Failed { attempts, .. } => *attempts,
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, ExecutionResult::Delivered { .. })
    }

    pub fn is_filtered_out(&self) -> bool {
        matches!(self, ExecutionResult::FilteredOut { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ExecutionResult::Failed { .. })
    }

    pub fn error(&self) -> Option<&RouteError> {
        match self {
            ExecutionResult::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}
