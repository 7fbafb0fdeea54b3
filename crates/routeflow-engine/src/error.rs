//! Error types for the route engine.

use routeflow_tools::{EvaluationError, ToolError};
use std::time::Duration;
use thiserror::Error;

/// Load-time configuration errors.
///
/// Never retried: a route with a configuration error is not started.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    /// The document is not valid YAML or does not match the schema.
    #[error("Parse error: {0}")]
    Parse(String),

    /// The configuration file could not be read.
    #[error("Failed to read '{path}': {message}")]
    Io { path: String, message: String },

    /// Two routes share a name.
    #[error("Duplicate route name: {0}")]
    DuplicateRoute(String),

    /// A route-level problem (missing sinks, bad settings, ...).
    #[error("Route '{route}': {message}")]
    InvalidRoute { route: String, message: String },

    /// A processor step is structurally invalid.
    #[error("Route '{route}': step {step} ({kind}): {message}")]
    InvalidProcessor {
        route: String,
        step: usize,
        kind: String,
        message: String,
    },

    /// No adapter is registered for the endpoint scheme.
    #[error("Route '{route}': unknown {role} adapter kind '{scheme}'")]
    UnknownAdapter {
        route: String,
        role: String,
        scheme: String,
    },

    /// An endpoint could not be parsed or its adapter could not be built.
    #[error("Invalid endpoint '{uri}': {message}")]
    InvalidEndpoint { uri: String, message: String },

    /// A declared environment variable is absent and has no default.
    #[error("Required environment variable '{0}' is not set and has no default")]
    MissingEnvVar(String),

    /// A global setting is out of range.
    #[error("Invalid setting: {0}")]
    InvalidSetting(String),

    /// A duration string could not be parsed.
    #[error("Invalid duration '{0}': expected seconds or a number with ms/s/m/h suffix")]
    InvalidDuration(String),
}

/// Root cause of a failed processor step.
#[derive(Debug, Error)]
pub enum StepFailure {
    /// Template or condition evaluation failed.
    #[error(transparent)]
    Evaluation(EvaluationError),

    /// The step ran out of time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The external command failed.
    #[error(transparent)]
    External(ToolError),
}

impl From<EvaluationError> for StepFailure {
    fn from(e: EvaluationError) -> Self {
        StepFailure::Evaluation(e)
    }
}

impl From<ToolError> for StepFailure {
    fn from(e: ToolError) -> Self {
        match e {
            ToolError::Timeout(after) => StepFailure::Timeout(after),
            ToolError::Template(inner) => StepFailure::Evaluation(inner),
            other => StepFailure::External(other),
        }
    }
}

/// A processor step failed.
#[derive(Debug, Error)]
#[error("step {step} ({kind}) failed: {cause}")]
pub struct ProcessorError {
    /// Index of the failed step in the chain (0-based).
    pub step: usize,

    /// Processor kind (`transform`, `filter`, ...).
    pub kind: &'static str,

    /// Root cause.
    #[source]
    pub cause: StepFailure,
}

impl ProcessorError {
    pub fn new(step: usize, kind: &'static str, cause: impl Into<StepFailure>) -> Self {
        Self {
            step,
            kind,
            cause: cause.into(),
        }
    }

    /// Returns true if this is a timeout (slow/unavailable rather than invalid).
    pub fn is_timeout(&self) -> bool {
        matches!(self.cause, StepFailure::Timeout(_))
    }
}

/// A sink rejected a message or could not be reached.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DeliveryError {
    #[error("sink '{sink}' rejected the message: {reason}")]
    Rejected { sink: String, reason: String },

    #[error("sink '{sink}' is unreachable: {reason}")]
    Unreachable { sink: String, reason: String },

    #[error("sink '{sink}' timed out after {after:?}")]
    Timeout { sink: String, after: Duration },
}

impl DeliveryError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, DeliveryError::Timeout { .. })
    }
}

/// A source adapter failed to produce the next message.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("poll of '{uri}' failed: {reason}")]
    Poll { uri: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Terminal failure of one route firing.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error(transparent)]
    Processor(#[from] ProcessorError),

    /// Every declared sink failed.
    #[error("all sinks failed: {}", join_errors(.0))]
    Delivery(Vec<DeliveryError>),

    /// The engine cancelled the execution.
    #[error("execution cancelled")]
    Cancelled,

    /// A step or sink panicked.
    #[error("execution panicked: {0}")]
    Panicked(String),
}

impl RouteError {
    /// True for processor timeouts and for delivery failures caused only by timeouts.
    pub fn is_timeout(&self) -> bool {
        match self {
            RouteError::Processor(e) => e.is_timeout(),
            RouteError::Delivery(errors) => {
                !errors.is_empty() && errors.iter().all(DeliveryError::is_timeout)
            }
            RouteError::Cancelled | RouteError::Panicked(_) => false,
        }
    }
}

/// Engine lifecycle errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("engine is already running")]
    AlreadyRunning,

    #[error("engine is not running")]
    NotRunning,
}

fn join_errors(errors: &[DeliveryError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Render an error followed by each of its sources.
pub fn error_chain(err: &dyn std::error::Error) -> Vec<String> {
    let mut chain = vec![err.to_string()];
    let mut current = err.source();
    while let Some(source) = current {
        chain.push(source.to_string());
        current = source.source();
    }
    chain
}
