//! Evaluation and tool execution error types.

use std::time::Duration;
use thiserror::Error;

/// Errors raised while rendering a template or evaluating a condition.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EvaluationError {
    /// The template or expression could not be parsed.
    #[error("Malformed expression: {0}")]
    Syntax(String),

    /// A referenced variable is not present in the context.
    #[error("Undefined variable: {0}")]
    Undefined(String),

    /// An operation was applied to a value of the wrong type.
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    /// A condition produced something other than a boolean.
    #[error("Condition '{condition}' evaluated to {found}, expected a boolean")]
    NotBoolean { condition: String, found: String },

    /// Any other render failure.
    #[error("Render error: {0}")]
    Render(String),
}

impl EvaluationError {
    /// Returns true if the failure was caused by a missing variable.
    pub fn is_undefined(&self) -> bool {
        matches!(self, EvaluationError::Undefined(_))
    }
}

impl From<minijinja::Error> for EvaluationError {
    fn from(e: minijinja::Error) -> Self {
        use minijinja::ErrorKind;

        let message = match e.detail() {
            Some(detail) => format!("{}: {}", e.kind(), detail),
            None => e.kind().to_string(),
        };
        match e.kind() {
            ErrorKind::SyntaxError | ErrorKind::BadEscape => EvaluationError::Syntax(message),
            ErrorKind::UndefinedError => EvaluationError::Undefined(message),
            ErrorKind::InvalidOperation | ErrorKind::BadSerialization => {
                EvaluationError::TypeMismatch(message)
            }
            _ => EvaluationError::Render(message),
        }
    }
}

/// Errors that can occur while running an external command.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The command could not be started.
    #[error("Failed to spawn process: {0}")]
    Spawn(String),

    /// The command did not finish within its timeout.
    #[error("Execution timed out after {0:?}")]
    Timeout(Duration),

    /// The command exited with a non-zero status.
    #[error("Command exited with code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    /// The command's output could not be interpreted.
    #[error("Malformed output: {0}")]
    MalformedOutput(String),

    /// Template rendering of the command or its environment failed.
    #[error("Template error: {0}")]
    Template(#[from] EvaluationError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(String),
}

impl ToolError {
    /// Returns true if the command was stopped because it ran out of time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ToolError::Timeout(_))
    }
}

impl From<std::io::Error> for ToolError {
    fn from(e: std::io::Error) -> Self {
        ToolError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for ToolError {
    fn from(e: serde_json::Error) -> Self {
        ToolError::Json(e.to_string())
    }
}
