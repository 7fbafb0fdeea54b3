//! routeflow tool library
//!
//! Building blocks shared by the route engine.
//!
//! This crate provides:
//! - Per-firing message context with cumulative variables
//! - Template and condition evaluation with Jinja2-compatible syntax
//! - External command execution with timeouts and structured output

pub mod context;
pub mod error;
pub mod result;
pub mod template;
pub mod tools;

pub use context::MessageContext;
pub use error::{EvaluationError, ToolError};
pub use result::{CommandOutput, OutputFormat};
pub use template::TemplateEngine;
