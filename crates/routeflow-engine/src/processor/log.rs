//! Debug logging step.

use routeflow_tools::{MessageContext, TemplateEngine};
use std::sync::Arc;

use super::StepOutcome;
use crate::error::StepFailure;
use crate::logging::LogLevel;

/// Emits a log event and passes the context through unchanged.
pub struct LogProcessor {
    templates: Arc<TemplateEngine>,
    level: LogLevel,
    message: Option<String>,
}

impl LogProcessor {
    pub fn new(templates: Arc<TemplateEngine>, level: LogLevel, message: Option<String>) -> Self {
        Self {
            templates,
            level,
            message,
        }
    }

    /// Text that would be logged for this context.
    pub fn render(&self, ctx: &MessageContext) -> Result<String, StepFailure> {
        match &self.message {
            Some(template) => Ok(self.templates.render_with_context(template, ctx)?),
            None => Ok(match &ctx.payload {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
        }
    }

    pub fn process(&self, ctx: &mut MessageContext) -> Result<StepOutcome, StepFailure> {
        let message = self.render(ctx)?;
        self.level.emit(&ctx.route, "processor", &message);
        Ok(StepOutcome::Continue)
    }
}
