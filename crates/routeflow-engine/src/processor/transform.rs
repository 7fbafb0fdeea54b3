//! Template-based payload rewriting.

use routeflow_tools::{EvaluationError, MessageContext, OutputFormat, TemplateEngine};
use std::sync::Arc;

use super::StepOutcome;
use crate::error::StepFailure;

/// Renders a template and stores the result in the payload or a named variable.
pub struct TransformProcessor {
    templates: Arc<TemplateEngine>,
    template: String,
    output: Option<String>,
    format: OutputFormat,
}

impl TransformProcessor {
    pub fn new(
        templates: Arc<TemplateEngine>,
        template: String,
        output: Option<String>,
        format: OutputFormat,
    ) -> Self {
        Self {
            templates,
            template,
            output,
            format,
        }
    }

    pub fn process(&self, ctx: &mut MessageContext) -> Result<StepOutcome, StepFailure> {
        let rendered = self.templates.render_with_context(&self.template, ctx)?;

        let value = match self.format {
            OutputFormat::Text => serde_json::Value::String(rendered),
            OutputFormat::Json => serde_json::from_str(rendered.trim()).map_err(|e| {
                EvaluationError::TypeMismatch(format!("transform output is not valid JSON: {}", e))
            })?,
        };

        ctx.store(self.output.as_deref(), value);
        Ok(StepOutcome::Continue)
    }
}
