//! Conditional filtering.

use routeflow_tools::{MessageContext, TemplateEngine};
use std::sync::Arc;

use super::StepOutcome;
use crate::error::StepFailure;

/// Stops the chain unless the condition holds and the confidence threshold is met.
///
/// Fails closed: a condition that references an undefined variable filters the
/// message out instead of letting it through.
pub struct FilterProcessor {
    templates: Arc<TemplateEngine>,
    condition: Option<String>,
    min_confidence: Option<f64>,
}

impl FilterProcessor {
    pub fn new(
        templates: Arc<TemplateEngine>,
        condition: Option<String>,
        min_confidence: Option<f64>,
    ) -> Self {
        Self {
            templates,
            condition,
            min_confidence,
        }
    }

    pub fn process(&self, ctx: &mut MessageContext) -> Result<StepOutcome, StepFailure> {
        if let Some(min) = self.min_confidence {
            let confidence = ctx
                .get_variable("confidence")
                .or_else(|| ctx.payload_field("confidence"))
                .and_then(serde_json::Value::as_f64);
            match confidence {
                Some(c) if c >= min => {}
                Some(c) => {
                    return Ok(StepOutcome::Filtered(format!(
                        "confidence {} below {}",
                        c, min
                    )))
                }
                None => {
                    return Ok(StepOutcome::Filtered(
                        "no numeric confidence in message".to_string(),
                    ))
                }
            }
        }

        let Some(condition) = &self.condition else {
            return Ok(StepOutcome::Continue);
        };

        match self.templates.evaluate_with_context(condition, ctx) {
            Ok(true) => Ok(StepOutcome::Continue),
            Ok(false) => Ok(StepOutcome::Filtered(format!(
                "condition '{}' is false",
                condition
            ))),
            Err(e) if e.is_undefined() => {
                tracing::warn!(
                    route = %ctx.route,
                    condition = %condition,
                    error = %e,
                    "Filter condition references an undefined variable, filtering out"
                );
                Ok(StepOutcome::Filtered(format!(
                    "condition '{}' is undefined: {}",
                    condition, e
                )))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(condition: Option<&str>, min_confidence: Option<f64>) -> FilterProcessor {
        FilterProcessor::new(
            Arc::new(TemplateEngine::new()),
            condition.map(str::to_string),
            min_confidence,
        )
    }

    #[test]
    fn test_filter_condition() {
        let step = filter(Some("value > 10"), None);

        let mut low = MessageContext::new("r", serde_json::json!({"value": 5}));
        assert!(matches!(
            step.process(&mut low).unwrap(),
            StepOutcome::Filtered(_)
        ));

        let mut high = MessageContext::new("r", serde_json::json!({"value": 15}));
        assert_eq!(step.process(&mut high).unwrap(), StepOutcome::Continue);
    }

    #[test]
    fn test_filter_undefined_fails_closed() {
        let step = filter(Some("severity == 'high'"), None);
        let mut ctx = MessageContext::new("r", serde_json::json!({"value": 1}));
        assert!(matches!(
            step.process(&mut ctx).unwrap(),
            StepOutcome::Filtered(_)
        ));
    }

    #[test]
    fn test_filter_non_boolean_is_error() {
        let step = filter(Some("value"), None);
        let mut ctx = MessageContext::new("r", serde_json::json!({"value": 3}));
        assert!(matches!(
            step.process(&mut ctx),
            Err(StepFailure::Evaluation(_))
        ));
    }

    #[test]
    fn test_filter_min_confidence() {
        let step = filter(None, Some(0.5));

        let mut ctx = MessageContext::new("r", serde_json::json!({"confidence": 0.7}));
        assert_eq!(step.process(&mut ctx).unwrap(), StepOutcome::Continue);

        let mut ctx = MessageContext::new("r", serde_json::json!({"confidence": 0.2}));
        assert!(matches!(
            step.process(&mut ctx).unwrap(),
            StepOutcome::Filtered(_)
        ));

        let mut ctx = MessageContext::new("r", serde_json::json!("no confidence"));
        assert!(matches!(
            step.process(&mut ctx).unwrap(),
            StepOutcome::Filtered(_)
        ));
    }

    #[test]
    fn test_filter_reads_accumulated_variables() {
        let step = filter(Some("detection.label == 'cat'"), None);
        let mut ctx = MessageContext::new("r", serde_json::Value::Null);
        ctx.set_variable("detection", serde_json::json!({"label": "cat"}));
        assert_eq!(step.process(&mut ctx).unwrap(), StepOutcome::Continue);
    }
}
