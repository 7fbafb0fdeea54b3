//! Ordered processor chain.

use routeflow_tools::MessageContext;
use tokio::time::Instant;

use super::{validate_spec, Processor, StepOutcome, StepServices};
use crate::definition::ProcessorSpec;
use crate::error::{ConfigError, ProcessorError};

/// How a chain run ended.
#[derive(Debug)]
pub enum ChainOutcome {
    /// Every step continued.
    Completed,
    /// A step stopped the chain; not an error.
    FilteredOut { step: usize, reason: String },
    /// A step failed; later steps did not run.
    Failed(ProcessorError),
}

/// Compiled, immutable step list of one route.
pub struct ProcessorChain {
    steps: Vec<Processor>,
}

impl ProcessorChain {
    /// Validate and compile a route's processor specs.
    pub fn compile(
        route: &str,
        specs: &[ProcessorSpec],
        services: &StepServices,
    ) -> Result<Self, ConfigError> {
        let mut steps = Vec::with_capacity(specs.len());
        for (step, spec) in specs.iter().enumerate() {
            validate_spec(&services.templates, spec).map_err(|message| {
                ConfigError::InvalidProcessor {
                    route: route.to_string(),
                    step,
                    kind: spec.kind().to_string(),
                    message,
                }
            })?;
            steps.push(Processor::build(spec, services));
        }
        Ok(Self { steps })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Earliest aggregate window that will close, with its step index.
    pub fn next_flush(&self) -> Option<(usize, Instant)> {
        self.steps
            .iter()
            .enumerate()
            .filter_map(|(index, step)| match step {
                Processor::Aggregate(p) => p.deadline().map(|at| (index, at)),
                _ => None,
            })
            .min_by_key(|(_, at)| *at)
    }

    /// Release an expired aggregate buffer at `step` into `ctx`.
    pub fn flush(&self, step: usize, ctx: &mut MessageContext) -> bool {
        match self.steps.get(step) {
            Some(Processor::Aggregate(p)) => p.flush_expired(ctx),
            _ => false,
        }
    }

    /// Run steps `start..` in order, short-circuiting on the first stop or failure.
    pub async fn run_from(&self, start: usize, ctx: &mut MessageContext) -> ChainOutcome {
        for (index, step) in self.steps.iter().enumerate().skip(start) {
            tracing::trace!(
                route = %ctx.route,
                step = index,
                kind = step.kind(),
                attempt = ctx.attempt,
                "Running step"
            );

            match step.process(ctx).await {
                Ok(StepOutcome::Continue) => {}
                Ok(StepOutcome::Filtered(reason)) => {
                    return ChainOutcome::FilteredOut {
                        step: index,
                        reason,
                    }
                }
                Err(cause) => {
                    return ChainOutcome::Failed(ProcessorError::new(index, step.kind(), cause))
                }
            }
        }
        ChainOutcome::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn chain(yaml: &str) -> ProcessorChain {
        let specs: Vec<ProcessorSpec> = serde_yaml::from_str(yaml).unwrap();
        ProcessorChain::compile("test", &specs, &StepServices::new(Duration::from_secs(5))).unwrap()
    }

    #[tokio::test]
    async fn test_chain_completes() {
        let chain = chain(
            r#"
- type: transform
  template: "{{ value * 2 }}"
  output: doubled
- type: transform
  template: "value={{ value }} doubled={{ doubled }}"
"#,
        );
        let mut ctx = MessageContext::new("r", serde_json::json!({"value": 4}));

        assert!(matches!(chain.run_from(0, &mut ctx).await, ChainOutcome::Completed));
        assert_eq!(ctx.payload, serde_json::json!("value=4 doubled=8"));
    }

    #[tokio::test]
    async fn test_chain_short_circuits_on_filter() {
        let chain = chain(
            r#"
- type: filter
  condition: "value > 10"
- type: transform
  template: "never"
"#,
        );
        let mut ctx = MessageContext::new("r", serde_json::json!({"value": 5}));

        match chain.run_from(0, &mut ctx).await {
            ChainOutcome::FilteredOut { step, .. } => assert_eq!(step, 0),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(ctx.payload, serde_json::json!({"value": 5}));
    }

    #[tokio::test]
    async fn test_chain_reports_failed_step() {
        let chain = chain(
            r#"
- type: log
- type: transform
  template: "{{ missing }}"
- type: transform
  template: "never"
"#,
        );
        let mut ctx = MessageContext::new("r", serde_json::json!("x"));

        match chain.run_from(0, &mut ctx).await {
            ChainOutcome::Failed(err) => {
                assert_eq!(err.step, 1);
                assert_eq!(err.kind, "transform");
                assert!(!err.is_timeout());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(ctx.payload, serde_json::json!("x"));
    }

    #[tokio::test]
    async fn test_chain_resumes_from_step() {
        let chain = chain(
            r#"
- type: transform
  template: "first"
- type: transform
  template: "{{ payload }}+second"
"#,
        );
        let mut ctx = MessageContext::new("r", serde_json::json!("start"));

        assert!(matches!(chain.run_from(1, &mut ctx).await, ChainOutcome::Completed));
        assert_eq!(ctx.payload, serde_json::json!("start+second"));
    }

    #[test]
    fn test_compile_rejects_invalid_step() {
        let specs: Vec<ProcessorSpec> = serde_yaml::from_str("- type: filter\n").unwrap();
        let err = ProcessorChain::compile("r", &specs, &StepServices::new(Duration::from_secs(1)))
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::InvalidProcessor { step: 0, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_flush_points_at_aggregate_step() {
        let chain = chain(
            r#"
- type: log
- type: aggregate
  strategy: count
  window: 5s
- type: transform
  template: "count={{ payload }}"
"#,
        );
        assert!(chain.next_flush().is_none());

        let mut ctx = MessageContext::new("r", serde_json::json!("x"));
        assert!(matches!(chain.run_from(0, &mut ctx).await, ChainOutcome::FilteredOut { step: 1, .. }));

        let (step, at) = chain.next_flush().unwrap();
        assert_eq!(step, 1);
        tokio::time::sleep_until(at).await;

        let mut ctx = MessageContext::new("r", serde_json::Value::Null);
        assert!(!chain.flush(0, &mut ctx));
        assert!(chain.flush(1, &mut ctx));
        assert!(matches!(chain.run_from(2, &mut ctx).await, ChainOutcome::Completed));
        assert_eq!(ctx.payload, serde_json::json!("count=1"));
    }
}
