//! Out-of-process step.

use routeflow_tools::tools::{ExternalCommand, ExternalTool};
use routeflow_tools::MessageContext;
use std::sync::Arc;
use std::time::Duration;

use super::StepOutcome;
use crate::error::StepFailure;

/// Runs a command against the serialized context and stores its structured result.
///
/// Always bounded: the timeout comes from the step, else from the route.
pub struct ExternalProcessor {
    tool: Arc<ExternalTool>,
    command: ExternalCommand,
    output: Option<String>,
}

impl ExternalProcessor {
    pub fn new(tool: Arc<ExternalTool>, command: ExternalCommand, output: Option<String>) -> Self {
        Self {
            tool,
            command,
            output,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.command.timeout
    }

    pub async fn process(&self, ctx: &mut MessageContext) -> Result<StepOutcome, StepFailure> {
        let value = self.tool.run(&self.command, ctx).await?;
        ctx.store(self.output.as_deref(), value);
        Ok(StepOutcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::ProcessorSpec;
    use crate::processor::{Processor, StepServices};

    fn external(yaml: &str) -> ExternalProcessor {
        let spec: ProcessorSpec = serde_yaml::from_str(yaml).unwrap();
        match Processor::build(&spec, &StepServices::new(Duration::from_secs(3))) {
            Processor::External(step) => step,
            _ => panic!("expected an external step"),
        }
    }

    #[test]
    fn test_timeout_falls_back_to_route() {
        assert_eq!(
            external("type: external\ncommand: cat\n").timeout(),
            Duration::from_secs(3)
        );
        assert_eq!(
            external("type: external\ncommand: cat\ntimeout: 500ms\n").timeout(),
            Duration::from_millis(500)
        );
    }

    #[tokio::test]
    async fn test_external_stores_output() {
        let step = external(
            r#"
type: external
command: "echo '{\"label\": \"cat\", \"confidence\": 0.9}'"
output: detection
"#,
        );
        let mut ctx = MessageContext::new("r", serde_json::json!("frame"));

        assert_eq!(step.process(&mut ctx).await.unwrap(), StepOutcome::Continue);
        assert_eq!(ctx.payload, serde_json::json!("frame"));
        assert_eq!(
            ctx.get_variable("detection"),
            Some(&serde_json::json!({"label": "cat", "confidence": 0.9}))
        );
    }

    #[tokio::test]
    async fn test_external_timeout_is_distinct() {
        let step = external("type: external\ncommand: \"sleep 5\"\ntimeout: 100ms\n");
        let mut ctx = MessageContext::new("r", serde_json::Value::Null);

        let err = step.process(&mut ctx).await.unwrap_err();
        assert!(matches!(err, StepFailure::Timeout(d) if d == Duration::from_millis(100)));
    }

    #[tokio::test]
    async fn test_external_non_zero_exit() {
        let step = external("type: external\ncommand: \"exit 1\"\n");
        let mut ctx = MessageContext::new("r", serde_json::Value::Null);

        let err = step.process(&mut ctx).await.unwrap_err();
        assert!(matches!(err, StepFailure::External(_)));
    }
}
