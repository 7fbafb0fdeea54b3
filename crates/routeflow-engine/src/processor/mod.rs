//! Built-in processors and the processor chain.
//!
//! Each [`ProcessorSpec`] compiles into one [`Processor`]. A step either
//! continues with the (possibly updated) context, stops the chain, or fails
//! with a [`StepFailure`] that the chain wraps into a `ProcessorError`.

mod aggregate;
mod chain;
mod external;
mod filter;
mod log;
mod transform;

pub use self::aggregate::AggregateProcessor;
pub use self::chain::{ChainOutcome, ProcessorChain};
pub use self::external::ExternalProcessor;
pub use self::filter::FilterProcessor;
pub use self::log::LogProcessor;
pub use self::transform::TransformProcessor;

use routeflow_tools::tools::{ExternalCommand, ExternalTool};
use routeflow_tools::{MessageContext, TemplateEngine};
use std::sync::Arc;
use std::time::Duration;

use crate::definition::ProcessorSpec;
use crate::error::StepFailure;

/// Result of one successful step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Pass the context to the next step.
    Continue,
    /// Stop the chain; not an error.
    Filtered(String),
}

/// Shared services handed to processors at compile time.
#[derive(Clone)]
pub struct StepServices {
    pub templates: Arc<TemplateEngine>,
    pub tool: Arc<ExternalTool>,
    /// Route timeout, used by external steps without their own.
    pub default_timeout: Duration,
}

impl StepServices {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            templates: Arc::new(TemplateEngine::new()),
            tool: Arc::new(ExternalTool::new()),
            default_timeout,
        }
    }

    /// Same shared services with a different fallback timeout.
    pub fn with_timeout(&self, default_timeout: Duration) -> Self {
        Self {
            default_timeout,
            ..self.clone()
        }
    }
}

/// A compiled processor step.
pub enum Processor {
    Transform(TransformProcessor),
    Filter(FilterProcessor),
    External(ExternalProcessor),
    Log(LogProcessor),
    Aggregate(AggregateProcessor),
}

impl Processor {
    /// Build a step from its (already validated) spec.
    pub fn build(spec: &ProcessorSpec, services: &StepServices) -> Self {
        match spec {
            ProcessorSpec::Transform {
                template,
                output,
                format,
            } => Processor::Transform(TransformProcessor::new(
                services.templates.clone(),
                template.clone(),
                output.clone(),
                *format,
            )),
            ProcessorSpec::Filter {
                condition,
                min_confidence,
            } => Processor::Filter(FilterProcessor::new(
                services.templates.clone(),
                condition.clone(),
                *min_confidence,
            )),
            ProcessorSpec::External {
                command,
                timeout,
                shell,
                cwd,
                env,
                format,
                output,
            } => {
                let mut cmd = ExternalCommand::new(
                    command.clone(),
                    timeout.unwrap_or(services.default_timeout),
                );
                cmd.shell = shell.clone();
                cmd.cwd = cwd.clone();
                cmd.env = env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                cmd.format = *format;
                Processor::External(ExternalProcessor::new(
                    services.tool.clone(),
                    cmd,
                    output.clone(),
                ))
            }
            ProcessorSpec::Log { level, message } => Processor::Log(LogProcessor::new(
                services.templates.clone(),
                *level,
                message.clone(),
            )),
            ProcessorSpec::Aggregate {
                strategy,
                max_size,
                window,
            } => Processor::Aggregate(AggregateProcessor::new(*strategy, *max_size, *window)),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Processor::Transform(_) => "transform",
            Processor::Filter(_) => "filter",
            Processor::External(_) => "external",
            Processor::Log(_) => "log",
            Processor::Aggregate(_) => "aggregate",
        }
    }

    /// Run the step against the context.
    pub async fn process(&self, ctx: &mut MessageContext) -> Result<StepOutcome, StepFailure> {
        match self {
            Processor::Transform(p) => p.process(ctx),
            Processor::Filter(p) => p.process(ctx),
            Processor::External(p) => p.process(ctx).await,
            Processor::Log(p) => p.process(ctx),
            Processor::Aggregate(p) => p.process(ctx),
        }
    }
}

/// Structural validation of a processor spec.
///
/// Templates and conditions are parsed here so a malformed one is rejected
/// before any route starts.
pub fn validate_spec(templates: &TemplateEngine, spec: &ProcessorSpec) -> Result<(), String> {
    match spec {
        ProcessorSpec::Transform {
            template, output, ..
        } => {
            templates
                .check_template(template)
                .map_err(|e| format!("invalid template: {}", e))?;
            check_output_name(output)
        }
        ProcessorSpec::Filter {
            condition,
            min_confidence,
        } => {
            if condition.is_none() && min_confidence.is_none() {
                return Err("filter requires 'condition' or 'min_confidence'".to_string());
            }
            if let Some(cond) = condition {
                if cond.trim().is_empty() {
                    return Err("condition must not be empty".to_string());
                }
                templates
                    .check_condition(cond)
                    .map_err(|e| format!("invalid condition: {}", e))?;
            }
            match min_confidence {
                Some(min) if !min.is_finite() => {
                    Err(format!("min_confidence must be a finite number, got {}", min))
                }
                _ => Ok(()),
            }
        }
        ProcessorSpec::External {
            command,
            timeout,
            shell,
            env,
            output,
            ..
        } => {
            if command.trim().is_empty() {
                return Err("command must not be empty".to_string());
            }
            if shell.trim().is_empty() {
                return Err("shell must not be empty".to_string());
            }
            if matches!(timeout, Some(t) if t.is_zero()) {
                return Err("timeout must be greater than zero".to_string());
            }
            templates
                .check_template(command)
                .map_err(|e| format!("invalid command template: {}", e))?;
            for (key, value) in env {
                templates
                    .check_template(value)
                    .map_err(|e| format!("invalid template for env '{}': {}", key, e))?;
            }
            check_output_name(output)
        }
        ProcessorSpec::Log { message, .. } => match message {
            Some(template) => templates
                .check_template(template)
                .map(|_| ())
                .map_err(|e| format!("invalid message template: {}", e)),
            None => Ok(()),
        },
        ProcessorSpec::Aggregate {
            max_size, window, ..
        } => {
            if *max_size == 0 {
                return Err("max_size must be at least 1".to_string());
            }
            if matches!(window, Some(w) if w.is_zero()) {
                return Err("window must be greater than zero".to_string());
            }
            Ok(())
        }
    }
}

fn check_output_name(output: &Option<String>) -> Result<(), String> {
    match output {
        Some(name) if name.trim().is_empty() => Err("output must not be empty".to_string()),
        _ => Ok(()),
    }
}
