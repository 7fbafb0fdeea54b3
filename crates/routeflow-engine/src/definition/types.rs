//! Configuration document types.
//!
//! The YAML document deserializes into these structs; processors and error
//! handlers are closed tagged enums so unknown kinds and unknown parameters
//! are rejected at load time.

use routeflow_tools::OutputFormat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::{format_duration, EngineConfig};
use crate::logging::LogLevel;

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigDocument {
    /// Environment variables resolved before any route starts.
    #[serde(default)]
    pub env_vars: Vec<EnvVarSpec>,

    /// Global settings.
    #[serde(default)]
    pub settings: EngineConfig,

    /// Route declarations.
    #[serde(default)]
    pub routes: Vec<RouteSpec>,
}

/// A declared environment variable: bare name (required) or name with default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvVarSpec {
    Name(String),
    Detailed {
        name: String,
        #[serde(default)]
        default: Option<String>,
    },
}

impl EnvVarSpec {
    pub fn name(&self) -> &str {
        match self {
            EnvVarSpec::Name(name) => name,
            EnvVarSpec::Detailed { name, .. } => name,
        }
    }

    pub fn default_value(&self) -> Option<&str> {
        match self {
            EnvVarSpec::Name(_) => None,
            EnvVarSpec::Detailed { default, .. } => default.as_deref(),
        }
    }
}

/// One value or a list of values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(item) => vec![item],
            OneOrMany::Many(items) => items,
        }
    }

    pub fn as_slice(&self) -> &[T] {
        match self {
            OneOrMany::One(item) => std::slice::from_ref(item),
            OneOrMany::Many(items) => items,
        }
    }
}

/// Route declaration as written in the document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteSpec {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Trigger source.
    pub from: EndpointSpec,

    #[serde(default)]
    pub processors: Vec<ProcessorSpec>,

    /// Destination(s).
    pub to: OneOrMany<EndpointSpec>,

    #[serde(default)]
    pub error_handlers: Vec<ErrorHandlerSpec>,

    #[serde(default)]
    pub settings: RouteSettings,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Endpoint as written: a URI string or a URI with adapter options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EndpointSpec {
    Uri(String),
    Detailed {
        uri: String,
        #[serde(flatten)]
        options: BTreeMap<String, serde_json::Value>,
    },
}

impl EndpointSpec {
    pub fn uri(&self) -> &str {
        match self {
            EndpointSpec::Uri(uri) => uri,
            EndpointSpec::Detailed { uri, .. } => uri,
        }
    }

    pub fn options(&self) -> BTreeMap<String, serde_json::Value> {
        match self {
            EndpointSpec::Uri(_) => BTreeMap::new(),
            EndpointSpec::Detailed { options, .. } => options.clone(),
        }
    }
}

/// Per-route overrides of global settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteSettings {
    /// Timeout for external steps and sink deliveries.
    #[serde(default, with = "crate::config::duration::option")]
    pub timeout: Option<Duration>,

    /// Concurrency permits held per execution.
    #[serde(default)]
    pub weight: Option<u32>,

    /// Trigger queue bound.
    #[serde(default)]
    pub queue_depth: Option<usize>,
}

/// Aggregation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateStrategy {
    Collect,
    Sum,
    Average,
    Count,
}

impl std::fmt::Display for AggregateStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AggregateStrategy::Collect => "collect",
            AggregateStrategy::Sum => "sum",
            AggregateStrategy::Average => "average",
            AggregateStrategy::Count => "count",
        };
        write!(f, "{}", s)
    }
}

/// Processor step specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum ProcessorSpec {
    /// Render a template into the payload or a named variable.
    Transform {
        template: String,
        #[serde(default)]
        output: Option<String>,
        #[serde(default = "text_format")]
        format: OutputFormat,
    },

    /// Stop the chain unless a condition holds.
    Filter {
        #[serde(default)]
        condition: Option<String>,
        #[serde(default)]
        min_confidence: Option<f64>,
    },

    /// Run an out-of-process command.
    External {
        command: String,
        #[serde(default, with = "crate::config::duration::option")]
        timeout: Option<Duration>,
        #[serde(default = "routeflow_tools::tools::default_shell")]
        shell: String,
        #[serde(default)]
        cwd: Option<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default)]
        format: OutputFormat,
        #[serde(default)]
        output: Option<String>,
    },

    /// Emit a log event and pass the context through.
    Log {
        #[serde(default)]
        level: LogLevel,
        #[serde(default)]
        message: Option<String>,
    },

    /// Buffer payloads across firings and emit an aggregate.
    Aggregate {
        strategy: AggregateStrategy,
        #[serde(default = "default_max_size")]
        max_size: usize,
        #[serde(default, with = "crate::config::duration::option")]
        window: Option<Duration>,
    },
}

fn text_format() -> OutputFormat {
    OutputFormat::Text
}

fn default_max_size() -> usize {
    100
}

impl ProcessorSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            ProcessorSpec::Transform { .. } => "transform",
            ProcessorSpec::Filter { .. } => "filter",
            ProcessorSpec::External { .. } => "external",
            ProcessorSpec::Log { .. } => "log",
            ProcessorSpec::Aggregate { .. } => "aggregate",
        }
    }

    /// One-line description for dry runs.
    pub fn summary(&self) -> String {
        match self {
            ProcessorSpec::Transform {
                template, output, ..
            } => match output {
                Some(var) => format!("transform -> {}: {}", var, template),
                None => format!("transform: {}", template),
            },
            ProcessorSpec::Filter {
                condition,
                min_confidence,
            } => {
                let mut parts = Vec::new();
                if let Some(cond) = condition {
                    parts.push(cond.clone());
                }
                if let Some(min) = min_confidence {
                    parts.push(format!("confidence >= {}", min));
                }
                format!("filter: {}", parts.join(" and "))
            }
            ProcessorSpec::External {
                command, timeout, ..
            } => match timeout {
                Some(t) => format!("external ({}): {}", format_duration(*t), command),
                None => format!("external: {}", command),
            },
            ProcessorSpec::Log { level, .. } => format!("log ({})", level),
            ProcessorSpec::Aggregate {
                strategy,
                max_size,
                window,
            } => match window {
                Some(w) => format!(
                    "aggregate {} (max {}, window {})",
                    strategy,
                    max_size,
                    format_duration(*w)
                ),
                None => format!("aggregate {} (max {})", strategy, max_size),
            },
        }
    }
}

/// Retry delay growth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    #[default]
    Fixed,
    Exponential,
}

/// Which failures a retry handler retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryOn {
    #[default]
    Any,
    Timeout,
}

/// Error handler specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum ErrorHandlerSpec {
    Retry {
        #[serde(default = "default_max_attempts")]
        max_attempts: u32,
        #[serde(default = "default_retry_delay", with = "crate::config::duration")]
        delay: Duration,
        #[serde(default)]
        backoff: Backoff,
        #[serde(default = "default_multiplier")]
        multiplier: f64,
        #[serde(default = "default_max_delay", with = "crate::config::duration")]
        max_delay: Duration,
        #[serde(default)]
        on: RetryOn,
    },
    Notify {
        to: EndpointSpec,
        #[serde(default)]
        message: Option<String>,
    },
    Log {
        #[serde(default)]
        message: Option<String>,
    },
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

impl ErrorHandlerSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            ErrorHandlerSpec::Retry { .. } => "retry",
            ErrorHandlerSpec::Notify { .. } => "notify",
            ErrorHandlerSpec::Log { .. } => "log",
        }
    }
}

/// Resolved retry policy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryPolicy {
    /// Total attempts, the first run included.
    pub max_attempts: u32,
    #[serde(with = "crate::config::duration")]
    pub delay: Duration,
    pub backoff: Backoff,
    pub multiplier: f64,
    #[serde(with = "crate::config::duration")]
    pub max_delay: Duration,
    pub on: RetryOn,
}

impl RetryPolicy {
    /// Delay before attempt `failed_attempt + 1`.
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential => {
                let exponent = failed_attempt.saturating_sub(1).min(32) as i32;
                let secs = self.delay.as_secs_f64() * self.multiplier.powi(exponent);
                Duration::try_from_secs_f64(secs)
                    .unwrap_or(self.max_delay)
                    .min(self.max_delay)
            }
        }
    }
}

/// Resolved notify target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotifyPolicy {
    pub to: Endpoint,
    pub message: Option<String>,
}

/// Resolved failure log handler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureLogPolicy {
    pub message: Option<String>,
}

/// Error handlers of one route, at most one of each kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorHandlers {
    pub retry: Option<RetryPolicy>,
    pub notify: Option<NotifyPolicy>,
    pub log: Option<FailureLogPolicy>,
}

impl ErrorHandlers {
    pub fn max_attempts(&self) -> u32 {
        self.retry.as_ref().map(|r| r.max_attempts).unwrap_or(1)
    }
}

/// A parsed endpoint: adapter scheme, scheme-specific path and options.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Endpoint {
    /// Original (env-resolved) URI.
    pub uri: String,
    /// Adapter kind, lowercased.
    pub scheme: String,
    /// Everything after the scheme; for http(s) the full URL.
    pub path: String,
    /// Options from the query string and the endpoint object.
    pub options: BTreeMap<String, serde_json::Value>,
}

impl Endpoint {
    /// Option as a string (numbers and booleans are stringified).
    pub fn option_str(&self, key: &str) -> Option<String> {
        self.options.get(key).map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    /// Option as a duration.
    pub fn option_duration(&self, key: &str) -> Result<Option<Duration>, crate::error::ConfigError> {
        match self.options.get(key) {
            None => Ok(None),
            Some(serde_json::Value::Number(n)) => n
                .as_f64()
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                .map(Some)
                .ok_or_else(|| crate::error::ConfigError::InvalidDuration(n.to_string())),
            Some(serde_json::Value::String(s)) => crate::config::parse_duration(s).map(Some),
            Some(other) => Err(crate::error::ConfigError::InvalidDuration(other.to_string())),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.uri)
    }
}

/// Immutable, validated route definition.
///
/// Compared structurally on reload: a changed definition is stopped and
/// restarted, an equal one is left running.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteDefinition {
    pub name: String,
    pub description: Option<String>,
    pub enabled: bool,
    pub source: Endpoint,
    pub processors: Vec<ProcessorSpec>,
    pub sinks: Vec<Endpoint>,
    pub handlers: ErrorHandlers,
    /// Effective timeout for external steps, deliveries and notifications.
    #[serde(with = "crate::config::duration")]
    pub timeout: Duration,
    /// Permits acquired per execution.
    pub weight: u32,
    pub queue_depth: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processor_spec_tagged() {
        let yaml = "type: filter\ncondition: \"value > 10\"\n";
        let spec: ProcessorSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.kind(), "filter");
        assert_eq!(spec.summary(), "filter: value > 10");
    }

    #[test]
    fn test_processor_spec_rejects_unknown_kind() {
        let result: Result<ProcessorSpec, _> = serde_yaml::from_str("type: ocr\nlang: en\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_processor_spec_rejects_unknown_field() {
        let yaml = "type: transform\ntemplate: x\ntemplat: y\n";
        let result: Result<ProcessorSpec, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn test_external_defaults() {
        let yaml = "type: external\ncommand: \"detect {{ input_file }}\"\ntimeout: 10s\n";
        let spec: ProcessorSpec = serde_yaml::from_str(yaml).unwrap();
        match spec {
            ProcessorSpec::External {
                timeout,
                shell,
                format,
                ..
            } => {
                assert_eq!(timeout, Some(Duration::from_secs(10)));
                assert_eq!(shell, "sh");
                assert_eq!(format, OutputFormat::Json);
            }
            other => panic!("unexpected spec: {other:?}"),
        }
    }

    #[test]
    fn test_transform_defaults_to_text() {
        let spec: ProcessorSpec = serde_yaml::from_str("type: transform\ntemplate: x\n").unwrap();
        assert_eq!(
            spec,
            ProcessorSpec::Transform {
                template: "x".to_string(),
                output: None,
                format: OutputFormat::Text,
            }
        );
    }

    #[test]
    fn test_endpoint_spec_forms() {
        let spec: EndpointSpec = serde_yaml::from_str("\"log:info\"").unwrap();
        assert_eq!(spec.uri(), "log:info");
        assert!(spec.options().is_empty());

        let spec: EndpointSpec =
            serde_yaml::from_str("uri: \"timer:5s\"\npayload: x\n").unwrap();
        assert_eq!(spec.uri(), "timer:5s");
        assert_eq!(spec.options().get("payload"), Some(&serde_json::json!("x")));
    }

    #[test]
    fn test_to_one_or_many() {
        let one: OneOrMany<EndpointSpec> = serde_yaml::from_str("\"log:info\"").unwrap();
        assert_eq!(one.into_vec().len(), 1);

        let many: OneOrMany<EndpointSpec> =
            serde_yaml::from_str("- \"log:info\"\n- uri: \"file:/tmp/out\"\n").unwrap();
        assert_eq!(many.as_slice().len(), 2);
    }

    #[test]
    fn test_env_var_spec() {
        let specs: Vec<EnvVarSpec> =
            serde_yaml::from_str("- TOKEN\n- name: TARGET\n  default: \"log:info\"\n").unwrap();
        assert_eq!(specs[0].name(), "TOKEN");
        assert_eq!(specs[0].default_value(), None);
        assert_eq!(specs[1].name(), "TARGET");
        assert_eq!(specs[1].default_value(), Some("log:info"));
    }

    #[test]
    fn test_retry_defaults_and_backoff() {
        let spec: ErrorHandlerSpec =
            serde_yaml::from_str("type: retry\nbackoff: exponential\ndelay: 1s\nmax_delay: 5s\n")
                .unwrap();
        let ErrorHandlerSpec::Retry {
            max_attempts,
            delay,
            backoff,
            multiplier,
            max_delay,
            on,
        } = spec
        else {
            panic!("expected retry handler");
        };
        assert_eq!(max_attempts, 3);

        let policy = RetryPolicy {
            max_attempts,
            delay,
            backoff,
            multiplier,
            max_delay,
            on,
        };
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(4));
        assert_eq!(policy.delay_after(4), Duration::from_secs(5));
    }

    #[test]
    fn test_endpoint_options() {
        let mut options = BTreeMap::new();
        options.insert("interval".to_string(), serde_json::json!("250ms"));
        options.insert("limit".to_string(), serde_json::json!(3));
        let endpoint = Endpoint {
            uri: "file:/tmp/in".to_string(),
            scheme: "file".to_string(),
            path: "/tmp/in".to_string(),
            options,
        };
        assert_eq!(
            endpoint.option_duration("interval").unwrap(),
            Some(Duration::from_millis(250))
        );
        assert_eq!(endpoint.option_str("limit"), Some("3".to_string()));
        assert_eq!(endpoint.option_duration("missing").unwrap(), None);
    }
}
