//! Configuration loader.
//!
//! Parses the YAML document, resolves declared environment variables and
//! turns every route declaration into an immutable [`RouteDefinition`].
//! All problems are reported at load time:
//! - unknown processor kinds and unknown processor parameters
//! - malformed templates and conditions
//! - missing environment variables without defaults
//! - duplicate route names, routes without destinations
//! - zero timeouts, out-of-range weights and queue depths

use regex::Regex;
use routeflow_tools::TemplateEngine;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use crate::config::EngineConfig;
use crate::definition::types::{
    ConfigDocument, Endpoint, EndpointSpec, EnvVarSpec, ErrorHandlerSpec, ErrorHandlers,
    FailureLogPolicy, NotifyPolicy, RetryPolicy, RouteDefinition, RouteSpec,
};
use crate::error::ConfigError;
use crate::processor;

/// Result of loading a configuration document.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub settings: EngineConfig,
    pub routes: Vec<RouteDefinition>,
    /// Resolved values of the declared environment variables.
    pub env: HashMap<String, String>,
}

/// Read a configuration file.
pub fn read_config(path: impl AsRef<Path>) -> Result<String, ConfigError> {
    let path = path.as_ref();
    std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Load a configuration file, resolving env vars from the process environment
/// and applying `ROUTEFLOW_*` setting overrides.
pub fn load_file(path: impl AsRef<Path>) -> Result<LoadedConfig, ConfigError> {
    let content = read_config(path)?;
    let mut loaded = parse_document(&content, |name| std::env::var(name).ok())?;

    loaded.settings.apply_env_overrides()?;
    if let Some(err) = loaded.settings.validate().into_iter().next() {
        return Err(err);
    }

    Ok(loaded)
}

/// Parse a YAML document, failing on the first problem.
pub fn parse_document<F>(yaml: &str, env_lookup: F) -> Result<LoadedConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let (loaded, errors) = build(yaml, &env_lookup);
    if let Some(err) = errors.into_iter().next() {
        return Err(err);
    }
    loaded.ok_or_else(|| ConfigError::Parse("empty configuration".to_string()))
}

/// Validate a YAML document, collecting every problem instead of stopping at the first.
pub fn validate_document<F>(yaml: &str, env_lookup: F) -> Vec<ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    build(yaml, &env_lookup).1
}

fn build<F>(yaml: &str, env_lookup: &F) -> (Option<LoadedConfig>, Vec<ConfigError>)
where
    F: Fn(&str) -> Option<String>,
{
    let document: ConfigDocument = match serde_yaml::from_str(yaml) {
        Ok(doc) => doc,
        Err(e) => return (None, vec![ConfigError::Parse(e.to_string())]),
    };

    let mut errors = document.settings.validate();
    let env = resolve_env(&document.env_vars, env_lookup, &mut errors);

    let resolver = RouteResolver::new(&document.settings, &env);
    let mut seen = HashSet::new();
    let mut routes = Vec::with_capacity(document.routes.len());

    for spec in &document.routes {
        if !seen.insert(spec.name.as_str()) {
            errors.push(ConfigError::DuplicateRoute(spec.name.clone()));
            continue;
        }
        match resolver.resolve(spec) {
            Ok(route) => routes.push(route),
            Err(mut route_errors) => errors.append(&mut route_errors),
        }
    }

    tracing::debug!(
        routes = routes.len(),
        env_vars = env.len(),
        problems = errors.len(),
        "Configuration parsed"
    );

    let loaded = LoadedConfig {
        settings: document.settings,
        routes,
        env,
    };
    (Some(loaded), errors)
}

fn resolve_env<F>(
    specs: &[EnvVarSpec],
    lookup: &F,
    errors: &mut Vec<ConfigError>,
) -> HashMap<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut env = HashMap::with_capacity(specs.len());
    for spec in specs {
        match lookup(spec.name()).or_else(|| spec.default_value().map(str::to_string)) {
            Some(value) => {
                env.insert(spec.name().to_string(), value);
            }
            None => errors.push(ConfigError::MissingEnvVar(spec.name().to_string())),
        }
    }
    env
}

/// Parse an endpoint URI (`scheme:target`, `scheme://target?k=v`).
///
/// Query options are merged with `extra`; `extra` wins on conflicts.
/// For `http`/`https` the whole URL, query included, is the path.
pub fn parse_endpoint(
    uri: &str,
    extra: BTreeMap<String, serde_json::Value>,
) -> Result<Endpoint, ConfigError> {
    let invalid = |message: &str| ConfigError::InvalidEndpoint {
        uri: uri.to_string(),
        message: message.to_string(),
    };

    let pattern = Regex::new(r"^([A-Za-z][A-Za-z0-9+.\-]*):(.*)$")
        .map_err(|e| invalid(&e.to_string()))?;
    let trimmed = uri.trim();
    let captures = pattern
        .captures(trimmed)
        .ok_or_else(|| invalid("expected '<scheme>:<target>'"))?;

    let scheme = captures[1].to_ascii_lowercase();
    let rest = &captures[2];

    let mut options = BTreeMap::new();
    let path = if scheme == "http" || scheme == "https" {
        trimmed.to_string()
    } else {
        let rest = rest.strip_prefix("//").unwrap_or(rest);
        match rest.split_once('?') {
            Some((path, query)) => {
                for pair in query.split('&').filter(|p| !p.is_empty()) {
                    match pair.split_once('=') {
                        Some((k, v)) => {
                            options.insert(k.to_string(), serde_json::json!(v));
                        }
                        None => {
                            options.insert(pair.to_string(), serde_json::Value::Bool(true));
                        }
                    }
                }
                path.to_string()
            }
            None => rest.to_string(),
        }
    };

    options.extend(extra);

    Ok(Endpoint {
        uri: trimmed.to_string(),
        scheme,
        path,
        options,
    })
}

/// Turns route declarations into definitions.
struct RouteResolver<'a> {
    settings: &'a EngineConfig,
    engine: TemplateEngine,
    env_context: HashMap<String, serde_json::Value>,
}

impl<'a> RouteResolver<'a> {
    fn new(settings: &'a EngineConfig, env: &HashMap<String, String>) -> Self {
        let mut env_context: HashMap<String, serde_json::Value> = env
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::json!(v)))
            .collect();
        env_context.insert("env".to_string(), serde_json::json!(env));

        Self {
            settings,
            engine: TemplateEngine::new(),
            env_context,
        }
    }

    fn resolve(&self, spec: &RouteSpec) -> Result<RouteDefinition, Vec<ConfigError>> {
        let route = spec.name.as_str();
        let mut errors = Vec::new();

        if route.trim().is_empty() {
            errors.push(ConfigError::InvalidRoute {
                route: route.to_string(),
                message: "name must not be empty".to_string(),
            });
        }

        let source = self
            .endpoint(&spec.from)
            .map_err(|e| errors.push(e))
            .ok();

        let sinks: Vec<Endpoint> = spec
            .to
            .as_slice()
            .iter()
            .filter_map(|to| self.endpoint(to).map_err(|e| errors.push(e)).ok())
            .collect();
        if spec.to.as_slice().is_empty() {
            errors.push(ConfigError::InvalidRoute {
                route: route.to_string(),
                message: "at least one destination ('to') is required".to_string(),
            });
        }

        for (step, processor) in spec.processors.iter().enumerate() {
            if let Err(message) = processor::validate_spec(&self.engine, processor) {
                errors.push(ConfigError::InvalidProcessor {
                    route: route.to_string(),
                    step,
                    kind: processor.kind().to_string(),
                    message,
                });
            }
        }

        let handlers = self.handlers(route, &spec.error_handlers, &mut errors);

        let timeout = spec
            .settings
            .timeout
            .unwrap_or(self.settings.default_timeout);
        if timeout.is_zero() {
            errors.push(ConfigError::InvalidRoute {
                route: route.to_string(),
                message: "timeout must be greater than zero".to_string(),
            });
        }

        let weight = spec.settings.weight.unwrap_or(1);
        if weight == 0 || weight as usize > self.settings.max_concurrent_routes {
            errors.push(ConfigError::InvalidRoute {
                route: route.to_string(),
                message: format!(
                    "weight must be between 1 and max_concurrent_routes ({}), got {}",
                    self.settings.max_concurrent_routes, weight
                ),
            });
        }

        let queue_depth = spec.settings.queue_depth.unwrap_or(self.settings.queue_depth);
        if queue_depth == 0 {
            errors.push(ConfigError::InvalidRoute {
                route: route.to_string(),
                message: "queue_depth must be at least 1".to_string(),
            });
        }

        match source {
            Some(source) if errors.is_empty() => Ok(RouteDefinition {
                name: spec.name.clone(),
                description: spec.description.clone(),
                enabled: spec.enabled,
                source,
                processors: spec.processors.clone(),
                sinks,
                handlers,
                timeout,
                weight,
                queue_depth,
            }),
            _ => Err(errors),
        }
    }

    /// Substitute env vars into the URI and options, then parse.
    fn endpoint(&self, spec: &EndpointSpec) -> Result<Endpoint, ConfigError> {
        let invalid = |e: routeflow_tools::EvaluationError| ConfigError::InvalidEndpoint {
            uri: spec.uri().to_string(),
            message: e.to_string(),
        };

        let uri = self
            .engine
            .render(spec.uri(), &self.env_context)
            .map_err(invalid)?;

        let mut options = BTreeMap::new();
        for (key, value) in spec.options() {
            let rendered = self
                .engine
                .render_value(&value, &self.env_context)
                .map_err(invalid)?;
            options.insert(key, rendered);
        }

        parse_endpoint(&uri, options)
    }

    fn handlers(
        &self,
        route: &str,
        specs: &[ErrorHandlerSpec],
        errors: &mut Vec<ConfigError>,
    ) -> ErrorHandlers {
        let mut handlers = ErrorHandlers::default();
        let mut seen = HashSet::new();
        let invalid = |message: String| ConfigError::InvalidRoute {
            route: route.to_string(),
            message,
        };

        for spec in specs {
            if !seen.insert(spec.kind()) {
                errors.push(invalid(format!(
                    "at most one '{}' error handler is allowed",
                    spec.kind()
                )));
                continue;
            }

            match spec {
                ErrorHandlerSpec::Retry {
                    max_attempts,
                    delay,
                    backoff,
                    multiplier,
                    max_delay,
                    on,
                } => {
                    if *max_attempts == 0 {
                        errors.push(invalid("retry max_attempts must be at least 1".to_string()));
                    }
                    if !multiplier.is_finite() || *multiplier < 1.0 {
                        errors.push(invalid(format!(
                            "retry multiplier must be a finite number >= 1.0, got {}",
                            multiplier
                        )));
                    }
                    handlers.retry = Some(RetryPolicy {
                        max_attempts: *max_attempts,
                        delay: *delay,
                        backoff: *backoff,
                        multiplier: *multiplier,
                        max_delay: *max_delay,
                        on: *on,
                    });
                }
                ErrorHandlerSpec::Notify { to, message } => {
                    if let Some(template) = message {
                        if let Err(e) = self.engine.check_template(template) {
                            errors.push(invalid(format!("notify message: {}", e)));
                        }
                    }
                    match self.endpoint(to) {
                        Ok(endpoint) => {
                            handlers.notify = Some(NotifyPolicy {
                                to: endpoint,
                                message: message.clone(),
                            })
                        }
                        Err(e) => errors.push(e),
                    }
                }
                ErrorHandlerSpec::Log { message } => {
                    if let Some(template) = message {
                        if let Err(e) = self.engine.check_template(template) {
                            errors.push(invalid(format!("log message: {}", e)));
                        }
                    }
                    handlers.log = Some(FailureLogPolicy {
                        message: message.clone(),
                    });
                }
            }
        }

        handlers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::types::{ProcessorSpec, RetryOn};
    use std::time::Duration;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    const SAMPLE: &str = r#"
env_vars:
  - ALERT_TARGET
  - name: LOG_TARGET
    default: "log:info"
settings:
  max_concurrent_routes: 4
  default_timeout: 30s
routes:
  - name: camera_alerts
    from: "timer:5s"
    processors:
      - type: external
        command: "echo '{}' {{ input_file }}"
        timeout: 10s
        output: detection
      - type: filter
        condition: "detection.confidence > 0.5"
      - type: transform
        template: "Alert: {{ detection.label }}"
    to:
      - "{{ LOG_TARGET }}"
      - "{{ ALERT_TARGET }}?retries=2"
    error_handlers:
      - type: retry
        max_attempts: 2
        delay: 1s
        on: timeout
      - type: notify
        to: "log:error"
        message: "route {{ route }} failed: {{ last_error }}"
    settings:
      timeout: 15s
      weight: 2
"#;

    fn sample_env(name: &str) -> Option<String> {
        (name == "ALERT_TARGET").then(|| "memory://alerts".to_string())
    }

    #[test]
    fn test_parse_sample() {
        let loaded = parse_document(SAMPLE, sample_env).unwrap();
        assert_eq!(loaded.settings.max_concurrent_routes, 4);
        assert_eq!(loaded.env.get("LOG_TARGET").map(String::as_str), Some("log:info"));

        let route = &loaded.routes[0];
        assert_eq!(route.name, "camera_alerts");
        assert_eq!(route.source.scheme, "timer");
        assert_eq!(route.source.path, "5s");
        assert_eq!(route.processors.len(), 3);
        assert_eq!(route.timeout, Duration::from_secs(15));
        assert_eq!(route.weight, 2);
        assert_eq!(route.queue_depth, 64);

        assert_eq!(route.sinks[0].scheme, "log");
        assert_eq!(route.sinks[0].path, "info");
        assert_eq!(route.sinks[1].scheme, "memory");
        assert_eq!(route.sinks[1].path, "alerts");
        assert_eq!(route.sinks[1].option_str("retries"), Some("2".to_string()));

        let retry = route.handlers.retry.as_ref().unwrap();
        assert_eq!(retry.max_attempts, 2);
        assert_eq!(retry.on, RetryOn::Timeout);
        assert_eq!(route.handlers.notify.as_ref().unwrap().to.scheme, "log");
        assert!(route.handlers.log.is_none());
    }

    #[test]
    fn test_missing_env_var() {
        let err = parse_document(SAMPLE, no_env).unwrap_err();
        assert_eq!(err, ConfigError::MissingEnvVar("ALERT_TARGET".to_string()));
    }

    #[test]
    fn test_single_destination_and_defaults() {
        let yaml = r#"
routes:
  - name: simple
    from: "timer:1s"
    to: "log:info"
"#;
        let loaded = parse_document(yaml, no_env).unwrap();
        let route = &loaded.routes[0];
        assert_eq!(route.sinks.len(), 1);
        assert!(route.enabled);
        assert_eq!(route.timeout, Duration::from_secs(30));
        assert_eq!(route.weight, 1);
        assert_eq!(route.handlers.max_attempts(), 1);
    }

    #[test]
    fn test_endpoint_object_options() {
        let yaml = r#"
routes:
  - name: ticker
    from:
      uri: "timer:5s"
      payload: "x"
    to: "log:info"
"#;
        let loaded = parse_document(yaml, no_env).unwrap();
        let source = &loaded.routes[0].source;
        assert_eq!(source.options.get("payload"), Some(&serde_json::json!("x")));
    }

    #[test]
    fn test_unknown_processor_kind_rejected() {
        let yaml = r#"
routes:
  - name: r
    from: "timer:1s"
    processors:
      - type: ocr
    to: "log:info"
"#;
        let err = parse_document(yaml, no_env).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_malformed_template_rejected() {
        let yaml = r#"
routes:
  - name: r
    from: "timer:1s"
    processors:
      - type: transform
        template: "{% if x %}never closed"
    to: "log:info"
"#;
        let err = parse_document(yaml, no_env).unwrap_err();
        match err {
            ConfigError::InvalidProcessor { route, step, kind, .. } => {
                assert_eq!(route, "r");
                assert_eq!(step, 0);
                assert_eq!(kind, "transform");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_validate_collects_all_problems() {
        let yaml = r#"
settings:
  max_concurrent_routes: 2
routes:
  - name: a
    from: "timer:1s"
    processors:
      - type: filter
      - type: external
        command: "run"
        timeout: 0
    to: []
    settings:
      weight: 5
  - name: a
    from: "timer:1s"
    to: "log:info"
"#;
        let errors = validate_document(yaml, no_env);
        assert!(errors.iter().any(|e| matches!(e, ConfigError::DuplicateRoute(n) if n == "a")));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ConfigError::InvalidProcessor { step: 0, .. })));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ConfigError::InvalidProcessor { step: 1, .. })));
        assert!(errors
            .iter()
            .any(|e| e.to_string().contains("at least one destination")));
        assert!(errors.iter().any(|e| e.to_string().contains("weight")));
    }

    #[test]
    fn test_duplicate_handler_rejected() {
        let yaml = r#"
routes:
  - name: r
    from: "timer:1s"
    to: "log:info"
    error_handlers:
      - type: retry
      - type: retry
        max_attempts: 5
"#;
        let err = parse_document(yaml, no_env).unwrap_err();
        assert!(err.to_string().contains("at most one 'retry'"));
    }

    #[test]
    fn test_zero_max_attempts_rejected() {
        let yaml = r#"
routes:
  - name: r
    from: "timer:1s"
    to: "log:info"
    error_handlers:
      - type: retry
        max_attempts: 0
"#;
        assert!(parse_document(yaml, no_env).is_err());
    }

    #[test]
    fn test_undefined_env_in_uri() {
        let yaml = r#"
routes:
  - name: r
    from: "timer:1s"
    to: "{{ NOT_DECLARED }}"
"#;
        let err = parse_document(yaml, no_env).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEndpoint { .. }));
    }

    #[test]
    fn test_parse_endpoint_forms() {
        let ep = parse_endpoint("file:///var/log/out.jsonl", BTreeMap::new()).unwrap();
        assert_eq!(ep.scheme, "file");
        assert_eq!(ep.path, "/var/log/out.jsonl");

        let ep = parse_endpoint("https://example.com/hook?x=1", BTreeMap::new()).unwrap();
        assert_eq!(ep.scheme, "https");
        assert_eq!(ep.path, "https://example.com/hook?x=1");
        assert!(ep.options.is_empty());

        let mut extra = BTreeMap::new();
        extra.insert("interval".to_string(), serde_json::json!("2s"));
        let ep = parse_endpoint("FILE:/tmp/in?interval=1s&follow", extra).unwrap();
        assert_eq!(ep.scheme, "file");
        assert_eq!(ep.path, "/tmp/in");
        assert_eq!(ep.options.get("interval"), Some(&serde_json::json!("2s")));
        assert_eq!(ep.options.get("follow"), Some(&serde_json::json!(true)));

        assert!(parse_endpoint("no scheme here", BTreeMap::new()).is_err());
    }

    #[test]
    fn test_disabled_route_loaded() {
        let yaml = r#"
routes:
  - name: paused
    enabled: false
    from: "timer:1s"
    processors:
      - type: log
    to: "log:info"
"#;
        let loaded = parse_document(yaml, no_env).unwrap();
        assert!(!loaded.routes[0].enabled);
        assert!(matches!(loaded.routes[0].processors[0], ProcessorSpec::Log { .. }));
    }
}
