//! Global engine settings.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Global engine settings (the `settings` block of the configuration document).
///
/// Every field can be overridden from the environment with the `ROUTEFLOW_` prefix:
/// - `ROUTEFLOW_MAX_CONCURRENT_ROUTES`
/// - `ROUTEFLOW_DEFAULT_TIMEOUT_SECS`
/// - `ROUTEFLOW_QUEUE_DEPTH`
/// - `ROUTEFLOW_SHUTDOWN_GRACE_SECS`
/// - `ROUTEFLOW_LOG_LEVEL`
/// - `ROUTEFLOW_LOG_FORMAT`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Size of the global concurrency semaphore.
    #[serde(default = "default_max_concurrent_routes")]
    pub max_concurrent_routes: usize,

    /// Timeout for steps and deliveries when a route does not set one.
    #[serde(default = "default_timeout", with = "duration")]
    pub default_timeout: Duration,

    /// Per-route trigger queue bound.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// How long `stop` waits for in-flight executions.
    #[serde(default = "default_shutdown_grace", with = "duration")]
    pub shutdown_grace: Duration,

    /// Default log filter when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_max_concurrent_routes() -> usize {
    10
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_queue_depth() -> usize {
    64
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Environment overrides, all optional.
#[derive(Debug, Default, Deserialize)]
struct EnvOverrides {
    max_concurrent_routes: Option<usize>,
    default_timeout_secs: Option<u64>,
    queue_depth: Option<usize>,
    shutdown_grace_secs: Option<u64>,
    log_level: Option<String>,
    log_format: Option<LogFormat>,
}

impl EngineConfig {
    /// Apply `ROUTEFLOW_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        let overrides = envy::prefixed("ROUTEFLOW_")
            .from_env::<EnvOverrides>()
            .map_err(|e| ConfigError::InvalidSetting(e.to_string()))?;
        self.merge(overrides);
        Ok(())
    }

    /// Apply overrides from an explicit set of variables.
    pub fn apply_overrides_from<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let overrides = envy::prefixed("ROUTEFLOW_")
            .from_iter::<_, EnvOverrides>(vars)
            .map_err(|e| ConfigError::InvalidSetting(e.to_string()))?;
        self.merge(overrides);
        Ok(())
    }

    fn merge(&mut self, overrides: EnvOverrides) {
        if let Some(v) = overrides.max_concurrent_routes {
            self.max_concurrent_routes = v;
        }
        if let Some(v) = overrides.default_timeout_secs {
            self.default_timeout = Duration::from_secs(v);
        }
        if let Some(v) = overrides.queue_depth {
            self.queue_depth = v;
        }
        if let Some(v) = overrides.shutdown_grace_secs {
            self.shutdown_grace = Duration::from_secs(v);
        }
        if let Some(v) = overrides.log_level {
            self.log_level = v;
        }
        if let Some(v) = overrides.log_format {
            self.log_format = v;
        }
    }

    /// Check ranges; returns every problem found.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        if self.max_concurrent_routes == 0 {
            errors.push(ConfigError::InvalidSetting(
                "max_concurrent_routes must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent_routes > tokio::sync::Semaphore::MAX_PERMITS {
            errors.push(ConfigError::InvalidSetting(format!(
                "max_concurrent_routes must not exceed {}",
                tokio::sync::Semaphore::MAX_PERMITS
            )));
        }
        if self.default_timeout.is_zero() {
            errors.push(ConfigError::InvalidSetting(
                "default_timeout must be greater than zero".to_string(),
            ));
        }
        if self.queue_depth == 0 {
            errors.push(ConfigError::InvalidSetting(
                "queue_depth must be at least 1".to_string(),
            ));
        }
        errors
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_routes: default_max_concurrent_routes(),
            default_timeout: default_timeout(),
            queue_depth: default_queue_depth(),
            shutdown_grace: default_shutdown_grace(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

/// Parse a duration: plain seconds (`5`, `0.5`) or a number with a
/// `ms`, `s`, `m` or `h` suffix (`500ms`, `5s`, `1m`).
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let s = input.trim();
    let invalid = || ConfigError::InvalidDuration(input.to_string());

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let value: f64 = number.parse().map_err(|_| invalid())?;

    let seconds = match unit.trim() {
        "" | "s" => value,
        "ms" => value / 1000.0,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => return Err(invalid()),
    };

    Duration::try_from_secs_f64(seconds).map_err(|_| invalid())
}

/// Format a duration in the shortest unit that represents it exactly.
pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis % 1000 != 0 {
        format!("{}ms", millis)
    } else if millis % 3_600_000 == 0 && millis > 0 {
        format!("{}h", millis / 3_600_000)
    } else if millis % 60_000 == 0 && millis > 0 {
        format!("{}m", millis / 60_000)
    } else {
        format!("{}s", millis / 1000)
    }
}

/// Serde helpers for durations written as seconds or suffixed strings.
pub mod duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(f64),
        Text(String),
    }

    fn from_raw<E: serde::de::Error>(raw: Raw) -> Result<Duration, E> {
        match raw {
            Raw::Seconds(secs) => Duration::try_from_secs_f64(secs)
                .map_err(|_| E::custom(format!("invalid duration: {}", secs))),
            Raw::Text(text) => super::parse_duration(&text).map_err(E::custom),
        }
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        from_raw(Raw::deserialize(deserializer)?)
    }

    /// Same format for optional fields.
    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => serializer.serialize_str(&crate::config::format_duration(*d)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<Raw>::deserialize(deserializer)?
                .map(from_raw)
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_routes, 10);
        assert_eq!(config.default_timeout, Duration::from_secs(30));
        assert_eq!(config.queue_depth, 64);
        assert_eq!(config.log_format, LogFormat::Text);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("5").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("0.5").unwrap(), Duration::from_millis(500));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("5 days").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
        assert_eq!(format_duration(Duration::from_secs(5)), "5s");
        assert_eq!(format_duration(Duration::from_secs(120)), "2m");
        assert_eq!(format_duration(Duration::from_secs(3600)), "1h");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }

    #[test]
    fn test_settings_from_yaml() {
        let yaml = "max_concurrent_routes: 4\ndefault_timeout: 15s\nshutdown_grace: 2\nlog_format: json\n";
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.max_concurrent_routes, 4);
        assert_eq!(config.default_timeout, Duration::from_secs(15));
        assert_eq!(config.shutdown_grace, Duration::from_secs(2));
        assert_eq!(config.queue_depth, 64);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_settings_reject_unknown_field() {
        let result: Result<EngineConfig, _> = serde_yaml::from_str("max_routes: 4\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let config = EngineConfig {
            default_timeout: Duration::ZERO,
            queue_depth: 0,
            ..EngineConfig::default()
        };
        assert_eq!(config.validate().len(), 2);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = EngineConfig::default();
        config
            .apply_overrides_from(vec![
                ("ROUTEFLOW_MAX_CONCURRENT_ROUTES".to_string(), "3".to_string()),
                ("ROUTEFLOW_DEFAULT_TIMEOUT_SECS".to_string(), "7".to_string()),
                ("ROUTEFLOW_LOG_LEVEL".to_string(), "debug".to_string()),
                ("UNRELATED".to_string(), "x".to_string()),
            ])
            .unwrap();
        assert_eq!(config.max_concurrent_routes, 3);
        assert_eq!(config.default_timeout, Duration::from_secs(7));
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.queue_depth, 64);
    }

    #[test]
    fn test_env_override_invalid_value() {
        let mut config = EngineConfig::default();
        let err = config
            .apply_overrides_from(vec![(
                "ROUTEFLOW_MAX_CONCURRENT_ROUTES".to_string(),
                "many".to_string(),
            )])
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSetting(_)));
    }
}
