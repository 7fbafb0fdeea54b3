//! Per-firing message context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Variable set carried through one route firing.
///
/// Contains everything a processor may read or write:
/// - The current payload
/// - Variables accumulated by earlier steps (never truncated, only added or overwritten)
/// - Firing metadata (route, attempt count, last error, timestamps)
///
/// A context is created fresh for every trigger and owned by exactly one
/// pipeline execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageContext {
    /// Unique id of this firing.
    pub message_id: String,

    /// Name of the route being executed.
    pub route: String,

    /// Current payload.
    pub payload: serde_json::Value,

    /// Variables written by processors.
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,

    /// Metadata attached by the source adapter.
    #[serde(default)]
    pub meta: serde_json::Map<String, serde_json::Value>,

    /// Resolved environment variables declared by the configuration.
    #[serde(default, skip_serializing)]
    pub env: HashMap<String, String>,

    /// Current attempt (1-based).
    pub attempt: u32,

    /// Error from the previous attempt, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// When the trigger was received.
    pub received_at: DateTime<Utc>,
}

impl MessageContext {
    /// Create a new context for a route firing.
    pub fn new(route: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            route: route.into(),
            payload,
            variables: HashMap::new(),
            meta: serde_json::Map::new(),
            env: HashMap::new(),
            attempt: 1,
            last_error: None,
            received_at: Utc::now(),
        }
    }

    /// Attach source metadata.
    pub fn with_meta(mut self, meta: serde_json::Map<String, serde_json::Value>) -> Self {
        self.meta = meta;
        self
    }

    /// Attach resolved environment variables.
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Set a variable value.
    pub fn set_variable(&mut self, name: impl Into<String>, value: serde_json::Value) {
        self.variables.insert(name.into(), value);
    }

    /// Get a variable value.
    pub fn get_variable(&self, name: &str) -> Option<&serde_json::Value> {
        self.variables.get(name)
    }

    /// Get a variable as a string.
    pub fn get_variable_str(&self, name: &str) -> Option<String> {
        self.variables.get(name).map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            _ => v.to_string(),
        })
    }

    /// Look up a field of the payload (object payloads only).
    pub fn payload_field(&self, name: &str) -> Option<&serde_json::Value> {
        self.payload.as_object().and_then(|obj| obj.get(name))
    }

    /// Write a step result either into the payload or into a named variable.
    pub fn store(&mut self, target: Option<&str>, value: serde_json::Value) {
        match target {
            Some(name) => self.set_variable(name, value),
            None => self.payload = value,
        }
    }

    /// Record a failed attempt before the next one starts.
    pub fn begin_retry(&mut self, error: impl Into<String>) {
        self.attempt += 1;
        self.last_error = Some(error.into());
    }

    /// Convert context to a flat map for template rendering.
    ///
    /// Precedence, lowest first: payload object fields, variables, well-known keys.
    pub fn to_template_context(&self) -> HashMap<String, serde_json::Value> {
        let mut ctx: HashMap<String, serde_json::Value> = self
            .payload
            .as_object()
            .map(|obj| obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        for (k, v) in &self.variables {
            ctx.insert(k.clone(), v.clone());
        }

        ctx.insert("payload".to_string(), self.payload.clone());
        ctx.insert("route".to_string(), serde_json::json!(self.route));
        ctx.insert("message_id".to_string(), serde_json::json!(self.message_id));
        ctx.insert("attempt".to_string(), serde_json::json!(self.attempt));
        ctx.insert(
            "last_error".to_string(),
            self.last_error
                .as_ref()
                .map(|e| serde_json::json!(e))
                .unwrap_or(serde_json::Value::Null),
        );
        ctx.insert(
            "timestamp".to_string(),
            serde_json::json!(self.received_at.to_rfc3339()),
        );
        ctx.insert("meta".to_string(), serde_json::Value::Object(self.meta.clone()));
        ctx.insert("env".to_string(), serde_json::json!(self.env));

        ctx
    }

    /// Structured document handed to external processors.
    pub fn to_document(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_new() {
        let ctx = MessageContext::new("alerts", serde_json::json!("x"));
        assert_eq!(ctx.route, "alerts");
        assert_eq!(ctx.attempt, 1);
        assert!(ctx.last_error.is_none());
        assert!(!ctx.message_id.is_empty());
    }

    #[test]
    fn test_context_variables() {
        let mut ctx = MessageContext::new("r", serde_json::Value::Null);
        ctx.set_variable("name", serde_json::json!("test"));
        ctx.set_variable("count", serde_json::json!(42));

        assert_eq!(ctx.get_variable("name"), Some(&serde_json::json!("test")));
        assert_eq!(ctx.get_variable_str("count"), Some("42".to_string()));
        assert_eq!(ctx.get_variable("missing"), None);
    }

    #[test]
    fn test_store_target() {
        let mut ctx = MessageContext::new("r", serde_json::json!({"a": 1}));
        ctx.store(Some("detection"), serde_json::json!({"label": "cat"}));
        assert_eq!(ctx.payload, serde_json::json!({"a": 1}));

        ctx.store(None, serde_json::json!("replaced"));
        assert_eq!(ctx.payload, serde_json::json!("replaced"));
        assert!(ctx.get_variable("detection").is_some());
    }

    #[test]
    fn test_template_context_precedence() {
        let mut ctx = MessageContext::new("r", serde_json::json!({"value": 5, "label": "p"}));
        ctx.set_variable("label", serde_json::json!("v"));

        let map = ctx.to_template_context();
        assert_eq!(map.get("value"), Some(&serde_json::json!(5)));
        assert_eq!(map.get("label"), Some(&serde_json::json!("v")));
        assert_eq!(map.get("route"), Some(&serde_json::json!("r")));
        assert_eq!(map.get("last_error"), Some(&serde_json::Value::Null));
        assert!(map.contains_key("timestamp"));
    }

    #[test]
    fn test_begin_retry() {
        let mut ctx = MessageContext::new("r", serde_json::Value::Null);
        ctx.begin_retry("boom");
        assert_eq!(ctx.attempt, 2);
        assert_eq!(ctx.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_document_hides_env() {
        let mut env = HashMap::new();
        env.insert("TOKEN".to_string(), "secret".to_string());
        let ctx = MessageContext::new("r", serde_json::json!(1)).with_env(env);

        let doc = ctx.to_document();
        assert_eq!(doc["route"], serde_json::json!("r"));
        assert!(doc.get("env").is_none());
    }
}
