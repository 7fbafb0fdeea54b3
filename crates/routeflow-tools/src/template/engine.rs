//! Template engine implementation using minijinja.

use minijinja::value::ValueKind;
use minijinja::{Environment, Error, ErrorKind, State, UndefinedBehavior, Value};
use std::collections::HashMap;

use crate::context::MessageContext;
use crate::error::EvaluationError;

/// Globals provided by the environment rather than by the message context.
const BUILTIN_GLOBALS: &[&str] = &["now", "range", "dict", "namespace", "debug"];

/// Template engine with Jinja2-compatible syntax.
///
/// Evaluation is a pure function of the template and the context: `now()`
/// reads the firing timestamp from the context instead of the wall clock, so
/// rendering the same template twice against an unchanged context yields the
/// same output.
///
/// Every top-level variable a template names must be present in the context
/// before rendering starts, so `{{ x | default('n/a') }}` and
/// `{% if x is defined %}` still fail when `x` is absent. `default` only
/// covers nested attributes such as `payload.subject | default('n/a')`.
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl TemplateEngine {
    /// Create a new template engine with custom filters.
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);

        // Register custom filters
        env.add_filter("int", filter_int);
        env.add_filter("float", filter_float);
        env.add_filter("default", filter_default);
        env.add_filter("d", filter_default); // alias
        env.add_filter("tojson", filter_tojson);
        env.add_filter("fromjson", filter_fromjson);
        env.add_filter("upper", filter_upper);
        env.add_filter("lower", filter_lower);
        env.add_filter("trim", filter_trim);
        env.add_filter("replace", filter_replace);
        env.add_filter("b64encode", filter_b64encode);
        env.add_filter("b64decode", filter_b64decode);
        env.add_filter("datetimeformat", filter_datetimeformat);

        env.add_function("now", function_now);

        Self { env }
    }

    /// Check if a string contains template syntax.
    pub fn is_template(s: &str) -> bool {
        (s.contains("{{") && s.contains("}}")) || (s.contains("{%") && s.contains("%}"))
    }

    /// Parse a template without rendering it.
    ///
    /// Returns the top-level variables the template reads from its context.
    pub fn check_template(&self, template: &str) -> Result<Vec<String>, EvaluationError> {
        if !Self::is_template(template) {
            return Ok(Vec::new());
        }
        let tmpl = self.env.template_from_str(template)?;
        Ok(context_variables(tmpl.undeclared_variables(false)))
    }

    /// Parse a condition expression without evaluating it.
    pub fn check_condition(&self, condition: &str) -> Result<Vec<String>, EvaluationError> {
        if Self::is_template(condition) {
            return self.check_template(condition);
        }
        self.env.compile_expression(condition)?;
        self.expression_variables(condition)
    }

    /// Render a template string with the given context.
    pub fn render(
        &self,
        template: &str,
        context: &HashMap<String, serde_json::Value>,
    ) -> Result<String, EvaluationError> {
        // Quick check for non-template strings
        if !Self::is_template(template) {
            return Ok(template.to_string());
        }

        let tmpl = self.env.template_from_str(template)?;
        require_defined(
            &context_variables(tmpl.undeclared_variables(false)),
            context,
        )?;

        tmpl.render(context_to_value(context))
            .map_err(EvaluationError::from)
    }

    /// Render a template with a MessageContext.
    pub fn render_with_context(
        &self,
        template: &str,
        ctx: &MessageContext,
    ) -> Result<String, EvaluationError> {
        self.render(template, &ctx.to_template_context())
    }

    /// Evaluate a boolean condition.
    ///
    /// Plain expressions (`value > 10`) must produce a boolean. Conditions
    /// written with template syntax must render to `true` or `false`.
    pub fn evaluate_condition(
        &self,
        condition: &str,
        context: &HashMap<String, serde_json::Value>,
    ) -> Result<bool, EvaluationError> {
        if Self::is_template(condition) {
            let rendered = self.render(condition, context)?;
            return match rendered.trim().to_lowercase().as_str() {
                "true" => Ok(true),
                "false" => Ok(false),
                other => Err(EvaluationError::NotBoolean {
                    condition: condition.to_string(),
                    found: format!("'{}'", other),
                }),
            };
        }

        let expr = self.env.compile_expression(condition)?;
        require_defined(&self.expression_variables(condition)?, context)?;

        let value = expr.eval(context_to_value(context))?;
        match value.kind() {
            ValueKind::Bool => Ok(value.is_true()),
            ValueKind::Undefined => Err(EvaluationError::Undefined(condition.to_string())),
            kind => Err(EvaluationError::NotBoolean {
                condition: condition.to_string(),
                found: kind.to_string(),
            }),
        }
    }

    /// Evaluate a condition with a MessageContext.
    pub fn evaluate_with_context(
        &self,
        condition: &str,
        ctx: &MessageContext,
    ) -> Result<bool, EvaluationError> {
        self.evaluate_condition(condition, &ctx.to_template_context())
    }

    /// Render a value that might be a template.
    ///
    /// Strings containing template syntax are rendered; objects and arrays are
    /// rendered recursively. Everything else is returned unchanged.
    pub fn render_value(
        &self,
        value: &serde_json::Value,
        context: &HashMap<String, serde_json::Value>,
    ) -> Result<serde_json::Value, EvaluationError> {
        match value {
            serde_json::Value::String(s) if Self::is_template(s) => {
                Ok(serde_json::Value::String(self.render(s, context)?))
            }
            serde_json::Value::Object(obj) => {
                let mut result = serde_json::Map::new();
                for (k, v) in obj {
                    result.insert(k.clone(), self.render_value(v, context)?);
                }
                Ok(serde_json::Value::Object(result))
            }
            serde_json::Value::Array(arr) => {
                let result: Result<Vec<_>, _> = arr
                    .iter()
                    .map(|v| self.render_value(v, context))
                    .collect();
                Ok(serde_json::Value::Array(result?))
            }
            _ => Ok(value.clone()),
        }
    }

    fn expression_variables(&self, expr: &str) -> Result<Vec<String>, EvaluationError> {
        let wrapped = format!("{{{{ {} }}}}", expr);
        let tmpl = self.env.template_from_str(&wrapped)?;
        Ok(context_variables(tmpl.undeclared_variables(false)))
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TemplateEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateEngine").finish_non_exhaustive()
    }
}

/// Filter out environment globals and sort for stable error messages.
fn context_variables(names: std::collections::HashSet<String>) -> Vec<String> {
    let mut names: Vec<String> = names
        .into_iter()
        .filter(|n| !BUILTIN_GLOBALS.contains(&n.as_str()))
        .collect();
    names.sort();
    names
}

/// Every top-level variable a template reads must exist in the context.
fn require_defined(
    names: &[String],
    context: &HashMap<String, serde_json::Value>,
) -> Result<(), EvaluationError> {
    match names.iter().find(|n| !context.contains_key(n.as_str())) {
        Some(missing) => Err(EvaluationError::Undefined(missing.clone())),
        None => Ok(()),
    }
}

/// Convert a HashMap context to minijinja Value.
fn context_to_value(context: &HashMap<String, serde_json::Value>) -> Value {
    let json = serde_json::Value::Object(
        context
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    );
    Value::from_serialize(&json)
}

fn undefined_error(what: &str) -> Error {
    Error::new(
        ErrorKind::UndefinedError,
        format!("{} received an undefined value", what),
    )
}

fn require_value(value: &Value, filter: &str) -> Result<(), Error> {
    if value.is_undefined() {
        Err(undefined_error(filter))
    } else {
        Ok(())
    }
}

// Custom filters

fn filter_int(value: Value) -> Result<Value, Error> {
    require_value(&value, "int")?;
    let s = value.to_string();
    if let Ok(n) = s.parse::<i64>() {
        return Ok(Value::from(n));
    }
    if let Ok(f) = s.parse::<f64>() {
        return Ok(Value::from(f as i64));
    }
    Err(Error::new(
        ErrorKind::InvalidOperation,
        format!("cannot convert '{}' to int", s),
    ))
}

fn filter_float(value: Value) -> Result<Value, Error> {
    require_value(&value, "float")?;
    let s = value.to_string();
    s.parse::<f64>().map(Value::from).map_err(|_| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("cannot convert '{}' to float", s),
        )
    })
}

fn filter_default(value: Value, default: Option<Value>) -> Value {
    if value.is_undefined() || value.is_none() {
        default.unwrap_or_else(|| Value::from(""))
    } else {
        value
    }
}

fn filter_tojson(value: Value) -> Result<String, Error> {
    require_value(&value, "tojson")?;
    serde_json::to_string(&value)
        .map_err(|e| Error::new(ErrorKind::BadSerialization, e.to_string()))
}

fn filter_fromjson(value: Value) -> Result<Value, Error> {
    require_value(&value, "fromjson")?;
    let json: serde_json::Value = serde_json::from_str(&value.to_string())
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))?;
    Ok(Value::from_serialize(&json))
}

fn filter_upper(value: Value) -> Result<String, Error> {
    require_value(&value, "upper")?;
    Ok(value.to_string().to_uppercase())
}

fn filter_lower(value: Value) -> Result<String, Error> {
    require_value(&value, "lower")?;
    Ok(value.to_string().to_lowercase())
}

fn filter_trim(value: Value) -> Result<String, Error> {
    require_value(&value, "trim")?;
    Ok(value.to_string().trim().to_string())
}

fn filter_replace(value: Value, old: String, new: String) -> Result<String, Error> {
    require_value(&value, "replace")?;
    Ok(value.to_string().replace(&old, &new))
}

fn filter_b64encode(value: Value) -> Result<String, Error> {
    use base64::{engine::general_purpose::STANDARD, Engine};
    require_value(&value, "b64encode")?;
    Ok(STANDARD.encode(value.to_string().as_bytes()))
}

fn filter_b64decode(value: Value) -> Result<String, Error> {
    use base64::{engine::general_purpose::STANDARD, Engine};
    require_value(&value, "b64decode")?;
    let decoded = STANDARD
        .decode(value.to_string().as_bytes())
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))?;
    String::from_utf8(decoded).map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))
}

/// Format an RFC 3339 timestamp or a unix epoch (seconds) with a strftime pattern.
fn filter_datetimeformat(value: Value, format: Option<String>) -> Result<String, Error> {
    use chrono::{DateTime, Utc};
    use std::fmt::Write;

    require_value(&value, "datetimeformat")?;
    let format = format.unwrap_or_else(|| "%Y-%m-%d %H:%M:%S".to_string());

    let datetime: DateTime<Utc> = match value.kind() {
        ValueKind::Number => {
            let secs = i64::try_from(value.clone()).map_err(|_| {
                Error::new(ErrorKind::InvalidOperation, "timestamp is not an integer")
            })?;
            DateTime::from_timestamp(secs, 0).ok_or_else(|| {
                Error::new(ErrorKind::InvalidOperation, "timestamp out of range")
            })?
        }
        _ => DateTime::parse_from_rfc3339(&value.to_string())
            .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))?
            .with_timezone(&Utc),
    };

    let mut out = String::new();
    write!(out, "{}", datetime.format(&format)).map_err(|_| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("invalid date format '{}'", format),
        )
    })?;
    Ok(out)
}

/// Timestamp of the current firing.
fn function_now(state: &State) -> Result<Value, Error> {
    match state.lookup("timestamp") {
        Some(ts) if !ts.is_undefined() && !ts.is_none() => Ok(ts),
        _ => Ok(Value::from(chrono::Utc::now().to_rfc3339())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with(pairs: &[(&str, serde_json::Value)]) -> HashMap<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_simple_template() {
        let engine = TemplateEngine::new();
        let ctx = ctx_with(&[("payload", serde_json::json!("x"))]);

        let result = engine.render("Processed: {{ payload }}", &ctx).unwrap();
        assert_eq!(result, "Processed: x");
    }

    #[test]
    fn test_plain_string_passthrough() {
        let engine = TemplateEngine::new();
        let result = engine.render("log:info", &HashMap::new()).unwrap();
        assert_eq!(result, "log:info");
    }

    #[test]
    fn test_undefined_variable_fails_closed() {
        let engine = TemplateEngine::new();
        let err = engine.render("Hello {{ name }}", &HashMap::new()).unwrap_err();
        assert_eq!(err, EvaluationError::Undefined("name".to_string()));
    }

    #[test]
    fn test_undefined_nested_attribute_fails() {
        let engine = TemplateEngine::new();
        let ctx = ctx_with(&[("payload", serde_json::json!({"a": 1}))]);
        let err = engine.render("{{ payload.missing }}", &ctx).unwrap_err();
        assert!(err.is_undefined());
    }

    #[test]
    fn test_default_on_nested_attribute() {
        let engine = TemplateEngine::new();
        let ctx = ctx_with(&[("payload", serde_json::json!({"a": 1}))]);
        let result = engine
            .render("{{ payload.subject | default('n/a') }}", &ctx)
            .unwrap();
        assert_eq!(result, "n/a");
    }

    #[test]
    fn test_default_does_not_cover_missing_top_level_variable() {
        let engine = TemplateEngine::new();
        let ctx = ctx_with(&[("payload", serde_json::json!({}))]);

        assert!(matches!(
            engine.render("{{ x | default('n/a') }}", &ctx),
            Err(EvaluationError::Undefined(ref name)) if name == "x"
        ));
        assert!(matches!(
            engine.render("{% if x is defined %}yes{% endif %}", &ctx),
            Err(EvaluationError::Undefined(_))
        ));
        assert_eq!(
            engine.render("{{ payload.x | default('n/a') }}", &ctx).unwrap(),
            "n/a"
        );
    }

    #[test]
    fn test_arithmetic_and_conditional_block() {
        let engine = TemplateEngine::new();
        let ctx = ctx_with(&[("count", serde_json::json!(4)), ("urgent", serde_json::json!(true))]);

        let result = engine
            .render("{{ count * 2 + 1 }}{% if urgent %} URGENT{% endif %}", &ctx)
            .unwrap();
        assert_eq!(result, "9 URGENT");
    }

    #[test]
    fn test_case_conversion() {
        let engine = TemplateEngine::new();
        let ctx = ctx_with(&[("text", serde_json::json!("Hello"))]);

        assert_eq!(engine.render("{{ text | upper }}", &ctx).unwrap(), "HELLO");
        assert_eq!(engine.render("{{ text | lower }}", &ctx).unwrap(), "hello");
    }

    #[test]
    fn test_filter_int_rejects_garbage() {
        let engine = TemplateEngine::new();
        let ctx = ctx_with(&[("val", serde_json::json!("abc"))]);
        let err = engine.render("{{ val | int }}", &ctx).unwrap_err();
        assert!(matches!(err, EvaluationError::TypeMismatch(_)));
    }

    #[test]
    fn test_filter_b64() {
        let engine = TemplateEngine::new();
        let ctx = ctx_with(&[
            ("text", serde_json::json!("hello")),
            ("encoded", serde_json::json!("aGVsbG8=")),
        ]);

        assert_eq!(engine.render("{{ text | b64encode }}", &ctx).unwrap(), "aGVsbG8=");
        assert_eq!(engine.render("{{ encoded | b64decode }}", &ctx).unwrap(), "hello");
    }

    #[test]
    fn test_datetimeformat_and_now() {
        let engine = TemplateEngine::new();
        let ctx = ctx_with(&[("timestamp", serde_json::json!("2024-03-01T12:30:00+00:00"))]);

        let result = engine
            .render("{{ now() | datetimeformat('%Y/%m/%d %H:%M') }}", &ctx)
            .unwrap();
        assert_eq!(result, "2024/03/01 12:30");

        let ctx = ctx_with(&[("epoch", serde_json::json!(0))]);
        let result = engine
            .render("{{ epoch | datetimeformat('%Y') }}", &ctx)
            .unwrap();
        assert_eq!(result, "1970");
    }

    #[test]
    fn test_render_is_deterministic() {
        let engine = TemplateEngine::new();
        let ctx = MessageContext::new("r", serde_json::json!({"v": 3}));
        let template = "{{ route }}:{{ v }}:{{ now() }}:{{ message_id }}";

        let first = engine.render_with_context(template, &ctx).unwrap();
        let second = engine.render_with_context(template, &ctx).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_condition_comparison() {
        let engine = TemplateEngine::new();
        let low = ctx_with(&[("value", serde_json::json!(5))]);
        let high = ctx_with(&[("value", serde_json::json!(15))]);

        assert!(!engine.evaluate_condition("value > 10", &low).unwrap());
        assert!(engine.evaluate_condition("value > 10", &high).unwrap());
    }

    #[test]
    fn test_condition_undefined() {
        let engine = TemplateEngine::new();
        let err = engine
            .evaluate_condition("severity == 'high'", &HashMap::new())
            .unwrap_err();
        assert!(err.is_undefined());
    }

    #[test]
    fn test_condition_not_boolean() {
        let engine = TemplateEngine::new();
        let ctx = ctx_with(&[("value", serde_json::json!(5))]);
        let err = engine.evaluate_condition("value + 1", &ctx).unwrap_err();
        assert!(matches!(err, EvaluationError::NotBoolean { .. }));
    }

    #[test]
    fn test_condition_template_syntax() {
        let engine = TemplateEngine::new();
        let ctx = ctx_with(&[("status", serde_json::json!("ok"))]);
        assert!(engine
            .evaluate_condition("{{ status == 'ok' }}", &ctx)
            .unwrap());
    }

    #[test]
    fn test_check_template_reports_variables() {
        let engine = TemplateEngine::new();
        let vars = engine
            .check_template("{{ b }} {{ a.x }} {{ now() }}")
            .unwrap();
        assert_eq!(vars, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_check_rejects_malformed() {
        let engine = TemplateEngine::new();
        assert!(matches!(
            engine.check_template("{% if x %}no end"),
            Err(EvaluationError::Syntax(_))
        ));
        assert!(engine.check_condition("value >").is_err());
    }

    #[test]
    fn test_render_value() {
        let engine = TemplateEngine::new();
        let ctx = ctx_with(&[("name", serde_json::json!("World"))]);

        let value = serde_json::json!({
            "greeting": "Hello, {{ name }}!",
            "plain": "no template",
            "count": 3
        });
        let result = engine.render_value(&value, &ctx).unwrap();
        assert_eq!(result["greeting"], serde_json::json!("Hello, World!"));
        assert_eq!(result["plain"], serde_json::json!("no template"));
        assert_eq!(result["count"], serde_json::json!(3));
    }
}
