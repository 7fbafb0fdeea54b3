//! External command output types.

use serde::{Deserialize, Serialize};

use crate::error::ToolError;

/// How a command's stdout is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Stdout must be a single JSON document.
    #[default]
    Json,
    /// Stdout is taken verbatim as a string.
    Text,
}

impl OutputFormat {
    /// Interpret raw command output.
    ///
    /// Empty output is malformed in either format.
    pub fn parse(&self, output: &str) -> Result<serde_json::Value, ToolError> {
        let trimmed = output.trim();
        if trimmed.is_empty() {
            return Err(ToolError::MalformedOutput("command produced no output".to_string()));
        }
        match self {
            OutputFormat::Json => serde_json::from_str(trimmed)
                .map_err(|e| ToolError::MalformedOutput(format!("invalid JSON on stdout: {}", e))),
            OutputFormat::Text => Ok(serde_json::Value::String(
                output.trim_end_matches(['\n', '\r']).to_string(),
            )),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Text => write!(f, "text"),
        }
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Process exit code (-1 when terminated by a signal).
    pub exit_code: i32,

    /// Standard output.
    pub stdout: String,

    /// Standard error.
    pub stderr: String,

    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

impl CommandOutput {
    /// Returns true if the command exited with status 0.
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// Fail on a non-zero exit, otherwise parse stdout.
    pub fn into_value(self, format: OutputFormat) -> Result<serde_json::Value, ToolError> {
        if !self.is_success() {
            return Err(ToolError::NonZeroExit {
                code: self.exit_code,
                stderr: self.stderr.trim().to_string(),
            });
        }
        format.parse(&self.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(code: i32, stdout: &str) -> CommandOutput {
        CommandOutput {
            exit_code: code,
            stdout: stdout.to_string(),
            stderr: "boom\n".to_string(),
            duration_ms: 3,
        }
    }

    #[test]
    fn test_output_format_display() {
        assert_eq!(OutputFormat::Json.to_string(), "json");
        assert_eq!(OutputFormat::Text.to_string(), "text");
        assert_eq!(OutputFormat::default(), OutputFormat::Json);
    }

    #[test]
    fn test_parse_json() {
        let value = OutputFormat::Json.parse("{\"label\": \"cat\"}\n").unwrap();
        assert_eq!(value, serde_json::json!({"label": "cat"}));
    }

    #[test]
    fn test_parse_malformed() {
        let err = OutputFormat::Json.parse("not json").unwrap_err();
        assert!(matches!(err, ToolError::MalformedOutput(_)));

        let err = OutputFormat::Text.parse("   \n").unwrap_err();
        assert!(matches!(err, ToolError::MalformedOutput(_)));
    }

    #[test]
    fn test_parse_text() {
        let value = OutputFormat::Text.parse("hello world\n").unwrap();
        assert_eq!(value, serde_json::json!("hello world"));
    }

    #[test]
    fn test_into_value_non_zero_exit() {
        let err = output(2, "{}").into_value(OutputFormat::Json).unwrap_err();
        match err {
            ToolError::NonZeroExit { code, stderr } => {
                assert_eq!(code, 2);
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_command_output_serialization() {
        let json = serde_json::to_string(&output(0, "ok")).unwrap();
        assert!(json.contains("\"exit_code\":0"));
        assert!(json.contains("\"duration_ms\":3"));
    }
}
