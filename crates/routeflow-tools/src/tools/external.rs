//! External command execution tool.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::time::timeout;

use crate::context::MessageContext;
use crate::error::ToolError;
use crate::result::{CommandOutput, OutputFormat};
use crate::template::TemplateEngine;

/// Name under which the context file path is exposed to the command template.
pub const INPUT_FILE_VAR: &str = "input_file";

/// A fully configured external command.
#[derive(Debug, Clone)]
pub struct ExternalCommand {
    /// Command template.
    pub command: String,

    /// Shell used to run the command (invoked as `<shell> -c <command>`).
    pub shell: String,

    /// Working directory.
    pub cwd: Option<String>,

    /// Environment variables; values are templates.
    pub env: HashMap<String, String>,

    /// Hard limit on the command's run time.
    pub timeout: Duration,

    /// How stdout is interpreted.
    pub format: OutputFormat,
}

impl ExternalCommand {
    /// Create a command with the default shell and JSON output.
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            shell: default_shell(),
            cwd: None,
            env: HashMap::new(),
            timeout,
            format: OutputFormat::Json,
        }
    }
}

/// Default shell for external commands.
pub fn default_shell() -> String {
    "sh".to_string()
}

/// Runs commands out of process against a serialized message context.
///
/// The context document is written to a temporary file (exposed to the
/// command template as `{{ input_file }}`) and also piped to stdin.
pub struct ExternalTool {
    template_engine: TemplateEngine,
}

impl ExternalTool {
    /// Create a new external tool.
    pub fn new() -> Self {
        Self {
            template_engine: TemplateEngine::new(),
        }
    }

    /// Run a command for one message and return its structured result.
    pub async fn run(
        &self,
        spec: &ExternalCommand,
        ctx: &MessageContext,
    ) -> Result<serde_json::Value, ToolError> {
        let document = serde_json::to_vec(&ctx.to_document())?;

        let input = tempfile::Builder::new()
            .prefix("routeflow-")
            .suffix(".json")
            .tempfile()?;
        tokio::fs::write(input.path(), &document).await?;

        let mut template_ctx = ctx.to_template_context();
        template_ctx.insert(
            INPUT_FILE_VAR.to_string(),
            serde_json::json!(input.path().to_string_lossy()),
        );

        let command = self.template_engine.render(&spec.command, &template_ctx)?;
        let mut env = HashMap::with_capacity(spec.env.len());
        for (key, value) in &spec.env {
            env.insert(key.clone(), self.template_engine.render(value, &template_ctx)?);
        }

        tracing::debug!(
            route = %ctx.route,
            command = %command,
            shell = %spec.shell,
            cwd = ?spec.cwd,
            timeout = ?spec.timeout,
            "Executing external command"
        );

        let output = self
            .execute_command(
                &command,
                &spec.shell,
                spec.cwd.as_deref(),
                &env,
                Some(document),
                spec.timeout,
            )
            .await?;

        // The input file must outlive the command.
        drop(input);

        tracing::debug!(
            route = %ctx.route,
            exit_code = output.exit_code,
            duration_ms = output.duration_ms,
            "External command finished"
        );

        output.into_value(spec.format)
    }

    /// Execute a shell command directly.
    ///
    /// On timeout the child is killed and `ToolError::Timeout` is returned.
    pub async fn execute_command(
        &self,
        command: &str,
        shell: &str,
        cwd: Option<&str>,
        env: &HashMap<String, String>,
        stdin: Option<Vec<u8>>,
        timeout_duration: Duration,
    ) -> Result<CommandOutput, ToolError> {
        let start = std::time::Instant::now();

        let mut cmd = Command::new(shell);
        cmd.arg("-c").arg(command);

        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        for (k, v) in env {
            cmd.env(k, v);
        }

        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| ToolError::Spawn(format!("{}: {}", shell, e)))?;

        // Feed stdin without blocking on a child that never reads it.
        let stdin_handle = match (child.stdin.take(), stdin) {
            (Some(mut pipe), Some(bytes)) => Some(tokio::spawn(async move {
                let _ = pipe.write_all(&bytes).await;
                let _ = pipe.shutdown().await;
            })),
            _ => None,
        };

        let mut stdout_handle = tokio::spawn(read_lines(child.stdout.take()));
        let mut stderr_handle = tokio::spawn(read_lines(child.stderr.take()));
        let mut stdin_handle = stdin_handle;

        // Descendants that keep the pipes open count against the same deadline.
        let finished = timeout(timeout_duration, async {
            let status = child.wait().await;
            let stdout = (&mut stdout_handle).await.unwrap_or_default();
            let stderr = (&mut stderr_handle).await.unwrap_or_default();
            if let Some(handle) = stdin_handle.as_mut() {
                let _ = handle.await;
            }
            (status, stdout, stderr)
        })
        .await;

        let (status, stdout, stderr) = match finished {
            Ok(finished) => finished,
            Err(_) => {
                // Kill the process on timeout
                let _ = child.kill().await;
                stdout_handle.abort();
                stderr_handle.abort();
                if let Some(handle) = stdin_handle {
                    handle.abort();
                }
                return Err(ToolError::Timeout(timeout_duration));
            }
        };

        let status = status.map_err(|e| ToolError::Io(format!("Failed to wait for process: {}", e)))?;
        let exit_code = status.code().unwrap_or(-1);

        Ok(CommandOutput {
            exit_code,
            stdout,
            stderr,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

impl Default for ExternalTool {
    fn default() -> Self {
        Self::new()
    }
}

async fn read_lines<R>(pipe: Option<R>) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut output = String::new();
    if let Some(pipe) = pipe {
        let mut reader = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            output.push_str(&line);
            output.push('\n');
        }
    }
    output
}
