//! Shell module: ad-hoc command execution.
//!
//! Runs a single command with a hard timeout and bounded output. The exit
//! code is data, not an error: callers inspect `exitCode` in the return
//! value, while spawn failures, timeouts and oversized output surface as
//! module errors.
//!
//! Methods: `exec`.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::process::Command;
use std::time::Duration;
use tracing::debug;

use super::{object_str, object_u64, required_str};
use crate::dispatch::ModuleHandler;

/// Default execution deadline (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest deadline a caller may request.
const MAX_TIMEOUT: Duration = Duration::from_secs(300);

/// Maximum stdout size (5 MB).
const MAX_STDOUT_BYTES: usize = 5 * 1024 * 1024;

/// Maximum stderr bytes included in results and errors. Keeps secrets a
/// tool might print on stderr from travelling further than needed.
const MAX_STDERR_BYTES: usize = 4 * 1024;

/// Captured outcome of one process run.
pub(crate) struct CapturedOutput {
    pub(crate) exit_code: Option<i32>,
    pub(crate) stdout: Vec<u8>,
    pub(crate) stderr: Vec<u8>,
}

/// Run a prepared command to completion on the blocking pool, racing the
/// deadline. Shared with the kubectl module.
pub(crate) async fn run_with_timeout(
    mut cmd: Command,
    timeout: Duration,
) -> Result<CapturedOutput, String> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.stdin(std::process::Stdio::null());

    let output = tokio::time::timeout(timeout, tokio::task::spawn_blocking(move || cmd.output()))
        .await
        .map_err(|_| {
            format!(
                "command \"{program}\" timed out after {}s",
                timeout.as_secs()
            )
        })?
        .map_err(|e| format!("execution task failed: {e}"))?
        .map_err(|e| format!("failed to execute \"{program}\": {e}"))?;

    Ok(CapturedOutput {
        exit_code: output.status.code(),
        stdout: output.stdout,
        stderr: output.stderr,
    })
}

fn truncated_stderr(stderr: &[u8]) -> String {
    let cut = &stderr[..stderr.len().min(MAX_STDERR_BYTES)];
    String::from_utf8_lossy(cut).trim().to_string()
}

/// Ad-hoc command execution behind the `shell` routing key.
pub struct ShellModule;

impl ShellModule {
    pub fn new() -> Self {
        Self
    }

    /// `exec(command, args?, options?)` where options is
    /// `{ cwd?, timeoutMs? }`.
    async fn exec(&self, args: &[Value]) -> Result<Value, String> {
        let command = required_str(args, 0, "command")?;
        if command.is_empty() {
            return Err("command is empty".into());
        }

        let argv: Vec<String> = match args.get(1) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| "argument 1 (args) must be an array of strings".to_string())
                })
                .collect::<Result<_, _>>()?,
            Some(_) => return Err("argument 1 (args) must be an array of strings".into()),
        };

        let timeout = object_u64(args, 2, "timeoutMs")
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_TIMEOUT)
            .min(MAX_TIMEOUT);

        let mut cmd = Command::new(command);
        cmd.args(&argv);
        if let Some(cwd) = object_str(args, 2, "cwd") {
            cmd.current_dir(cwd);
        }

        let timeout_ms = timeout.as_millis() as u64;
        debug!(%command, args = argv.len(), timeout_ms, "shell exec");
        let output = run_with_timeout(cmd, timeout).await?;

        if output.stdout.len() > MAX_STDOUT_BYTES {
            return Err(format!(
                "command output exceeds maximum size ({} bytes > {MAX_STDOUT_BYTES} bytes)",
                output.stdout.len()
            ));
        }

        Ok(json!({
            "exitCode": output.exit_code,
            "stdout": String::from_utf8_lossy(&output.stdout),
            "stderr": truncated_stderr(&output.stderr),
        }))
    }
}

impl Default for ShellModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModuleHandler for ShellModule {
    async fn handle(&self, method: &str, args: &[Value]) -> Result<Value, String> {
        match method {
            "exec" => self.exec(args).await,
            other => Err(format!("shell module has no method \"{other}\"")),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_method_is_an_error() {
        let err = ShellModule::new().handle("spawn", &[]).await.err().unwrap();
        assert!(err.contains("spawn"));
    }

    #[tokio::test]
    async fn missing_command_is_an_error() {
        let err = ShellModule::new().handle("exec", &[]).await.err().unwrap();
        assert!(err.contains("command"));
    }

    #[tokio::test]
    async fn non_string_args_are_rejected() {
        let err = ShellModule::new()
            .handle("exec", &[json!("echo"), json!([1, 2])])
            .await
            .err()
            .unwrap();
        assert!(err.contains("array of strings"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exec_captures_stdout_and_exit_code() {
        let result = ShellModule::new()
            .handle("exec", &[json!("/bin/echo"), json!(["hello"])])
            .await
            .unwrap();
        assert_eq!(result["exitCode"], json!(0));
        assert_eq!(result["stdout"], json!("hello\n"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_is_data_not_error() {
        let result = ShellModule::new()
            .handle("exec", &[json!("/bin/sh"), json!(["-c", "exit 3"])])
            .await
            .unwrap();
        assert_eq!(result["exitCode"], json!(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exec_enforces_timeout() {
        let err = ShellModule::new()
            .handle(
                "exec",
                &[json!("/bin/sleep"), json!(["5"]), json!({"timeoutMs": 100})],
            )
            .await
            .err()
            .unwrap();
        assert!(err.contains("timed out"), "unexpected error: {err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exec_honours_cwd_option() {
        let dir = tempfile::tempdir().unwrap();
        let result = ShellModule::new()
            .handle(
                "exec",
                &[
                    json!("/bin/sh"),
                    json!(["-c", "pwd"]),
                    json!({"cwd": dir.path().to_str().unwrap()}),
                ],
            )
            .await
            .unwrap();
        let printed = result["stdout"].as_str().unwrap().trim();
        // Compare canonicalized: the temp dir may itself be a symlink.
        assert_eq!(
            std::fs::canonicalize(printed).unwrap(),
            std::fs::canonicalize(dir.path()).unwrap()
        );
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error() {
        let err = ShellModule::new()
            .handle("exec", &[json!("/no/such/binary-xyz")])
            .await
            .err()
            .unwrap();
        assert!(err.contains("failed to execute"));
    }

    #[test]
    fn stderr_is_truncated() {
        let long = vec![b'x'; 10_000];
        assert_eq!(truncated_stderr(&long).len(), MAX_STDERR_BYTES);
    }
}
