//! Kubernetes domain-operation module.
//!
//! Thin helpers over the `kubectl` binary: arguments are built here,
//! execution goes through the shared process runner, and machine-readable
//! output (`-o json`) is parsed before crossing the wire.
//!
//! Methods: `version`, `contexts`, `current-context`, `get`.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::process::Command;
use std::time::Duration;
use tracing::debug;

use super::shell::run_with_timeout;
use super::{object_str, required_str};
use crate::dispatch::ModuleHandler;

/// Deadline for one kubectl invocation. API-server round trips dominate,
/// so this is longer than a local command deserves.
const KUBECTL_TIMEOUT: Duration = Duration::from_secs(20);

/// `kubectl` helpers behind the `kubectl` routing key.
pub struct KubectlModule {
    binary: String,
}

impl KubectlModule {
    pub fn new() -> Self {
        Self::with_binary("kubectl")
    }

    /// Override the binary path; used by tests and nonstandard installs.
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: Vec<String>) -> Result<CapturedText, String> {
        debug!(binary = %self.binary, ?args, "kubectl invocation");
        let mut cmd = Command::new(&self.binary);
        cmd.args(&args);
        let output = run_with_timeout(cmd, KUBECTL_TIMEOUT).await?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.exit_code != Some(0) {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let code = output
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".into());
            return Err(format!(
                "kubectl exited with code {code}: {}",
                stderr.trim()
            ));
        }
        Ok(CapturedText { stdout })
    }

    async fn run_json(&self, args: Vec<String>) -> Result<Value, String> {
        let output = self.run(args).await?;
        serde_json::from_str(&output.stdout)
            .map_err(|e| format!("kubectl produced invalid JSON: {e}"))
    }

    async fn version(&self) -> Result<Value, String> {
        self.run_json(version_args()).await
    }

    async fn contexts(&self) -> Result<Value, String> {
        let output = self.run(contexts_args()).await?;
        let names: Vec<&str> = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        Ok(json!(names))
    }

    async fn current_context(&self) -> Result<Value, String> {
        let output = self.run(current_context_args()).await?;
        Ok(Value::String(output.stdout.trim().to_string()))
    }

    /// `get(kind, options?)` where options is
    /// `{ name?, namespace?, context?, allNamespaces? }`.
    async fn get(&self, args: &[Value]) -> Result<Value, String> {
        let kind = required_str(args, 0, "kind")?;
        if kind.is_empty() {
            return Err("kind is empty".into());
        }
        let name = object_str(args, 1, "name");
        let namespace = object_str(args, 1, "namespace");
        let context = object_str(args, 1, "context");
        let all_namespaces = args
            .get(1)
            .and_then(Value::as_object)
            .and_then(|o| o.get("allNamespaces"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        self.run_json(get_args(kind, name, namespace, context, all_namespaces))
            .await
    }
}

struct CapturedText {
    stdout: String,
}

impl Default for KubectlModule {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Argument building (pure, testable without the binary)
// ---------------------------------------------------------------------------

fn version_args() -> Vec<String> {
    vec!["version".into(), "--client".into(), "-o".into(), "json".into()]
}

fn contexts_args() -> Vec<String> {
    vec!["config".into(), "get-contexts".into(), "-o".into(), "name".into()]
}

fn current_context_args() -> Vec<String> {
    vec!["config".into(), "current-context".into()]
}

fn get_args(
    kind: &str,
    name: Option<&str>,
    namespace: Option<&str>,
    context: Option<&str>,
    all_namespaces: bool,
) -> Vec<String> {
    let mut args = vec!["get".to_string(), kind.to_string()];
    if let Some(name) = name {
        args.push(name.to_string());
    }
    if let Some(context) = context {
        args.push("--context".to_string());
        args.push(context.to_string());
    }
    if all_namespaces {
        args.push("--all-namespaces".to_string());
    } else if let Some(namespace) = namespace {
        args.push("-n".to_string());
        args.push(namespace.to_string());
    }
    args.push("-o".to_string());
    args.push("json".to_string());
    args
}

#[async_trait]
impl ModuleHandler for KubectlModule {
    async fn handle(&self, method: &str, args: &[Value]) -> Result<Value, String> {
        match method {
            "version" => self.version().await,
            "contexts" => self.contexts().await,
            "current-context" => self.current_context().await,
            "get" => self.get(args).await,
            other => Err(format!("kubectl module has no method \"{other}\"")),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_args_minimal() {
        assert_eq!(
            get_args("pods", None, None, None, false),
            vec!["get", "pods", "-o", "json"]
        );
    }

    #[test]
    fn get_args_with_name_and_namespace() {
        assert_eq!(
            get_args("deployment", Some("web"), Some("staging"), None, false),
            vec!["get", "deployment", "web", "-n", "staging", "-o", "json"]
        );
    }

    #[test]
    fn get_args_all_namespaces_overrides_namespace() {
        let args = get_args("pods", None, Some("staging"), None, true);
        assert!(args.contains(&"--all-namespaces".to_string()));
        assert!(!args.contains(&"-n".to_string()));
    }

    #[test]
    fn get_args_with_context() {
        let args = get_args("nodes", None, None, Some("prod-cluster"), false);
        let pos = args.iter().position(|a| a == "--context").unwrap();
        assert_eq!(args[pos + 1], "prod-cluster");
    }

    #[test]
    fn fixed_command_shapes() {
        assert_eq!(version_args(), vec!["version", "--client", "-o", "json"]);
        assert_eq!(contexts_args(), vec!["config", "get-contexts", "-o", "name"]);
        assert_eq!(current_context_args(), vec!["config", "current-context"]);
    }

    #[tokio::test]
    async fn unknown_method_is_an_error() {
        let err = KubectlModule::new()
            .handle("drain", &[])
            .await
            .err()
            .unwrap();
        assert!(err.contains("drain"));
    }

    #[tokio::test]
    async fn missing_kind_is_an_error() {
        let err = KubectlModule::new().handle("get", &[]).await.err().unwrap();
        assert!(err.contains("kind"));
    }

    #[tokio::test]
    async fn missing_binary_is_a_module_error() {
        let module = KubectlModule::with_binary("/no/such/kubectl-xyz");
        let err = module.handle("version", &[]).await.err().unwrap();
        assert!(err.contains("failed to execute"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_reports_stderr() {
        // A stand-in binary that fails like kubectl would.
        let module = KubectlModule::with_binary("/bin/sh");
        // "version" builds args sh cannot parse, so it exits nonzero.
        let err = module.handle("current-context", &[]).await.err().unwrap();
        assert!(err.contains("exited with code"));
    }
}
