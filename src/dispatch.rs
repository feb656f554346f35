//! Backend command dispatcher.
//!
//! Receives serialized invocation envelopes from whatever channel the
//! active host provides, routes them by exact `module` match against a
//! closed table, and converts every outcome into a structured
//! [`InvocationResult`]. Nothing below this boundary is allowed to crash
//! the backend process:
//!
//! - malformed envelopes come back as `success:false` with the parse
//!   failure reason;
//! - unknown modules come back as a logged no-op (`success:true`,
//!   `returnValue:null`) so skewed frontend/backend versions tolerate each
//!   other during rollout;
//! - handler failures come back as `success:false` with the handler's
//!   message text verbatim.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::envelope::{InvocationEnvelope, InvocationResult};
use crate::modules::filesystem::FilesystemModule;
use crate::modules::kubectl::KubectlModule;
use crate::modules::shell::ShellModule;
use crate::modules::terminal::TerminalModule;

/// One backend routing target. Handlers may be called concurrently, one
/// logical task per inbound envelope, so implementations must be stateless
/// or internally synchronized.
#[async_trait]
pub trait ModuleHandler: Send + Sync {
    /// Execute one operation. Invalid methods or arguments are reported as
    /// module-specific error strings, never panics.
    async fn handle(&self, method: &str, args: &[Value]) -> Result<Value, String>;
}

/// Closed routing table. Exact string match only: no prefixes, no
/// wildcards, no fallthrough handler. Extending the surface means adding a
/// registration, which keeps the set of privileged operations auditable.
pub struct Dispatcher {
    handlers: HashMap<String, Arc<dyn ModuleHandler>>,
}

impl Dispatcher {
    /// Empty table. Production code normally wants [`Dispatcher::standard`].
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Add a module to the routing table. Re-registering a name replaces
    /// the previous handler.
    pub fn register(mut self, module: impl Into<String>, handler: Arc<dyn ModuleHandler>) -> Self {
        self.handlers.insert(module.into(), handler);
        self
    }

    /// The fixed production table: terminal sessions, sandboxed
    /// filesystem access, ad-hoc shell execution, and the Kubernetes
    /// domain helpers.
    pub fn standard() -> Self {
        Self::new()
            .register("terminal", Arc::new(TerminalModule::new()))
            .register("filesystem", Arc::new(FilesystemModule::new()))
            .register("shell", Arc::new(ShellModule::new()))
            .register("kubectl", Arc::new(KubectlModule::new()))
    }

    /// Registered module names, for diagnostics.
    pub fn modules(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    /// Dispatch a raw serialized envelope. Deserialization failures never
    /// reach routing.
    pub async fn dispatch_raw(&self, raw: &str) -> InvocationResult {
        let envelope: InvocationEnvelope = match serde_json::from_str(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                return InvocationResult::err(format!("invalid invocation payload: {e}"));
            }
        };
        self.dispatch(envelope).await
    }

    /// Dispatch a parsed envelope: route, execute, convert the outcome.
    pub async fn dispatch(&self, envelope: InvocationEnvelope) -> InvocationResult {
        if envelope.module.is_empty() {
            return InvocationResult::err("invalid invocation payload: module is empty");
        }
        if envelope.method.is_empty() {
            return InvocationResult::err("invalid invocation payload: method is empty");
        }

        debug!(
            module = %envelope.module,
            method = %envelope.method,
            args = envelope.args.len(),
            "dispatching invocation"
        );

        let Some(handler) = self.handlers.get(&envelope.module) else {
            // Tolerated, not rejected: a frontend newer than this backend
            // may route modules we have never heard of.
            warn!(module = %envelope.module, "no handler for module, ignoring invocation");
            return InvocationResult::unrouted();
        };

        match handler.handle(&envelope.method, &envelope.args).await {
            Ok(value) => InvocationResult::ok(value),
            Err(message) => InvocationResult::err(message),
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
