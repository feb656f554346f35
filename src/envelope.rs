//! Wire types for the command-invocation protocol.
//!
//! The frontend describes one privileged operation as an
//! [`InvocationEnvelope`]; the backend answers with an
//! [`InvocationResult`]. Both travel as JSON over whichever channel the
//! active host provides:
//!
//! ```text
//! { "module": "shell", "method": "exec", "args": [ ... ] }
//! { "success": true, "returnValue": ..., "error": null }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Well-known channel carrying invocation envelopes from the frontend to
/// the backend dispatcher. The envelope JSON travels as the first argument
/// on this channel.
pub const EXEC_CHANNEL: &str = "/exec/invoke";

/// One command invocation sent from the frontend to the backend.
///
/// `module` and `method` are required; a payload missing either does not
/// deserialize and is reported as an envelope error by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationEnvelope {
    /// Logical routing key, matched exactly against the dispatcher table.
    pub module: String,
    /// Operation name within the module.
    pub method: String,
    /// Positional arguments; may be empty.
    #[serde(default)]
    pub args: Vec<Value>,
}

impl InvocationEnvelope {
    pub fn new(
        module: impl Into<String>,
        method: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        Self {
            module: module.into(),
            method: method.into(),
            args,
        }
    }

    /// Serialize for transport. Envelopes are plain data; serialization
    /// cannot fail.
    pub fn to_wire(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Structured outcome of one invocation. Exactly one of
/// `return_value`/`error` is meaningful, determined by `success`; both keys
/// are always present on the wire (as `null` when unset).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationResult {
    pub success: bool,
    #[serde(default)]
    pub return_value: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl InvocationResult {
    /// Successful invocation carrying the handler's return value.
    pub fn ok(value: Value) -> Self {
        Self {
            success: true,
            return_value: Some(value),
            error: None,
        }
    }

    /// Failed invocation. The message text crosses the wire verbatim.
    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            return_value: None,
            error: Some(message.into()),
        }
    }

    /// Result for an envelope whose module is not in the routing table.
    /// Unknown modules are tolerated, not rejected, so a frontend newer
    /// than its backend degrades to a no-op instead of an error.
    pub fn unrouted() -> Self {
        Self {
            success: true,
            return_value: None,
            error: None,
        }
    }

    /// Reinterpret a raw host response as a result object. Returns `None`
    /// when the value does not carry the result shape (adapters then pass
    /// the raw value through untouched).
    pub fn from_wire(value: &Value) -> Option<Self> {
        if !value.as_object().is_some_and(|o| o.contains_key("success")) {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }

    /// Serialize for transport.
    pub fn to_wire(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
