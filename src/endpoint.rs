//! Native transport surfaces the two hosts expose.
//!
//! The embedding layer for each host implements the matching trait and
//! installs it via `bridge::install_legacy_endpoint` /
//! `bridge::install_modern_endpoint` during embed. Application code never
//! sees these traits; it talks to the adapters through the unified bridge.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::runtime::RuntimeKind;

/// Handle returned by `on`/`once`, used to deregister a listener.
pub type ListenerId = u64;

/// Context handed to event listeners ahead of the payload arguments.
#[derive(Debug, Clone)]
pub struct EventContext {
    /// Channel the event arrived on.
    pub channel: String,
    /// Runtime the delivering adapter was built for.
    pub runtime: RuntimeKind,
}

/// Callback registered against an event channel. Receives the event context
/// followed by the host's payload arguments.
pub type EventListener = Arc<dyn Fn(&EventContext, &[Value]) + Send + Sync>;

/// Native surface of the legacy host: channel-addressed duplex messaging
/// where privileged code runs inside the same JavaScript-capable process.
/// The backend resolves or rejects invocations natively, so `invoke`
/// already carries the final outcome.
#[async_trait]
pub trait LegacyEndpoint: Send + Sync {
    /// Fire-and-forget message to the backend. Delivery failures are
    /// host-dependent and silent.
    fn send(&self, channel: &str, args: Vec<Value>);

    /// Round-trip call addressed by channel name.
    async fn invoke(&self, channel: &str, args: Vec<Value>) -> Result<Value, String>;
}

/// Native surface of the modern host: the backend lives in a separate
/// natively-compiled process reachable only through typed command
/// invocation. There is no channel addressing; the adapter folds an entire
/// call into one serialized payload handed to a single entry command.
#[async_trait]
pub trait ModernEndpoint: Send + Sync {
    /// Fire-and-forget command. Delivery failures are host-dependent and
    /// silent.
    fn notify(&self, command: &str, payload: String);

    /// Typed command invocation carrying a serialized payload.
    async fn invoke_command(&self, command: &str, payload: String) -> Result<Value, String>;
}
