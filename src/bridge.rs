//! Process-wide unified bridge.
//!
//! The bridge is the only component allowed to construct capability
//! adapters. On first use it runs runtime detection, picks the endpoint the
//! host glue installed for that runtime, builds the matching adapter, and
//! caches the handle for the rest of the process: the host cannot change
//! mid-session, so there is deliberately no re-detection path outside the
//! test-only reset.

use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use crate::adapter::{BridgeOps, LegacyHostAdapter, ModernHostAdapter};
use crate::endpoint::{EventListener, LegacyEndpoint, ListenerId, ModernEndpoint};
use crate::envelope::{EXEC_CHANNEL, InvocationEnvelope};
use crate::runtime::{self, RuntimeKind};

/// Errors surfaced by the bridge layer. Everything here is a configuration
/// or invocation failure the caller must handle; the bridge never silently
/// degrades to a no-op.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    /// Neither host marker was detected. Raised instead of returning a stub
    /// so real configuration errors stay visible.
    #[error("no native runtime available")]
    NoNativeRuntime,

    /// An adapter was constructed for a host whose marker is absent.
    #[error("cannot construct {expected} adapter: detected runtime is {detected}")]
    WrongRuntime {
        expected: RuntimeKind,
        detected: RuntimeKind,
    },

    /// A host was detected but its embedding layer never installed an
    /// endpoint.
    #[error("{0} detected but no endpoint installed")]
    EndpointMissing(RuntimeKind),

    /// The backend reported a failure. The message text is exactly what
    /// the backend produced.
    #[error("{0}")]
    Invocation(String),
}

/// Endpoints installed by the host embedding layers before first bridge
/// use. At most one of them is ever consulted in a given process.
struct InstalledEndpoints {
    legacy: Option<Arc<dyn LegacyEndpoint>>,
    modern: Option<Arc<dyn ModernEndpoint>>,
}

static ENDPOINTS: RwLock<InstalledEndpoints> = RwLock::new(InstalledEndpoints {
    legacy: None,
    modern: None,
});

/// The cached process-wide handle. Created lazily by `get_bridge`, cleared
/// only by `reset_for_tests`.
static BRIDGE: RwLock<Option<Arc<Bridge>>> = RwLock::new(None);

/// Install the legacy host's native endpoint. Called by the legacy embed
/// glue during startup, before application code touches the bridge.
pub fn install_legacy_endpoint(endpoint: Arc<dyn LegacyEndpoint>) {
    ENDPOINTS.write().legacy = Some(endpoint);
}

/// Install the modern host's native endpoint. Called by the modern embed
/// glue during startup, before application code touches the bridge.
pub fn install_modern_endpoint(endpoint: Arc<dyn ModernEndpoint>) {
    ENDPOINTS.write().modern = Some(endpoint);
}

/// The process-wide bridge handle wrapping the one active adapter.
pub struct Bridge {
    adapter: Arc<dyn BridgeOps>,
    kind: RuntimeKind,
}

impl Bridge {
    /// Fire-and-forget message to the backend.
    pub fn send(&self, channel: &str, args: Vec<Value>) {
        self.adapter.send(channel, args);
    }

    /// Round-trip invocation on an arbitrary channel.
    pub async fn invoke(&self, channel: &str, args: Vec<Value>) -> Result<Value, BridgeError> {
        self.adapter.invoke(channel, args).await
    }

    /// Invoke one backend module operation through the command-invocation
    /// protocol: builds the envelope and sends it over [`EXEC_CHANNEL`].
    pub async fn invoke_module(
        &self,
        module: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, BridgeError> {
        let envelope = InvocationEnvelope::new(module, method, args);
        self.invoke(EXEC_CHANNEL, vec![Value::String(envelope.to_wire())])
            .await
    }

    pub fn on(&self, channel: &str, listener: EventListener) -> ListenerId {
        self.adapter.on(channel, listener)
    }

    pub fn once(&self, channel: &str, listener: EventListener) -> ListenerId {
        self.adapter.once(channel, listener)
    }

    pub fn remove_listener(&self, channel: &str, id: ListenerId) -> bool {
        self.adapter.remove_listener(channel, id)
    }

    /// Deliver a host event to registered listeners. Called by the host
    /// embedding layer, never by application code.
    pub fn dispatch_event(&self, channel: &str, args: &[Value]) -> usize {
        self.adapter.dispatch_event(channel, args)
    }

    /// "ModernHost", "LegacyHost" or "Unknown".
    pub fn runtime_name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn is_modern_host(&self) -> bool {
        self.kind == RuntimeKind::ModernHost
    }

    pub fn is_legacy_host(&self) -> bool {
        self.kind == RuntimeKind::LegacyHost
    }
}

/// Return the process-wide bridge, constructing it on first call.
///
/// Fails with [`BridgeError::NoNativeRuntime`] when running outside any
/// native host (plain browser tab): callers wanting graceful degradation
/// must catch that explicitly.
pub fn get_bridge() -> Result<Arc<Bridge>, BridgeError> {
    if let Some(bridge) = BRIDGE.read().as_ref() {
        return Ok(bridge.clone());
    }

    let mut slot = BRIDGE.write();
    // Lost the race to another first caller.
    if let Some(bridge) = slot.as_ref() {
        return Ok(bridge.clone());
    }

    let kind = runtime::detect();
    let adapter: Arc<dyn BridgeOps> = match kind {
        RuntimeKind::Unknown => return Err(BridgeError::NoNativeRuntime),
        RuntimeKind::LegacyHost => {
            let endpoint = ENDPOINTS
                .read()
                .legacy
                .clone()
                .ok_or(BridgeError::EndpointMissing(kind))?;
            Arc::new(LegacyHostAdapter::new(endpoint)?)
        }
        RuntimeKind::ModernHost => {
            let endpoint = ENDPOINTS
                .read()
                .modern
                .clone()
                .ok_or(BridgeError::EndpointMissing(kind))?;
            Arc::new(ModernHostAdapter::new(endpoint)?)
        }
    };

    info!(runtime = kind.name(), "bridge initialized");
    let bridge = Arc::new(Bridge { adapter, kind });
    *slot = Some(bridge.clone());
    Ok(bridge)
}

/// Drop the cached bridge, installed endpoints and memoized detection so
/// the next `get_bridge` re-detects from scratch.
///
/// Test hook: the host cannot change mid-session in production.
pub fn reset_for_tests() {
    *BRIDGE.write() = None;
    let mut endpoints = ENDPOINTS.write();
    endpoints.legacy = None;
    endpoints.modern = None;
    runtime::reset_detection();
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
