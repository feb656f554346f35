//! Per-host capability adapters.
//!
//! Both adapters present the same five operations (`send`, `invoke`, `on`,
//! `once`, `remove_listener`) in terms of their host's native primitives:
//! the legacy adapter passes channel-addressed calls straight through, the
//! modern adapter folds every call into a serialized payload for the host's
//! single entry command. Listener bookkeeping is identical on both hosts
//! and lives in a shared table.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

use crate::bridge::BridgeError;
use crate::endpoint::{EventContext, EventListener, LegacyEndpoint, ListenerId, ModernEndpoint};
use crate::envelope::InvocationResult;
use crate::runtime::{self, RuntimeKind};

/// Entry command on the modern host that receives serialized invocations.
pub const INVOKE_COMMAND: &str = "exec_invoke";

/// Entry command on the modern host for fire-and-forget messages.
pub const NOTIFY_COMMAND: &str = "host_message";

/// The unified operation set application code programs against. Implemented
/// by exactly two types, one per concrete host.
#[async_trait]
pub trait BridgeOps: Send + Sync {
    /// Fire-and-forget; never blocks and never fails synchronously for a
    /// well-formed channel name.
    fn send(&self, channel: &str, args: Vec<Value>);

    /// Round-trip invocation. Resolves with the backend's return value; a
    /// backend failure surfaces as [`BridgeError::Invocation`] with the
    /// backend's message text verbatim.
    async fn invoke(&self, channel: &str, args: Vec<Value>) -> Result<Value, BridgeError>;

    /// Register a listener on a channel.
    fn on(&self, channel: &str, listener: EventListener) -> ListenerId;

    /// Register a listener that deregisters itself after the first
    /// delivery, even when deliveries race ahead of removal.
    fn once(&self, channel: &str, listener: EventListener) -> ListenerId;

    /// Deregister a listener. Returns false when no such registration
    /// exists.
    fn remove_listener(&self, channel: &str, id: ListenerId) -> bool;

    /// Deliver a host event into the listener table. Called by the
    /// embedding layer; returns the number of listeners notified.
    fn dispatch_event(&self, channel: &str, args: &[Value]) -> usize;

    /// Runtime this adapter was constructed for.
    fn runtime(&self) -> RuntimeKind;
}

// ---------------------------------------------------------------------------
// Listener table
// ---------------------------------------------------------------------------

struct Registration {
    id: ListenerId,
    callback: EventListener,
    /// Set for `once` registrations; flipped atomically on first delivery.
    fired: Option<Arc<AtomicBool>>,
}

/// Channel-keyed listener bookkeeping shared by both adapters.
struct ListenerTable {
    channels: DashMap<String, Vec<Registration>>,
    next_id: AtomicU64,
    runtime: RuntimeKind,
}

impl ListenerTable {
    fn new(runtime: RuntimeKind) -> Self {
        Self {
            channels: DashMap::new(),
            next_id: AtomicU64::new(1),
            runtime,
        }
    }

    fn register(&self, channel: &str, listener: EventListener, once: bool) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let registration = Registration {
            id,
            callback: listener,
            fired: once.then(|| Arc::new(AtomicBool::new(false))),
        };
        self.channels
            .entry(channel.to_string())
            .or_default()
            .push(registration);
        id
    }

    fn remove(&self, channel: &str, id: ListenerId) -> bool {
        let Some(mut entry) = self.channels.get_mut(channel) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|r| r.id != id);
        before != entry.len()
    }

    /// Invoke every live listener on `channel`. Callbacks run outside the
    /// map guard so a listener may register or remove listeners on the same
    /// channel without deadlocking.
    fn dispatch(&self, channel: &str, args: &[Value]) -> usize {
        let batch: Vec<(ListenerId, EventListener, bool)> = match self.channels.get(channel) {
            Some(entry) => entry
                .iter()
                .filter_map(|r| {
                    let deliver = match &r.fired {
                        // First flip wins; later deliveries racing on the
                        // same once-listener are suppressed here, not by
                        // removal timing.
                        Some(fired) => fired
                            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                            .is_ok(),
                        None => true,
                    };
                    deliver.then(|| (r.id, r.callback.clone(), r.fired.is_some()))
                })
                .collect(),
            None => return 0,
        };

        let ctx = EventContext {
            channel: channel.to_string(),
            runtime: self.runtime,
        };
        let mut notified = 0;
        for (id, callback, was_once) in batch {
            callback(&ctx, args);
            notified += 1;
            if was_once {
                self.remove(channel, id);
            }
        }
        notified
    }
}

// ---------------------------------------------------------------------------
// Response unwrapping
// ---------------------------------------------------------------------------

/// A backend answering the invocation protocol returns a result object;
/// other channels may return arbitrary values, which pass through as-is.
fn unwrap_response(raw: Value) -> Result<Value, BridgeError> {
    match InvocationResult::from_wire(&raw) {
        Some(result) if result.success => Ok(result.return_value.unwrap_or(Value::Null)),
        Some(result) => Err(BridgeError::Invocation(result.error.unwrap_or_default())),
        None => Ok(raw),
    }
}

/// Fail fast instead of handing out an adapter that can never reach its
/// host.
fn require_runtime(expected: RuntimeKind) -> Result<(), BridgeError> {
    let detected = runtime::detect();
    if detected == expected {
        Ok(())
    } else {
        Err(BridgeError::WrongRuntime { expected, detected })
    }
}

// ---------------------------------------------------------------------------
// Legacy host adapter
// ---------------------------------------------------------------------------

/// Adapter over the legacy host's channel-addressed messaging.
pub struct LegacyHostAdapter {
    endpoint: Arc<dyn LegacyEndpoint>,
    listeners: ListenerTable,
}

impl LegacyHostAdapter {
    /// Fails with [`BridgeError::WrongRuntime`] unless the legacy-host
    /// marker was detected.
    pub fn new(endpoint: Arc<dyn LegacyEndpoint>) -> Result<Self, BridgeError> {
        require_runtime(RuntimeKind::LegacyHost)?;
        Ok(Self {
            endpoint,
            listeners: ListenerTable::new(RuntimeKind::LegacyHost),
        })
    }
}

#[async_trait]
impl BridgeOps for LegacyHostAdapter {
    fn send(&self, channel: &str, args: Vec<Value>) {
        self.endpoint.send(channel, args);
    }

    async fn invoke(&self, channel: &str, args: Vec<Value>) -> Result<Value, BridgeError> {
        let raw = self
            .endpoint
            .invoke(channel, args)
            .await
            .map_err(BridgeError::Invocation)?;
        unwrap_response(raw)
    }

    fn on(&self, channel: &str, listener: EventListener) -> ListenerId {
        self.listeners.register(channel, listener, false)
    }

    fn once(&self, channel: &str, listener: EventListener) -> ListenerId {
        self.listeners.register(channel, listener, true)
    }

    fn remove_listener(&self, channel: &str, id: ListenerId) -> bool {
        self.listeners.remove(channel, id)
    }

    fn dispatch_event(&self, channel: &str, args: &[Value]) -> usize {
        self.listeners.dispatch(channel, args)
    }

    fn runtime(&self) -> RuntimeKind {
        RuntimeKind::LegacyHost
    }
}

// ---------------------------------------------------------------------------
// Modern host adapter
// ---------------------------------------------------------------------------

/// Adapter over the modern host's typed command invocation. Channel and
/// arguments are folded into one serialized payload:
/// `{ "channel": ..., "args": [...] }`.
pub struct ModernHostAdapter {
    endpoint: Arc<dyn ModernEndpoint>,
    listeners: ListenerTable,
}

impl ModernHostAdapter {
    /// Fails with [`BridgeError::WrongRuntime`] unless the modern-host
    /// marker was detected.
    pub fn new(endpoint: Arc<dyn ModernEndpoint>) -> Result<Self, BridgeError> {
        require_runtime(RuntimeKind::ModernHost)?;
        Ok(Self {
            endpoint,
            listeners: ListenerTable::new(RuntimeKind::ModernHost),
        })
    }

    fn fold(channel: &str, args: &[Value]) -> String {
        json!({ "channel": channel, "args": args }).to_string()
    }
}

#[async_trait]
impl BridgeOps for ModernHostAdapter {
    fn send(&self, channel: &str, args: Vec<Value>) {
        self.endpoint.notify(NOTIFY_COMMAND, Self::fold(channel, &args));
    }

    async fn invoke(&self, channel: &str, args: Vec<Value>) -> Result<Value, BridgeError> {
        debug!(channel, command = INVOKE_COMMAND, "marshalling invoke through entry command");
        let raw = self
            .endpoint
            .invoke_command(INVOKE_COMMAND, Self::fold(channel, &args))
            .await
            .map_err(BridgeError::Invocation)?;
        unwrap_response(raw)
    }

    fn on(&self, channel: &str, listener: EventListener) -> ListenerId {
        self.listeners.register(channel, listener, false)
    }

    fn once(&self, channel: &str, listener: EventListener) -> ListenerId {
        self.listeners.register(channel, listener, true)
    }

    fn remove_listener(&self, channel: &str, id: ListenerId) -> bool {
        self.listeners.remove(channel, id)
    }

    fn dispatch_event(&self, channel: &str, args: &[Value]) -> usize {
        self.listeners.dispatch(channel, args)
    }

    fn runtime(&self) -> RuntimeKind {
        RuntimeKind::ModernHost
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
