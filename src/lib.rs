//! Cross-host IPC bridge and plugin dispatch.
//!
//! Lets one browser-embedded frontend run unmodified against two mutually
//! incompatible desktop hosts and load feature plugins without knowing, at
//! compile time, which host it is embedded in:
//!
//! - [`runtime`] classifies the embedding environment once per process;
//! - [`bridge`] exposes a unified `send`/`invoke`/`on`/`once` surface over
//!   the per-host [`adapter`]s;
//! - [`dispatch`] routes invocation envelopes to the backend [`modules`];
//! - [`loader`] resolves plugin identifiers with runtime-specific
//!   preload/concurrency/timeout policy.

pub mod adapter;
pub mod bridge;
pub mod dispatch;
pub mod endpoint;
pub mod envelope;
pub mod loader;
pub mod modules;
pub mod runtime;

pub use adapter::{BridgeOps, LegacyHostAdapter, ModernHostAdapter};
pub use bridge::{
    Bridge, BridgeError, get_bridge, install_legacy_endpoint, install_modern_endpoint,
    reset_for_tests,
};
pub use dispatch::{Dispatcher, ModuleHandler};
pub use endpoint::{EventContext, EventListener, LegacyEndpoint, ListenerId, ModernEndpoint};
pub use envelope::{EXEC_CHANNEL, InvocationEnvelope, InvocationResult};
pub use loader::{
    ImportFn, PluginLoadError, PluginLoadOptions, PluginLoader, PluginManifest, PluginModule,
    default_plugins_root, manifest_import,
};
pub use runtime::{RuntimeKind, detect};
