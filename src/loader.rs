//! Frontend plugin loader.
//!
//! Resolves logical plugin identifiers to loaded modules through an
//! injectable import function, with a policy chosen once per runtime kind:
//!
//! - `preload`: whether the critical-path plugin set is loaded
//!   speculatively at startup;
//! - `concurrency`: a process-wide ceiling on simultaneous imports,
//!   enforced by a counting semaphore with FIFO queueing;
//! - `timeout`: per-plugin deadline, raced against the import.
//!
//! Concurrent loads of the same identifier are deduplicated: every caller
//! joins the same in-flight future and the dedup entry is cleared when it
//! settles, so a timed-out load does not pin the identifier forever.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::runtime::RuntimeKind;

/// Load policy for one runtime kind, chosen at loader construction and
/// immutable thereafter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PluginLoadOptions {
    /// Load the critical-path plugin set speculatively during startup.
    pub preload: bool,
    /// Maximum imports in flight simultaneously.
    pub concurrency: usize,
    /// Per-plugin import deadline.
    pub timeout: Duration,
}

impl PluginLoadOptions {
    /// Reference policy. The modern host resolves imports from a local
    /// bundle and gets the tight deadline plus eager preloading; the
    /// legacy host loads through a slower path and gets the patient one.
    /// The values are tunable, the shape (one record per runtime kind)
    /// is the contract.
    pub fn for_runtime(kind: RuntimeKind) -> Self {
        match kind {
            RuntimeKind::ModernHost => Self {
                preload: true,
                concurrency: 8,
                timeout: Duration::from_secs(5),
            },
            RuntimeKind::LegacyHost | RuntimeKind::Unknown => Self {
                preload: false,
                concurrency: 2,
                timeout: Duration::from_secs(30),
            },
        }
    }
}

/// Why a plugin failed to load. Timeouts are worth retrying; hard failures
/// are surfaced to the caller, who decides.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PluginLoadError {
    #[error("plugin \"{plugin_id}\" did not load within {timeout_ms}ms")]
    Timeout { plugin_id: String, timeout_ms: u64 },

    #[error("plugin \"{plugin_id}\" failed to load: {reason}")]
    Failed { plugin_id: String, reason: String },
}

impl PluginLoadError {
    /// Only timeouts are safe to retry automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PluginLoadError::Timeout { .. })
    }

    pub fn plugin_id(&self) -> &str {
        match self {
            PluginLoadError::Timeout { plugin_id, .. } => plugin_id,
            PluginLoadError::Failed { plugin_id, .. } => plugin_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

/// Plugin manifest as declared in `manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    /// Entry point relative to the plugin directory.
    pub entry: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Capabilities a plugin may declare. Anything outside this set is
/// rejected at load time.
const KNOWN_CAPABILITIES: &[&str] = &[
    "terminal:write",
    "filesystem:read",
    "filesystem:write",
    "shell:exec",
    "kubectl:read",
];

/// A loaded plugin module, handed to every caller that requested it.
#[derive(Debug, Clone)]
pub struct PluginModule {
    pub manifest: PluginManifest,
}

/// Returns true if a relative path attempts to escape its root via `..`
/// or absolute components.
fn is_path_escape(relative: &str) -> bool {
    let path = Path::new(relative);
    if path.is_absolute() {
        return true;
    }
    path.components().any(|component| {
        matches!(
            component,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}

/// Validate a parsed manifest for required fields and sanity.
fn validate_manifest(manifest: &PluginManifest, dir_name: &str) -> Result<(), String> {
    if manifest.id.is_empty() {
        return Err("id is empty".into());
    }
    if manifest.id != dir_name {
        return Err(format!(
            "id \"{}\" does not match directory name \"{dir_name}\"",
            manifest.id
        ));
    }
    if manifest.name.is_empty() {
        return Err("name is empty".into());
    }
    if manifest.version.is_empty() {
        return Err("version is empty".into());
    }
    if manifest.entry.is_empty() {
        return Err("entry is empty".into());
    }
    if is_path_escape(&manifest.entry) {
        return Err(format!(
            "entry \"{}\" attempts path traversal",
            manifest.entry
        ));
    }
    for cap in &manifest.capabilities {
        if !KNOWN_CAPABILITIES.contains(&cap.as_str()) {
            return Err(format!("unknown capability: \"{cap}\""));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Import function
// ---------------------------------------------------------------------------

/// The injectable "dynamic import" step. Production resolves plugin
/// directories on disk; tests substitute static tables, keeping the
/// timeout/dedup/concurrency logic independent of how modules are located.
pub type ImportFn =
    Arc<dyn Fn(&str) -> BoxFuture<'static, Result<Arc<PluginModule>, String>> + Send + Sync>;

/// Default import: read and validate `{root}/{id}/manifest.json`.
pub fn manifest_import(root: PathBuf) -> ImportFn {
    Arc::new(move |plugin_id: &str| {
        let root = root.clone();
        let plugin_id = plugin_id.to_string();
        async move {
            if plugin_id.is_empty() || is_path_escape(&plugin_id) {
                return Err(format!("invalid plugin id \"{plugin_id}\""));
            }
            let path = root.join(&plugin_id).join("manifest.json");
            let raw = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
            let manifest: PluginManifest =
                serde_json::from_str(&raw).map_err(|e| format!("invalid manifest.json: {e}"))?;
            validate_manifest(&manifest, &plugin_id)?;
            Ok(Arc::new(PluginModule { manifest }))
        }
        .boxed()
    })
}

/// Default plugins root: `{config_dir}/hostbridge/plugins/`, falling back
/// to a dot directory in `$HOME`.
pub fn default_plugins_root() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("hostbridge"))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".hostbridge")
        })
        .join("plugins")
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

type SharedLoad = Shared<BoxFuture<'static, Result<Arc<PluginModule>, PluginLoadError>>>;

/// Frontend-side plugin loader. Cheap to share behind an `Arc`; all state
/// is internally synchronized.
pub struct PluginLoader {
    options: PluginLoadOptions,
    import: ImportFn,
    semaphore: Arc<Semaphore>,
    in_flight: DashMap<String, SharedLoad>,
}

impl PluginLoader {
    /// Loader with the reference policy for the given runtime kind.
    pub fn new(kind: RuntimeKind, import: ImportFn) -> Self {
        Self::with_options(PluginLoadOptions::for_runtime(kind), import)
    }

    pub fn with_options(options: PluginLoadOptions, import: ImportFn) -> Self {
        let permits = options.concurrency.max(1);
        Self {
            options,
            import,
            semaphore: Arc::new(Semaphore::new(permits)),
            in_flight: DashMap::new(),
        }
    }

    pub fn options(&self) -> PluginLoadOptions {
        self.options
    }

    /// Import slots currently free; diagnostics only.
    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Load one plugin. Concurrent calls for the same identifier join the
    /// same underlying import and all receive the same outcome.
    pub async fn load(&self, plugin_id: &str) -> Result<Arc<PluginModule>, PluginLoadError> {
        if let Some(existing) = self.in_flight.get(plugin_id) {
            let pending = existing.clone();
            drop(existing);
            return pending.await;
        }

        let fresh = self.begin_load(plugin_id);
        let pending = match self.in_flight.entry(plugin_id.to_string()) {
            // Another caller registered between our lookup and here.
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                entry.insert(fresh.clone());
                fresh
            }
        };

        let result = pending.clone().await;
        // Clear the dedup entry once settled, but only our own: a later
        // load for the same id may already be in flight.
        self.in_flight
            .remove_if(plugin_id, |_, current| pending.ptr_eq(current));
        result
    }

    /// Speculatively load the critical-path plugin set. A no-op when the
    /// active policy disables preloading. Individual failures are logged
    /// and returned; one broken plugin never aborts the rest.
    pub async fn preload<I, S>(
        &self,
        plugin_ids: I,
    ) -> Vec<(String, Result<Arc<PluginModule>, PluginLoadError>)>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if !self.options.preload {
            debug!("preload disabled for this runtime, skipping");
            return Vec::new();
        }

        let loads = plugin_ids.into_iter().map(|id| {
            let id = id.into();
            async move {
                let result = self.load(&id).await;
                if let Err(e) = &result {
                    warn!(plugin = %id, error = %e, "preload failed");
                }
                (id, result)
            }
        });
        futures_util::future::join_all(loads).await
    }

    /// Build the shared future that performs one import under the
    /// semaphore, raced against the configured deadline.
    fn begin_load(&self, plugin_id: &str) -> SharedLoad {
        let plugin_id = plugin_id.to_string();
        let import = self.import.clone();
        let semaphore = self.semaphore.clone();
        let timeout = self.options.timeout;

        async move {
            // The permit is held for the lifetime of this block and
            // released on every exit path, including the timeout.
            let _permit = semaphore.acquire_owned().await.map_err(|_| {
                PluginLoadError::Failed {
                    plugin_id: plugin_id.clone(),
                    reason: "loader shut down".into(),
                }
            })?;

            // Run the import as a detached task: the underlying step
            // cannot be aborted once started, so on timeout it is left to
            // finish in the background and its result is discarded.
            let task = tokio::spawn(import(&plugin_id));
            match tokio::time::timeout(timeout, task).await {
                Err(_elapsed) => {
                    let timeout_ms = timeout.as_millis() as u64;
                    warn!(plugin = %plugin_id, timeout_ms, "plugin load timed out");
                    Err(PluginLoadError::Timeout {
                        plugin_id,
                        timeout_ms,
                    })
                }
                Ok(Err(join_error)) => Err(PluginLoadError::Failed {
                    plugin_id,
                    reason: format!("import task failed: {join_error}"),
                }),
                Ok(Ok(Ok(module))) => {
                    debug!(plugin = %module.manifest.id, version = %module.manifest.version, "plugin loaded");
                    Ok(module)
                }
                Ok(Ok(Err(reason))) => Err(PluginLoadError::Failed { plugin_id, reason }),
            }
        }
        .boxed()
        .shared()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
