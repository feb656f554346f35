//! Host runtime detection.
//!
//! Each desktop host injects an ambient marker into the process environment
//! when it embeds the frontend. `detect()` probes those markers exactly once
//! and memoizes the answer for the process lifetime; every other component
//! that needs to know which host is active asks this module instead of
//! probing the environment itself.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Marker injected by the modern host launcher.
pub const MODERN_HOST_MARKER: &str = "HOSTBRIDGE_MODERN_HOST";

/// Marker injected by the legacy host launcher.
pub const LEGACY_HOST_MARKER: &str = "HOSTBRIDGE_LEGACY_HOST";

/// The embedding environment the frontend is running under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuntimeKind {
    ModernHost,
    LegacyHost,
    Unknown,
}

impl RuntimeKind {
    /// Stable display name, also used by `Bridge::runtime_name`.
    pub fn name(self) -> &'static str {
        match self {
            RuntimeKind::ModernHost => "ModernHost",
            RuntimeKind::LegacyHost => "LegacyHost",
            RuntimeKind::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Memoized detection result. Once set, the answer never changes for the
/// process lifetime, even if the markers are removed later, because
/// downstream components cache decisions based on the first answer.
static DETECTED: RwLock<Option<RuntimeKind>> = RwLock::new(None);

/// A marker counts as present only when set to a non-empty value.
fn marker_present(name: &str) -> bool {
    std::env::var_os(name).is_some_and(|v| !v.is_empty())
}

/// Probe the ambient environment markers. Modern-host marker wins when both
/// are present.
fn probe_environment() -> RuntimeKind {
    if marker_present(MODERN_HOST_MARKER) {
        RuntimeKind::ModernHost
    } else if marker_present(LEGACY_HOST_MARKER) {
        RuntimeKind::LegacyHost
    } else {
        RuntimeKind::Unknown
    }
}

/// Classify the embedding environment. Never fails: absence of both markers
/// yields `Unknown`, not an error. Repeated calls return the memoized first
/// answer.
pub fn detect() -> RuntimeKind {
    if let Some(kind) = *DETECTED.read() {
        return kind;
    }
    let mut slot = DETECTED.write();
    *slot.get_or_insert_with(probe_environment)
}

/// Pin the detected runtime without touching the environment.
///
/// Test hook: production code must rely on the ambient markers.
pub fn force_runtime(kind: RuntimeKind) {
    *DETECTED.write() = Some(kind);
}

/// Clear the memoized answer so the next `detect()` probes again.
///
/// Test hook: re-detection is only ever needed for test isolation.
pub fn reset_detection() {
    *DETECTED.write() = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn no_markers_yields_unknown() {
        reset_detection();
        // SAFETY: tests mutating the process environment are serialized.
        unsafe {
            std::env::remove_var(MODERN_HOST_MARKER);
            std::env::remove_var(LEGACY_HOST_MARKER);
        }
        assert_eq!(detect(), RuntimeKind::Unknown);
        reset_detection();
    }

    #[test]
    #[serial]
    fn modern_marker_detected() {
        reset_detection();
        unsafe {
            std::env::set_var(MODERN_HOST_MARKER, "1");
            std::env::remove_var(LEGACY_HOST_MARKER);
        }
        assert_eq!(detect(), RuntimeKind::ModernHost);
        unsafe { std::env::remove_var(MODERN_HOST_MARKER) };
        reset_detection();
    }

    #[test]
    #[serial]
    fn modern_wins_when_both_markers_present() {
        reset_detection();
        unsafe {
            std::env::set_var(MODERN_HOST_MARKER, "1");
            std::env::set_var(LEGACY_HOST_MARKER, "1");
        }
        assert_eq!(detect(), RuntimeKind::ModernHost);
        unsafe {
            std::env::remove_var(MODERN_HOST_MARKER);
            std::env::remove_var(LEGACY_HOST_MARKER);
        }
        reset_detection();
    }

    #[test]
    #[serial]
    fn empty_marker_counts_as_absent() {
        reset_detection();
        unsafe {
            std::env::set_var(LEGACY_HOST_MARKER, "");
            std::env::remove_var(MODERN_HOST_MARKER);
        }
        assert_eq!(detect(), RuntimeKind::Unknown);
        unsafe { std::env::remove_var(LEGACY_HOST_MARKER) };
        reset_detection();
    }

    #[test]
    #[serial]
    fn answer_is_memoized_across_marker_changes() {
        reset_detection();
        unsafe {
            std::env::set_var(LEGACY_HOST_MARKER, "1");
            std::env::remove_var(MODERN_HOST_MARKER);
        }
        assert_eq!(detect(), RuntimeKind::LegacyHost);

        // Removing the marker after the first probe must not change the answer.
        unsafe { std::env::remove_var(LEGACY_HOST_MARKER) };
        assert_eq!(detect(), RuntimeKind::LegacyHost);
        reset_detection();
    }

    #[test]
    #[serial]
    fn force_runtime_overrides_probe() {
        reset_detection();
        force_runtime(RuntimeKind::ModernHost);
        assert_eq!(detect(), RuntimeKind::ModernHost);
        reset_detection();
    }

    #[test]
    fn names_are_stable() {
        assert_eq!(RuntimeKind::ModernHost.name(), "ModernHost");
        assert_eq!(RuntimeKind::LegacyHost.name(), "LegacyHost");
        assert_eq!(RuntimeKind::Unknown.name(), "Unknown");
    }
}
