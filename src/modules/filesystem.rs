//! Filesystem module: restricted file read/write.
//!
//! All paths must be absolute and resolve inside the sandbox root (the
//! user's home directory by default). Reads are size-capped; writes create
//! missing parent directories inside the sandbox.
//!
//! Methods: `read`, `write`, `list`, `exists`.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::path::{Component, Path, PathBuf};

use super::required_str;
use crate::dispatch::ModuleHandler;

/// Maximum file size readable through this module (10 MB).
const MAX_READ_BYTES: u64 = 10 * 1024 * 1024;

/// Sandboxed filesystem access behind the `filesystem` routing key.
pub struct FilesystemModule {
    root: PathBuf,
}

impl FilesystemModule {
    /// Sandbox rooted at the user's home directory. Falls back to the
    /// process working directory when no home is known (containers).
    pub fn new() -> Self {
        Self::with_root(
            dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")),
        )
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Lexical validation shared by every method: absolute, no `..`
    /// components, inside the root.
    fn checked_path(&self, raw: &str) -> Result<PathBuf, String> {
        if raw.is_empty() {
            return Err("path is empty".into());
        }
        let path = PathBuf::from(raw);
        if !path.is_absolute() {
            return Err("path must be absolute".into());
        }
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err("path traversal not allowed".into());
        }
        if !path.starts_with(&self.root) {
            return Err(format!(
                "path must be within {}",
                self.root.display()
            ));
        }
        Ok(path)
    }

    /// Stricter check for reads: resolve symlinks and verify the real
    /// location is still inside the root.
    fn checked_existing_path(&self, raw: &str) -> Result<PathBuf, String> {
        let path = self.checked_path(raw)?;
        let canonical = path
            .canonicalize()
            .map_err(|e| format!("failed to resolve path: {e}"))?;
        let root = self
            .root
            .canonicalize()
            .map_err(|e| format!("failed to resolve sandbox root: {e}"))?;
        if !canonical.starts_with(&root) {
            return Err(format!("path must be within {}", self.root.display()));
        }
        Ok(canonical)
    }

    fn read(&self, args: &[Value]) -> Result<Value, String> {
        let path = self.checked_existing_path(required_str(args, 0, "path")?)?;
        let meta = std::fs::metadata(&path).map_err(|e| format!("failed to stat file: {e}"))?;
        if !meta.is_file() {
            return Err(format!("not a file: {}", path.display()));
        }
        if meta.len() > MAX_READ_BYTES {
            return Err(format!(
                "file exceeds maximum readable size ({} bytes > {MAX_READ_BYTES} bytes)",
                meta.len()
            ));
        }
        let content =
            std::fs::read_to_string(&path).map_err(|e| format!("failed to read file: {e}"))?;
        Ok(Value::String(content))
    }

    fn write(&self, args: &[Value]) -> Result<Value, String> {
        let path = self.checked_path(required_str(args, 0, "path")?)?;
        let content = required_str(args, 1, "content")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("failed to create parent directory: {e}"))?;
        }
        std::fs::write(&path, content).map_err(|e| format!("failed to write file: {e}"))?;
        Ok(Value::Null)
    }

    fn list(&self, args: &[Value]) -> Result<Value, String> {
        let path = self.checked_existing_path(required_str(args, 0, "path")?)?;
        let entries =
            std::fs::read_dir(&path).map_err(|e| format!("failed to list directory: {e}"))?;

        let mut listing = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let meta = entry.metadata().ok();
            listing.push(json!({
                "name": name,
                "isDir": meta.as_ref().is_some_and(|m| m.is_dir()),
                "size": meta.as_ref().map(|m| m.len()).unwrap_or(0),
            }));
        }
        listing.sort_by(|a, b| {
            a["name"]
                .as_str()
                .unwrap_or_default()
                .cmp(b["name"].as_str().unwrap_or_default())
        });
        Ok(Value::Array(listing))
    }

    fn exists(&self, args: &[Value]) -> Result<Value, String> {
        let path = self.checked_path(required_str(args, 0, "path")?)?;
        Ok(Value::Bool(Path::new(&path).exists()))
    }
}

impl Default for FilesystemModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModuleHandler for FilesystemModule {
    async fn handle(&self, method: &str, args: &[Value]) -> Result<Value, String> {
        match method {
            "read" => self.read(args),
            "write" => self.write(args),
            "list" => self.list(args),
            "exists" => self.exists(args),
            other => Err(format!("filesystem module has no method \"{other}\"")),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sandbox() -> (TempDir, FilesystemModule) {
        let dir = TempDir::new().unwrap();
        let module = FilesystemModule::with_root(dir.path());
        (dir, module)
    }

    #[tokio::test]
    async fn write_then_read_round_trip() {
        let (dir, module) = sandbox();
        let path = dir.path().join("notes/today.md");
        let path = path.to_str().unwrap();

        module
            .handle("write", &[json!(path), json!("hello")])
            .await
            .unwrap();
        let content = module.handle("read", &[json!(path)]).await.unwrap();
        assert_eq!(content, json!("hello"));
    }

    #[tokio::test]
    async fn read_outside_root_is_rejected() {
        let (_dir, module) = sandbox();
        let err = module
            .handle("read", &[json!("/etc/passwd")])
            .await
            .err()
            .unwrap();
        assert!(err.contains("must be within"));
    }

    #[tokio::test]
    async fn relative_path_is_rejected() {
        let (_dir, module) = sandbox();
        let err = module
            .handle("read", &[json!("relative/path.txt")])
            .await
            .err()
            .unwrap();
        assert!(err.contains("absolute"));
    }

    #[tokio::test]
    async fn parent_traversal_is_rejected() {
        let (dir, module) = sandbox();
        let sneaky = format!("{}/sub/../../outside.txt", dir.path().display());
        let err = module
            .handle("write", &[json!(sneaky), json!("x")])
            .await
            .err()
            .unwrap();
        assert!(err.contains("traversal"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_escape_is_rejected_on_read() {
        let (dir, module) = sandbox();
        let link = dir.path().join("escape");
        std::os::unix::fs::symlink("/etc", &link).unwrap();
        let target = format!("{}/passwd", link.display());
        let err = module.handle("read", &[json!(target)]).await.err().unwrap();
        assert!(err.contains("must be within"));
    }

    #[tokio::test]
    async fn list_reports_entries_sorted() {
        let (dir, module) = sandbox();
        std::fs::write(dir.path().join("b.txt"), "bb").unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let listing = module
            .handle("list", &[json!(dir.path().to_str().unwrap())])
            .await
            .unwrap();
        let names: Vec<&str> = listing
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "sub"]);
        assert_eq!(listing[2]["isDir"], json!(true));
    }

    #[tokio::test]
    async fn exists_distinguishes_present_and_absent() {
        let (dir, module) = sandbox();
        std::fs::write(dir.path().join("here.txt"), "x").unwrap();

        let present = format!("{}/here.txt", dir.path().display());
        let absent = format!("{}/gone.txt", dir.path().display());
        assert_eq!(module.handle("exists", &[json!(present)]).await.unwrap(), json!(true));
        assert_eq!(module.handle("exists", &[json!(absent)]).await.unwrap(), json!(false));
    }

    #[tokio::test]
    async fn unknown_method_is_an_error() {
        let (_dir, module) = sandbox();
        let err = module.handle("chmod", &[]).await.err().unwrap();
        assert!(err.contains("chmod"));
    }

    #[tokio::test]
    async fn missing_arguments_are_reported() {
        let (_dir, module) = sandbox();
        let err = module.handle("read", &[]).await.err().unwrap();
        assert!(err.contains("path"));
    }
}
