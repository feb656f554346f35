//! Terminal module: PTY-like session read/write.
//!
//! Each `open` spawns a shell in a fresh PTY and a reader thread that
//! copies output through a UTF-8 reassembly buffer into a fixed-capacity
//! ring. The frontend polls output with `read` instead of receiving a push
//! stream, which keeps the module host-agnostic; the embedding layer may
//! layer events on top if it wants push semantics.
//!
//! Methods: `open`, `write`, `read`, `resize`, `close`, `list`, `stats`.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use portable_pty::{CommandBuilder, PtySize, native_pty_system};
use serde_json::{Value, json};
use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{optional_u64, required_str, required_u64};
use crate::dispatch::ModuleHandler;

/// Upper bound on simultaneously open sessions.
const MAX_SESSIONS: usize = 32;

/// Capacity of each session's output ring (64 KB).
const RING_CAPACITY: usize = 64 * 1024;

/// Bytes returned by `read` when no limit is given.
const DEFAULT_READ_LIMIT: usize = 16 * 1024;

// ---------------------------------------------------------------------------
// Output ring
// ---------------------------------------------------------------------------

/// Fixed-capacity circular byte buffer. Consumers poll the last N bytes and
/// use the monotonic total to detect data they missed.
pub(crate) struct OutputRing {
    buf: Vec<u8>,
    capacity: usize,
    write_pos: usize,
    /// Total bytes ever written; never wraps.
    total_written: u64,
}

impl OutputRing {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            capacity,
            write_pos: 0,
            total_written: 0,
        }
    }

    pub(crate) fn write(&mut self, data: &[u8]) {
        // Only the trailing `capacity` bytes of an oversized chunk can
        // survive anyway.
        let data = if data.len() > self.capacity {
            &data[data.len() - self.capacity..]
        } else {
            data
        };
        let first = (self.capacity - self.write_pos).min(data.len());
        self.buf[self.write_pos..self.write_pos + first].copy_from_slice(&data[..first]);
        if first < data.len() {
            let rest = data.len() - first;
            self.buf[..rest].copy_from_slice(&data[first..]);
            self.write_pos = rest;
        } else {
            self.write_pos = (self.write_pos + first) % self.capacity;
        }
        self.total_written += data.len() as u64;
    }

    /// Last `limit` bytes (or fewer) plus the monotonic total.
    pub(crate) fn read_last(&self, limit: usize) -> (Vec<u8>, u64) {
        let available = (self.total_written as usize).min(self.capacity);
        let to_read = limit.min(available);
        if to_read == 0 {
            return (Vec::new(), self.total_written);
        }
        let start = (self.write_pos + self.capacity - to_read) % self.capacity;
        let mut out = Vec::with_capacity(to_read);
        for i in 0..to_read {
            out.push(self.buf[(start + i) % self.capacity]);
        }
        (out, self.total_written)
    }
}

// ---------------------------------------------------------------------------
// UTF-8 reassembly
// ---------------------------------------------------------------------------

/// Joins multi-byte UTF-8 sequences split across PTY read boundaries.
/// Incomplete trailing bytes are carried to the next chunk; invalid bytes
/// are replaced, never dropped silently.
pub(crate) struct Utf8Assembler {
    carry: Vec<u8>,
}

impl Utf8Assembler {
    pub(crate) fn new() -> Self {
        Self {
            carry: Vec::with_capacity(4),
        }
    }

    pub(crate) fn push(&mut self, bytes: &[u8]) -> String {
        let mut data = std::mem::take(&mut self.carry);
        data.extend_from_slice(bytes);

        match std::str::from_utf8(&data) {
            Ok(s) => s.to_string(),
            Err(e) if e.error_len().is_none() => {
                // Incomplete sequence at the end: hold it back.
                let valid = e.valid_up_to();
                self.carry.extend_from_slice(&data[valid..]);
                String::from_utf8_lossy(&data[..valid]).into_owned()
            }
            Err(_) => {
                // Genuinely invalid bytes somewhere: replace and move on.
                String::from_utf8_lossy(&data).into_owned()
            }
        }
    }

    /// Flush carried bytes at EOF; an incomplete sequence becomes U+FFFD.
    pub(crate) fn flush(&mut self) -> String {
        if self.carry.is_empty() {
            return String::new();
        }
        let rest = std::mem::take(&mut self.carry);
        String::from_utf8_lossy(&rest).into_owned()
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

struct TerminalSession {
    writer: Box<dyn Write + Send>,
    master: Box<dyn portable_pty::MasterPty + Send>,
    child: Box<dyn portable_pty::Child + Send + Sync>,
}

/// Lock-free counters for diagnostics, surfaced via the `stats` method.
struct TerminalMetrics {
    total_spawned: AtomicUsize,
    active_sessions: AtomicUsize,
    bytes_captured: AtomicUsize,
}

struct TerminalState {
    sessions: DashMap<String, Mutex<TerminalSession>>,
    output: DashMap<String, Mutex<OutputRing>>,
    metrics: TerminalMetrics,
}

/// Platform default shell when the caller does not specify one.
fn default_shell() -> String {
    #[cfg(windows)]
    {
        std::env::var("COMSPEC").unwrap_or_else(|_| "powershell.exe".to_string())
    }
    #[cfg(not(windows))]
    {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }
}

/// Shell command with the environment terminals expect. Sessions spawned
/// from a GUI host do not inherit a parent terminal's env vars.
fn build_shell_command(shell: &str, cwd: Option<&str>) -> CommandBuilder {
    let mut cmd = CommandBuilder::new(shell);
    #[cfg(not(windows))]
    {
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");
    }
    if let Some(dir) = cwd {
        cmd.cwd(dir);
    }
    cmd
}

/// PTY session manager behind the `terminal` routing key.
pub struct TerminalModule {
    state: Arc<TerminalState>,
}

impl TerminalModule {
    pub fn new() -> Self {
        Self {
            state: Arc::new(TerminalState {
                sessions: DashMap::new(),
                output: DashMap::new(),
                metrics: TerminalMetrics {
                    total_spawned: AtomicUsize::new(0),
                    active_sessions: AtomicUsize::new(0),
                    bytes_captured: AtomicUsize::new(0),
                },
            }),
        }
    }

    fn open(&self, args: &[Value]) -> Result<Value, String> {
        if self.state.sessions.len() >= MAX_SESSIONS {
            return Err(format!(
                "session limit reached ({MAX_SESSIONS}); close a session first"
            ));
        }

        let rows = super::object_u64(args, 0, "rows").unwrap_or(24).clamp(1, 512) as u16;
        let cols = super::object_u64(args, 0, "cols").unwrap_or(80).clamp(1, 512) as u16;
        let shell = super::object_str(args, 0, "shell")
            .map(str::to_string)
            .unwrap_or_else(default_shell);
        let cwd = super::object_str(args, 0, "cwd");

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| format!("failed to open PTY: {e}"))?;

        let child = pair
            .slave
            .spawn_command(build_shell_command(&shell, cwd))
            .map_err(|e| format!("failed to spawn shell \"{shell}\": {e}"))?;

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| format!("failed to get PTY writer: {e}"))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| format!("failed to get PTY reader: {e}"))?;

        let session_id = Uuid::new_v4().to_string();
        self.state.sessions.insert(
            session_id.clone(),
            Mutex::new(TerminalSession {
                writer,
                master: pair.master,
                child,
            }),
        );
        self.state
            .output
            .insert(session_id.clone(), Mutex::new(OutputRing::new(RING_CAPACITY)));
        self.state.metrics.total_spawned.fetch_add(1, Ordering::Relaxed);
        self.state.metrics.active_sessions.fetch_add(1, Ordering::Relaxed);

        spawn_reader_thread(reader, session_id.clone(), self.state.clone());
        debug!(session = %session_id, %shell, rows, cols, "terminal session opened");
        Ok(json!({ "sessionId": session_id }))
    }

    fn write(&self, args: &[Value]) -> Result<Value, String> {
        let session_id = required_str(args, 0, "sessionId")?;
        let data = required_str(args, 1, "data")?;
        let entry = self
            .state
            .sessions
            .get(session_id)
            .ok_or_else(|| format!("session not found: {session_id}"))?;
        let mut session = entry.lock();
        session
            .writer
            .write_all(data.as_bytes())
            .map_err(|e| format!("failed to write to PTY: {e}"))?;
        session
            .writer
            .flush()
            .map_err(|e| format!("failed to flush PTY: {e}"))?;
        Ok(Value::Null)
    }

    fn read(&self, args: &[Value]) -> Result<Value, String> {
        let session_id = required_str(args, 0, "sessionId")?;
        let limit = optional_u64(args, 1).unwrap_or(DEFAULT_READ_LIMIT as u64) as usize;
        let ring = self
            .state
            .output
            .get(session_id)
            .ok_or_else(|| format!("session not found: {session_id}"))?;
        let (bytes, total) = ring.lock().read_last(limit.min(RING_CAPACITY));
        Ok(json!({
            "data": String::from_utf8_lossy(&bytes),
            "totalWritten": total,
        }))
    }

    fn resize(&self, args: &[Value]) -> Result<Value, String> {
        let session_id = required_str(args, 0, "sessionId")?;
        let rows = required_u64(args, 1, "rows")?;
        let cols = required_u64(args, 2, "cols")?;
        if rows == 0 || cols == 0 {
            return Err("invalid dimensions: rows and cols must be > 0".to_string());
        }
        let entry = self
            .state
            .sessions
            .get(session_id)
            .ok_or_else(|| format!("session not found: {session_id}"))?;
        entry
            .lock()
            .master
            .resize(PtySize {
                rows: rows as u16,
                cols: cols as u16,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| format!("failed to resize PTY: {e}"))?;
        Ok(Value::Null)
    }

    fn close(&self, args: &[Value]) -> Result<Value, String> {
        let session_id = required_str(args, 0, "sessionId")?;
        let Some((_, session)) = self.state.sessions.remove(session_id) else {
            return Err(format!("session not found: {session_id}"));
        };
        if let Err(e) = session.lock().child.kill() {
            // The shell may already have exited; the reader thread does the
            // remaining cleanup either way.
            debug!(session = %session_id, "kill on close: {e}");
        }
        self.state.output.remove(session_id);
        self.state.metrics.active_sessions.fetch_sub(1, Ordering::Relaxed);
        Ok(Value::Null)
    }

    fn list(&self) -> Value {
        let ids: Vec<String> = self
            .state
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        json!(ids)
    }

    fn stats(&self) -> Value {
        json!({
            "totalSpawned": self.state.metrics.total_spawned.load(Ordering::Relaxed),
            "activeSessions": self.state.metrics.active_sessions.load(Ordering::Relaxed),
            "bytesCaptured": self.state.metrics.bytes_captured.load(Ordering::Relaxed),
            "maxSessions": MAX_SESSIONS,
        })
    }
}

impl Default for TerminalModule {
    fn default() -> Self {
        Self::new()
    }
}

/// Reader thread: PTY bytes -> UTF-8 reassembly -> output ring. Cleans the
/// session up at EOF so a shell exiting on its own does not leak an entry.
fn spawn_reader_thread(mut reader: Box<dyn Read + Send>, session_id: String, state: Arc<TerminalState>) {
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        let mut assembler = Utf8Assembler::new();
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    state.metrics.bytes_captured.fetch_add(n, Ordering::Relaxed);
                    let text = assembler.push(&buf[..n]);
                    if !text.is_empty()
                        && let Some(ring) = state.output.get(&session_id)
                    {
                        ring.lock().write(text.as_bytes());
                    }
                }
            }
        }
        let tail = assembler.flush();
        if !tail.is_empty()
            && let Some(ring) = state.output.get(&session_id)
        {
            ring.lock().write(tail.as_bytes());
        }
        // Session may already be gone if `close` ran first.
        if state.sessions.remove(&session_id).is_some() {
            state.output.remove(&session_id);
            state.metrics.active_sessions.fetch_sub(1, Ordering::Relaxed);
        }
        debug!(session = %session_id, "terminal session ended");
    });
}

#[async_trait]
impl ModuleHandler for TerminalModule {
    async fn handle(&self, method: &str, args: &[Value]) -> Result<Value, String> {
        match method {
            "open" => self.open(args),
            "write" => self.write(args),
            "read" => self.read(args),
            "resize" => self.resize(args),
            "close" => self.close(args),
            "list" => Ok(self.list()),
            "stats" => Ok(self.stats()),
            other => {
                warn!(method = other, "terminal module has no such method");
                Err(format!("terminal module has no method \"{other}\""))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // -- Output ring --

    #[test]
    fn ring_returns_written_bytes() {
        let mut ring = OutputRing::new(16);
        ring.write(b"hello");
        let (data, total) = ring.read_last(16);
        assert_eq!(&data, b"hello");
        assert_eq!(total, 5);
    }

    #[test]
    fn ring_wraps_around() {
        let mut ring = OutputRing::new(8);
        ring.write(b"12345678");
        ring.write(b"AB");
        let (data, total) = ring.read_last(8);
        assert_eq!(&data, b"345678AB");
        assert_eq!(total, 10);
    }

    #[test]
    fn ring_reads_requested_tail_only() {
        let mut ring = OutputRing::new(16);
        ring.write(b"hello world");
        let (data, _) = ring.read_last(5);
        assert_eq!(&data, b"world");
    }

    #[test]
    fn ring_handles_oversized_chunk() {
        let mut ring = OutputRing::new(4);
        ring.write(b"abcdefgh");
        let (data, total) = ring.read_last(4);
        assert_eq!(&data, b"efgh");
        assert_eq!(total, 8);
    }

    #[test]
    fn ring_empty_read() {
        let ring = OutputRing::new(8);
        let (data, total) = ring.read_last(8);
        assert!(data.is_empty());
        assert_eq!(total, 0);
    }

    // -- UTF-8 reassembly --

    #[test]
    fn assembler_passes_ascii_through() {
        let mut asm = Utf8Assembler::new();
        assert_eq!(asm.push(b"plain"), "plain");
    }

    #[test]
    fn assembler_joins_split_multibyte() {
        let mut asm = Utf8Assembler::new();
        let euro = "€".as_bytes();
        assert_eq!(asm.push(&euro[..1]), "");
        assert_eq!(asm.push(&euro[1..]), "€");
    }

    #[test]
    fn assembler_joins_split_four_byte_sequence() {
        let mut asm = Utf8Assembler::new();
        let crab = "🦀".as_bytes();
        assert_eq!(asm.push(&crab[..2]), "");
        assert_eq!(asm.push(&crab[2..]), "🦀");
    }

    #[test]
    fn assembler_replaces_invalid_bytes() {
        let mut asm = Utf8Assembler::new();
        let out = asm.push(&[b'a', 0xFF, b'b']);
        assert!(out.contains('\u{FFFD}'));
        assert!(out.starts_with('a') && out.ends_with('b'));
    }

    #[test]
    fn assembler_flush_replaces_incomplete_tail() {
        let mut asm = Utf8Assembler::new();
        assert_eq!(asm.push(&[0xE2]), "");
        assert!(asm.flush().contains('\u{FFFD}'));
        assert_eq!(asm.flush(), "");
    }

    // -- Handler surface --

    #[tokio::test]
    async fn unknown_method_is_an_error() {
        let module = TerminalModule::new();
        let err = module.handle("teleport", &[]).await.err().unwrap();
        assert!(err.contains("teleport"));
    }

    #[tokio::test]
    async fn write_to_missing_session_is_an_error() {
        let module = TerminalModule::new();
        let err = module
            .handle("write", &[json!("nope"), json!("ls\n")])
            .await
            .err()
            .unwrap();
        assert!(err.contains("session not found"));
    }

    #[tokio::test]
    async fn resize_rejects_zero_dimensions() {
        let module = TerminalModule::new();
        let err = module
            .handle("resize", &[json!("id"), json!(0), json!(80)])
            .await
            .err()
            .unwrap();
        assert!(err.contains("rows and cols"));
    }

    #[tokio::test]
    async fn list_and_stats_start_empty() {
        let module = TerminalModule::new();
        assert_eq!(module.handle("list", &[]).await.unwrap(), json!([]));
        let stats = module.handle("stats", &[]).await.unwrap();
        assert_eq!(stats["activeSessions"], json!(0));
        assert_eq!(stats["maxSessions"], json!(MAX_SESSIONS));
    }

    // -- Live session (unix only) --

    #[cfg(unix)]
    #[tokio::test]
    async fn open_write_read_close_round_trip() {
        let module = TerminalModule::new();
        let opened = module
            .handle("open", &[json!({"shell": "/bin/sh", "rows": 24, "cols": 80})])
            .await
            .unwrap();
        let session_id = opened["sessionId"].as_str().unwrap().to_string();

        module
            .handle("write", &[json!(session_id), json!("echo bridge_ready\n")])
            .await
            .unwrap();

        // Poll the ring until the shell echoes back (or give up).
        let mut seen = String::new();
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            let out = module
                .handle("read", &[json!(session_id)])
                .await
                .unwrap();
            seen = out["data"].as_str().unwrap_or_default().to_string();
            if seen.contains("bridge_ready") {
                break;
            }
        }
        assert!(seen.contains("bridge_ready"), "no echo captured: {seen:?}");

        module.handle("close", &[json!(session_id)]).await.unwrap();
        let listed = module.handle("list", &[]).await.unwrap();
        assert_eq!(listed, json!([]));
    }
}
