//! In-memory fake language server for lifecycle tests.
//!
//! [`FakeLauncher`] implements [`Launcher`] over `tokio::io::duplex`, so the
//! full client stack runs against a scripted peer with no OS process. Every
//! frame the fake reads is recorded per connection for assertions.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::json;
use tokio::io::{DuplexStream, split};
use tokio::sync::Notify;

use crate::codec::{FrameReader, FrameWriter};
use crate::error::SpawnError;
use crate::supervisor::{Connection, Launcher};

/// Frames a single fake connection has read, in arrival order.
pub(crate) type FrameLog = Arc<Mutex<Vec<serde_json::Value>>>;

/// Scripted behavior shared by every connection a launcher produces.
#[derive(Debug, Clone)]
pub(crate) struct FakeServer {
    /// The `capabilities` object returned from `initialize`.
    pub capabilities: serde_json::Value,
    /// Drop the connection after reading this many frames. Zero means the
    /// connection dies before the client gets any answer at all.
    pub die_after_frames: Option<usize>,
    /// Launches with index at or past this value fail to spawn.
    pub fail_launches_from: Option<usize>,
    /// Launches never complete; the spawn future pends forever.
    pub stall_launches: bool,
}

impl Default for FakeServer {
    fn default() -> Self {
        Self {
            capabilities: json!({
                "textDocumentSync": 1,
                "completionProvider": {},
                "hoverProvider": true
            }),
            die_after_frames: None,
            fail_launches_from: None,
            stall_launches: false,
        }
    }
}

struct LauncherInner {
    behavior: FakeServer,
    launches: AtomicUsize,
    logs: Mutex<Vec<FrameLog>>,
    crash: Notify,
}

/// Hands out one in-memory connection per launch, each served by its own
/// task. Cloneable so tests keep a handle after the client takes ownership.
#[derive(Clone)]
pub(crate) struct FakeLauncher {
    inner: Arc<LauncherInner>,
}

impl FakeLauncher {
    pub fn new(behavior: FakeServer) -> Self {
        Self {
            inner: Arc::new(LauncherInner {
                behavior,
                launches: AtomicUsize::new(0),
                logs: Mutex::new(Vec::new()),
                crash: Notify::new(),
            }),
        }
    }

    pub fn launch_count(&self) -> usize {
        self.inner.launches.load(Ordering::SeqCst)
    }

    /// The frame log of the `index`-th connection, if it was ever launched.
    pub fn log(&self, index: usize) -> Option<FrameLog> {
        self.inner.logs.lock().unwrap().get(index).cloned()
    }

    /// Snapshot of the `index`-th connection's recorded frames.
    pub fn frames(&self, index: usize) -> Vec<serde_json::Value> {
        self.log(index)
            .map(|log| log.lock().unwrap().clone())
            .unwrap_or_default()
    }

    /// Drop the currently served connection, simulating a server crash.
    pub fn crash_current(&self) {
        self.inner.crash.notify_waiters();
    }
}

impl Launcher for FakeLauncher {
    async fn launch(&self) -> Result<Connection, SpawnError> {
        let index = self.inner.launches.fetch_add(1, Ordering::SeqCst);
        if self.inner.behavior.stall_launches {
            std::future::pending::<()>().await;
        }
        if let Some(from) = self.inner.behavior.fail_launches_from
            && index >= from
        {
            return Err(SpawnError::Io {
                command: "fake-zinc-lsp".to_string(),
                source: std::io::Error::other("scripted launch failure"),
            });
        }

        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let log: FrameLog = Arc::new(Mutex::new(Vec::new()));
        self.inner.logs.lock().unwrap().push(log.clone());
        tokio::spawn(serve(theirs, self.inner.clone(), log));

        let (reader, writer) = split(ours);
        Ok(Connection::from_parts(reader, writer))
    }
}

async fn serve(stream: DuplexStream, inner: Arc<LauncherInner>, log: FrameLog) {
    let (read_half, write_half) = split(stream);
    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half);
    let mut seen = 0usize;

    loop {
        if inner.behavior.die_after_frames == Some(seen) {
            return;
        }
        let frame = tokio::select! {
            () = inner.crash.notified() => return,
            frame = reader.read_frame() => match frame {
                Ok(Some(frame)) => frame,
                Ok(None) | Err(_) => return,
            },
        };
        log.lock().unwrap().push(frame.clone());
        seen += 1;

        let id = frame.get("id").cloned();
        let method = frame
            .get("method")
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string();
        let reply = match (id, method.as_str()) {
            (Some(id), "initialize") => Some(json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": { "capabilities": inner.behavior.capabilities }
            })),
            (Some(id), "shutdown") => {
                Some(json!({ "jsonrpc": "2.0", "id": id, "result": null }))
            }
            (Some(id), _) => Some(json!({ "jsonrpc": "2.0", "id": id, "result": {} })),
            (None, "exit") => return,
            (None, _) => None,
        };
        if let Some(reply) = reply
            && writer.write_frame(&reply).await.is_err()
        {
            return;
        }
    }
}

/// Methods of the recorded frames, in order. Responses the fake never sends
/// itself, so every entry is a client-originated request or notification.
pub(crate) fn methods(frames: &[serde_json::Value]) -> Vec<String> {
    frames
        .iter()
        .filter_map(|f| f.get("method").and_then(|m| m.as_str()))
        .map(str::to_string)
        .collect()
}
