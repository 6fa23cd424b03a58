//! Public types consumed by the embedding editor.
//!
//! The editor constructs a [`ClientConfig`], observes [`SessionState`]
//! transitions, receives [`ClientEvent`]s, and reads
//! [`DiagnosticsSnapshot`]s for display.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Executable name used when [`ClientConfig::server_path`] is unset.
pub const DEFAULT_SERVER_COMMAND: &str = "zinc-lsp";

fn default_language_id() -> String {
    "zinc".to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_shutdown_grace_ms() -> u64 {
    2_000
}

/// Configuration for one client session.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Override for the server executable. Falls back to `zinc-lsp` on PATH.
    #[serde(default)]
    pub server_path: Option<PathBuf>,
    /// Arguments passed to the server. The protocol requires none.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for the spawned server, also used as the
    /// workspace root sent in `initialize`.
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    /// LSP language identifier sent in `didOpen`.
    #[serde(default = "default_language_id")]
    pub language_id: String,
    /// Deadline for individual requests, including `initialize`.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// How long a graceful shutdown waits before killing the process.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Crash-loop policy.
    #[serde(default)]
    pub restart: RestartPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_path: None,
            args: Vec::new(),
            workdir: None,
            language_id: default_language_id(),
            request_timeout_ms: default_request_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            restart: RestartPolicy::default(),
        }
    }
}

impl ClientConfig {
    /// The command to spawn: the configured path, or the default name.
    #[must_use]
    pub fn command(&self) -> String {
        self.server_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| DEFAULT_SERVER_COMMAND.to_string())
    }

    pub(crate) fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub(crate) fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

fn default_max_restarts() -> u32 {
    3
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_base_backoff_ms() -> u64 {
    250
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

/// Bounded automatic-restart policy: at most `max_restarts` crashes within
/// a sliding `window_ms`, with exponential backoff between attempts.
/// Exceeding the bound ends the session in terminal `Crashed`.
#[derive(Debug, Clone, Deserialize)]
pub struct RestartPolicy {
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            window_ms: default_window_ms(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RestartPolicy {
    pub(crate) fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub(crate) fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub(crate) fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// The authoritative session state. Exactly one value holds at a time;
/// every other piece of session data is meaningful only relative to it.
///
/// `Stopped` and `Crashed` are terminal: a new client must be created to
/// start again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    Starting,
    Negotiating,
    Running,
    Restarting,
    Stopping,
    Stopped,
    Crashed,
}

impl SessionState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Crashed)
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::NotStarted => "not started",
            Self::Starting => "starting",
            Self::Negotiating => "negotiating",
            Self::Running => "running",
            Self::Restarting => "restarting",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// An event surfaced to the embedding editor.
#[derive(Debug)]
pub enum ClientEvent {
    /// Diagnostics updated for a document. An empty list clears them.
    Diagnostics {
        uri: String,
        items: Vec<ZincDiagnostic>,
    },
    /// The session reached terminal `Crashed`. Emitted exactly once per
    /// terminal transition, regardless of how many crashes preceded it.
    Failed { reason: String },
}

/// Zero-indexed position within a document, in lines and characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    #[must_use]
    pub fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }
}

/// Half-open range within a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

/// One incremental edit: replace `range` with `text`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextDelta {
    pub range: Range,
    pub text: String,
}

/// An editor-originated document edit, either a whole-document replacement
/// or a set of deltas. Translation to the wire shape depends on the
/// negotiated sync mode, not on which variant the editor supplied.
#[derive(Debug, Clone)]
pub enum DocumentEdit {
    Full(String),
    Incremental(Vec<TextDelta>),
}

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiagnosticSeverity {
    Error = 1,
    Warning = 2,
    Information = 3,
    Hint = 4,
}

impl DiagnosticSeverity {
    /// Convert from the wire's numeric severity (1=Error .. 4=Hint).
    /// Returns `None` outside the defined range; callers pick the fallback.
    #[must_use]
    pub fn from_lsp(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::Error),
            2 => Some(Self::Warning),
            3 => Some(Self::Information),
            4 => Some(Self::Hint),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self == Self::Error
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Information => "info",
            Self::Hint => "hint",
        }
    }
}

/// A single diagnostic pushed by the Zinc server.
///
/// Fields are private; external consumers read via accessors.
#[derive(Debug, Clone)]
pub struct ZincDiagnostic {
    severity: DiagnosticSeverity,
    message: String,
    /// 0-indexed line number.
    line: u32,
    /// 0-indexed column.
    col: u32,
    source: String,
}

impl ZincDiagnostic {
    #[must_use]
    pub fn new(
        severity: DiagnosticSeverity,
        message: String,
        line: u32,
        col: u32,
        source: String,
    ) -> Self {
        Self {
            severity,
            message,
            line,
            col,
            source,
        }
    }

    #[must_use]
    pub fn severity(&self) -> DiagnosticSeverity {
        self.severity
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 0-indexed line number.
    #[must_use]
    pub fn line(&self) -> u32 {
        self.line
    }

    /// 0-indexed column.
    #[must_use]
    pub fn col(&self) -> u32 {
        self.col
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Format as `uri:line:col: severity: message` (1-indexed for display).
    #[must_use]
    pub fn display_with_uri(&self, uri: &str) -> String {
        format!(
            "{uri}:{}:{}: {}: [{}] {}",
            self.line + 1,
            self.col + 1,
            self.severity.label(),
            self.source,
            self.message,
        )
    }
}

/// Immutable snapshot of all diagnostics, suitable for rendering.
///
/// Counts are computed from the canonical per-document lists rather than
/// cached alongside them.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticsSnapshot {
    /// Per-document diagnostics, documents with errors first.
    documents: Vec<(String, Vec<ZincDiagnostic>)>,
}

impl DiagnosticsSnapshot {
    pub(crate) fn new(documents: Vec<(String, Vec<ZincDiagnostic>)>) -> Self {
        Self { documents }
    }

    /// Per-document diagnostics, documents with errors first.
    #[must_use]
    pub fn documents(&self) -> &[(String, Vec<ZincDiagnostic>)] {
        &self.documents
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    fn count_by_severity(&self, severity: DiagnosticSeverity) -> usize {
        self.documents
            .iter()
            .flat_map(|(_, items)| items)
            .filter(|d| d.severity() == severity)
            .count()
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.count_by_severity(DiagnosticSeverity::Error)
    }

    #[must_use]
    pub fn warning_count(&self) -> usize {
        self.count_by_severity(DiagnosticSeverity::Warning)
    }

    /// Total diagnostic count across all documents.
    #[must_use]
    pub fn total_count(&self) -> usize {
        self.documents.iter().map(|(_, items)| items.len()).sum()
    }

    /// Compact status string like "E:3 W:5"; empty when clean.
    #[must_use]
    pub fn status_string(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        format!("E:{} W:{}", self.error_count(), self.warning_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_diag(severity: DiagnosticSeverity, msg: &str) -> ZincDiagnostic {
        ZincDiagnostic::new(severity, msg.to_string(), 10, 5, "zinc".to_string())
    }

    #[test]
    fn config_defaults() {
        let config: ClientConfig = serde_json::from_str("{}").unwrap();
        assert!(config.server_path.is_none());
        assert_eq!(config.command(), DEFAULT_SERVER_COMMAND);
        assert_eq!(config.language_id, "zinc");
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.restart.max_restarts, 3);
    }

    #[test]
    fn config_with_override() {
        let config: ClientConfig = serde_json::from_value(serde_json::json!({
            "server_path": "/opt/zinc/bin/zinc-lsp",
            "args": ["--log-level", "debug"],
            "restart": { "max_restarts": 1, "base_backoff_ms": 10 }
        }))
        .unwrap();
        assert_eq!(config.command(), "/opt/zinc/bin/zinc-lsp");
        assert_eq!(config.args.len(), 2);
        assert_eq!(config.restart.max_restarts, 1);
        assert_eq!(config.restart.base_backoff(), Duration::from_millis(10));
        // Unspecified policy fields keep their defaults.
        assert_eq!(config.restart.window_ms, 60_000);
    }

    #[test]
    fn severity_from_lsp() {
        assert_eq!(DiagnosticSeverity::from_lsp(1), Some(DiagnosticSeverity::Error));
        assert_eq!(DiagnosticSeverity::from_lsp(4), Some(DiagnosticSeverity::Hint));
        assert_eq!(DiagnosticSeverity::from_lsp(0), None);
        assert_eq!(DiagnosticSeverity::from_lsp(99), None);
    }

    #[test]
    fn terminal_states() {
        assert!(SessionState::Stopped.is_terminal());
        assert!(SessionState::Crashed.is_terminal());
        assert!(!SessionState::Running.is_terminal());
        assert!(!SessionState::Restarting.is_terminal());
    }

    #[test]
    fn state_display_uses_label() {
        assert_eq!(SessionState::NotStarted.to_string(), "not started");
        assert_eq!(SessionState::Running.to_string(), "running");
    }

    #[test]
    fn diagnostic_display_is_one_indexed() {
        let diag = make_diag(DiagnosticSeverity::Error, "expected `;`");
        assert_eq!(
            diag.display_with_uri("file:///a.zn"),
            "file:///a.zn:11:6: error: [zinc] expected `;`"
        );
    }

    #[test]
    fn snapshot_counts() {
        let snap = DiagnosticsSnapshot::new(vec![(
            "file:///a.zn".to_string(),
            vec![
                make_diag(DiagnosticSeverity::Error, "e1"),
                make_diag(DiagnosticSeverity::Warning, "w1"),
                make_diag(DiagnosticSeverity::Warning, "w2"),
                make_diag(DiagnosticSeverity::Hint, "h1"),
            ],
        )]);
        assert_eq!(snap.total_count(), 4);
        assert_eq!(snap.error_count(), 1);
        assert_eq!(snap.warning_count(), 2);
        assert_eq!(snap.status_string(), "E:1 W:2");
    }

    #[test]
    fn snapshot_default_is_empty() {
        let snap = DiagnosticsSnapshot::default();
        assert!(snap.is_empty());
        assert_eq!(snap.status_string(), "");
    }

    #[test]
    fn text_delta_wire_shape() {
        let delta = TextDelta {
            range: Range {
                start: Position::new(0, 1),
                end: Position::new(0, 2),
            },
            text: "y".to_string(),
        };
        let value = serde_json::to_value(&delta).unwrap();
        assert_eq!(value["range"]["start"]["line"], 0);
        assert_eq!(value["range"]["end"]["character"], 2);
        assert_eq!(value["text"], "y");
    }
}
