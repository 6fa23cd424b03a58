//! Capability negotiation: the `initialize` handshake and the
//! feature-by-feature intersection of what both sides declare.

use std::time::Duration;

use crate::error::{NegotiationError, RpcError};
use crate::protocol;
use crate::session::RpcSession;

/// Document-synchronization strategy, fixed once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Server wants no didChange traffic.
    None,
    /// Every change is a whole-document resend.
    Full,
    /// Changes are forwarded as ranged deltas.
    Incremental,
}

impl SyncMode {
    fn from_kind(kind: u64) -> Option<Self> {
        match kind {
            0 => Some(Self::None),
            1 => Some(Self::Full),
            2 => Some(Self::Incremental),
            _ => None,
        }
    }
}

/// The negotiated feature set: immutable for the life of one connection.
/// A feature is usable only if both the client and the server declare it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    sync_mode: SyncMode,
    completion: bool,
    hover: bool,
}

impl Capabilities {
    #[must_use]
    pub fn sync_mode(&self) -> SyncMode {
        self.sync_mode
    }

    #[must_use]
    pub fn completion(&self) -> bool {
        self.completion
    }

    #[must_use]
    pub fn hover(&self) -> bool {
        self.hover
    }

    /// Intersect the server's declared capabilities with ours. We declare
    /// incremental sync, completion, and hover, so the server side is the
    /// binding half of each intersection.
    pub(crate) fn intersect(server: &serde_json::Value) -> Self {
        let sync_mode = match server.get("textDocumentSync") {
            Some(serde_json::Value::Number(n)) => n
                .as_u64()
                .and_then(SyncMode::from_kind)
                .unwrap_or(SyncMode::None),
            Some(serde_json::Value::Object(options)) => options
                .get("change")
                .and_then(serde_json::Value::as_u64)
                .and_then(SyncMode::from_kind)
                .unwrap_or(SyncMode::None),
            _ => SyncMode::None,
        };

        Self {
            sync_mode,
            completion: server
                .get("completionProvider")
                .is_some_and(serde_json::Value::is_object),
            hover: match server.get("hoverProvider") {
                Some(serde_json::Value::Bool(b)) => *b,
                Some(serde_json::Value::Object(_)) => true,
                _ => false,
            },
        }
    }
}

/// Perform the handshake on a fresh connection: `initialize` must be the
/// first request sent, and `initialized` follows a valid response.
pub(crate) async fn negotiate(
    session: &RpcSession,
    root_uri: Option<&str>,
    deadline: Duration,
) -> Result<Capabilities, NegotiationError> {
    let params = protocol::initialize_params(root_uri);
    let result = session
        .call("initialize", Some(params), deadline)
        .await
        .map_err(|e| match e {
            RpcError::Server { code, message } => {
                NegotiationError::Rejected(format!("{code}: {message}"))
            }
            other => NegotiationError::Rpc(other),
        })?;

    let declared = result
        .get("capabilities")
        .filter(|v| v.is_object())
        .ok_or_else(|| {
            NegotiationError::MalformedResponse("response has no capabilities object".to_string())
        })?;
    let capabilities = Capabilities::intersect(declared);

    session
        .notify("initialized", Some(serde_json::json!({})))
        .await
        .map_err(NegotiationError::Rpc)?;

    tracing::info!(?capabilities, "capabilities negotiated");
    Ok(capabilities)
}
