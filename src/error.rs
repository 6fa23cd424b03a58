//! Error taxonomy for the Zinc client.
//!
//! Per-call failures ([`RpcError`]) are returned to the specific caller.
//! Session-level failures (crashes, malformed frames, failed negotiation)
//! are handled centrally by the lifecycle controller, which fails in-flight
//! calls with [`RpcError::SessionClosed`] as a side effect and decides
//! between restart and terminal failure.

use std::time::Duration;

use crate::types::SessionState;

/// Failure to launch the language-server process.
///
/// Fatal on the first spawn of a session — surfaced immediately with no
/// retry. During a restart it counts as another crash under the policy.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("language server executable '{command}' not found on PATH")]
    NotFound {
        command: String,
        #[source]
        source: which::Error,
    },
    #[error("failed to spawn '{command}'")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("spawned server has no {0} pipe")]
    MissingPipe(&'static str),
}

/// Framing-layer failure. Non-recoverable for the connection: a decoder
/// that has lost frame alignment cannot resynchronize, so the caller must
/// tear the session down.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("frame of {len} bytes exceeds the {max}-byte limit")]
    FrameTooLarge { len: usize, max: usize },
    #[error("connection i/o error")]
    Io(#[from] std::io::Error),
}

/// Failure of a single request/response exchange.
///
/// None of these affect session state; [`RpcError::SessionClosed`] reports
/// that the session already left `Running` for reasons of its own.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),
    #[error("session closed before a response arrived")]
    SessionClosed,
    #[error("server error {code}: {message}")]
    Server { code: i64, message: String },
}

/// Failure of the `initialize` handshake. Treated identically to a crash
/// by the lifecycle controller and counted against the restart bound.
#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error("server rejected initialize: {0}")]
    Rejected(String),
    #[error("malformed initialize response: {0}")]
    MalformedResponse(String),
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// Programming-contract violation in the document synchronizer.
///
/// Rejected synchronously with no outbound notification and no state
/// mutation; the session itself is unaffected.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("out-of-order edit for {uri}: version {version} is not greater than {last}")]
    OutOfOrderEdit { uri: String, version: i32, last: i32 },
    #[error("document {0} is not open")]
    NotOpen(String),
    #[error("document {0} is already open")]
    AlreadyOpen(String),
}

/// Facade-level error returned by [`crate::ZincClient`] operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("session is not running (state: {0})")]
    NotRunning(SessionState),
    #[error("negotiated capabilities do not include {0}")]
    Unsupported(&'static str),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Sync(#[from] SyncError),
}
