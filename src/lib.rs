//! Client-side lifecycle manager for the Zinc language server.
//!
//! Spawns `zinc-lsp` as a child process, speaks `Content-Length`-framed
//! JSON-RPC over its stdio, keeps open documents synchronized across
//! crashes and restarts, and surfaces diagnostics to the embedding editor.

pub mod codec;
pub mod error;
pub mod supervisor;
pub mod types;

pub(crate) mod capabilities;
pub(crate) mod diagnostics;
pub(crate) mod documents;
pub(crate) mod protocol;
pub(crate) mod session;

mod client;

#[cfg(test)]
pub(crate) mod testutil;

pub use capabilities::{Capabilities, SyncMode};
pub use client::{PendingRequest, ZincClient};
pub use types::{
    ClientConfig, ClientEvent, DiagnosticSeverity, DiagnosticsSnapshot, DocumentEdit, Position,
    Range, RestartPolicy, SessionState, TextDelta, ZincDiagnostic,
};
