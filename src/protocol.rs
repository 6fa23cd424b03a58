//! JSON-RPC envelope types and wire-shape builders.
//!
//! Fixed shapes are typed serde structs; dynamic payloads stay
//! `serde_json::Value` and are interpreted at the boundary.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::RpcError;
use crate::types::{DiagnosticSeverity, TextDelta, ZincDiagnostic};

#[derive(Debug, Serialize)]
pub(crate) struct Request {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Request {
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Notification {
    pub fn new(method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.to_string(),
            params,
        }
    }
}

/// A decoded inbound frame, classified by envelope shape.
#[derive(Debug)]
pub(crate) enum IncomingFrame {
    /// `{id, result}` or `{id, error}` — resolves a pending request. The id
    /// is kept as-is; one that is not a u64 can never match a pending call
    /// and falls through to the discard path.
    Response {
        id: serde_json::Value,
        result: Result<serde_json::Value, RpcError>,
    },
    /// `{id, method, params}` — a server-initiated request we must answer.
    ServerRequest {
        id: serde_json::Value,
        method: String,
        params: Option<serde_json::Value>,
    },
    /// `{method, params}` — fire-and-forget from the server.
    Notification {
        method: String,
        params: Option<serde_json::Value>,
    },
}

/// Classify one inbound frame. `None` means the frame is none of the three
/// envelope shapes — a protocol error that ends the session.
pub(crate) fn classify(frame: &serde_json::Value) -> Option<IncomingFrame> {
    let id = frame.get("id");
    let method = frame
        .get("method")
        .and_then(|m| m.as_str())
        .map(String::from);
    let is_reply = frame.get("result").is_some() || frame.get("error").is_some();

    match (id, method, is_reply) {
        (Some(id), None, true) => Some(IncomingFrame::Response {
            id: id.clone(),
            result: parse_reply(frame),
        }),
        (Some(id), Some(method), _) => Some(IncomingFrame::ServerRequest {
            id: id.clone(),
            method,
            params: frame.get("params").cloned(),
        }),
        (None, Some(method), _) => Some(IncomingFrame::Notification {
            method,
            params: frame.get("params").cloned(),
        }),
        _ => None,
    }
}

fn parse_reply(frame: &serde_json::Value) -> Result<serde_json::Value, RpcError> {
    if let Some(error) = frame.get("error") {
        return Err(RpcError::Server {
            code: error.get("code").and_then(|c| c.as_i64()).unwrap_or(0),
            message: error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error")
                .to_string(),
        });
    }
    Ok(frame.get("result").cloned().unwrap_or(serde_json::Value::Null))
}

/// `-32601` reply for server requests nobody handles. Many servers block
/// on `workspace/configuration`-style round-trips until answered.
pub(crate) fn method_not_found(id: serde_json::Value, method: &str) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": -32601,
            "message": format!("Method not found: {method}")
        }
    })
}

pub(crate) fn initialize_params(root_uri: Option<&str>) -> serde_json::Value {
    serde_json::json!({
        "processId": std::process::id(),
        "rootUri": root_uri,
        "capabilities": {
            "textDocument": {
                "synchronization": {
                    "dynamicRegistration": false,
                    "willSave": false,
                    "willSaveWaitUntil": false,
                    "didSave": false
                },
                "completion": {
                    "completionItem": { "snippetSupport": false }
                },
                "hover": {},
                "publishDiagnostics": {
                    "relatedInformation": false
                }
            }
        },
        "workspaceFolders": root_uri.map(|uri| serde_json::json!([{
            "uri": uri,
            "name": "workspace"
        }]))
    })
}

pub(crate) fn did_open_params(
    uri: &str,
    language_id: &str,
    version: i32,
    text: &str,
) -> serde_json::Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri,
            "languageId": language_id,
            "version": version,
            "text": text
        }
    })
}

/// Whole-document `didChange`: one content change with no range.
pub(crate) fn did_change_full_params(uri: &str, version: i32, text: &str) -> serde_json::Value {
    serde_json::json!({
        "textDocument": { "uri": uri, "version": version },
        "contentChanges": [{ "text": text }]
    })
}

/// Incremental `didChange`: deltas forwarded as ranged content changes.
pub(crate) fn did_change_incremental_params(
    uri: &str,
    version: i32,
    deltas: &[TextDelta],
) -> serde_json::Value {
    serde_json::json!({
        "textDocument": { "uri": uri, "version": version },
        "contentChanges": deltas
    })
}

pub(crate) fn did_close_params(uri: &str) -> serde_json::Value {
    serde_json::json!({ "textDocument": { "uri": uri } })
}

pub(crate) fn cancel_params(id: u64) -> serde_json::Value {
    serde_json::json!({ "id": id })
}

pub(crate) fn completion_params(uri: &str, line: u32, character: u32) -> serde_json::Value {
    serde_json::json!({
        "textDocument": { "uri": uri },
        "position": { "line": line, "character": character }
    })
}

#[derive(Debug, Deserialize)]
pub(crate) struct PublishDiagnosticsParams {
    pub uri: String,
    pub diagnostics: Vec<WireDiagnostic>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireDiagnostic {
    pub range: WireRange,
    pub severity: Option<u64>,
    pub source: Option<String>,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireRange {
    pub start: WirePosition,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WirePosition {
    pub line: u32,
    pub character: u32,
}

impl WireDiagnostic {
    pub fn to_diagnostic(&self) -> ZincDiagnostic {
        ZincDiagnostic::new(
            self.severity
                .and_then(DiagnosticSeverity::from_lsp)
                .unwrap_or(DiagnosticSeverity::Warning),
            self.message.clone(),
            self.range.start.line,
            self.range.start.character,
            self.source.clone().unwrap_or_else(|| "zinc".to_string()),
        )
    }
}

pub(crate) fn path_to_file_uri(path: &Path) -> Option<url::Url> {
    url::Url::from_file_path(path).ok()
}

/// Validate a document URI pushed by the server. Anything `url` cannot
/// parse is dropped at the boundary.
pub(crate) fn parse_document_uri(uri: &str) -> Option<url::Url> {
    url::Url::parse(uri).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Position, Range};

    #[test]
    fn classify_response_ok() {
        let frame = serde_json::json!({"jsonrpc": "2.0", "id": 4, "result": {"capabilities": {}}});
        match classify(&frame) {
            Some(IncomingFrame::Response { id, result }) => {
                assert_eq!(id, 4);
                assert!(result.unwrap()["capabilities"].is_object());
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn classify_response_error() {
        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 9,
            "error": { "code": -32600, "message": "invalid request" }
        });
        match classify(&frame) {
            Some(IncomingFrame::Response { id, result }) => {
                assert_eq!(id, 9);
                match result {
                    Err(RpcError::Server { code, message }) => {
                        assert_eq!(code, -32600);
                        assert_eq!(message, "invalid request");
                    }
                    other => panic!("expected server error, got {other:?}"),
                }
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn classify_null_result_is_ok() {
        let frame = serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": null});
        match classify(&frame) {
            Some(IncomingFrame::Response { result, .. }) => {
                assert!(result.unwrap().is_null());
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn classify_server_request() {
        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "id": "cfg-1",
            "method": "workspace/configuration",
            "params": { "items": [] }
        });
        match classify(&frame) {
            Some(IncomingFrame::ServerRequest { id, method, params }) => {
                assert_eq!(id, serde_json::json!("cfg-1"));
                assert_eq!(method, "workspace/configuration");
                assert!(params.unwrap()["items"].is_array());
            }
            other => panic!("expected server request, got {other:?}"),
        }
    }

    #[test]
    fn classify_notification() {
        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "textDocument/publishDiagnostics",
            "params": { "uri": "file:///a.zn", "diagnostics": [] }
        });
        assert!(matches!(
            classify(&frame),
            Some(IncomingFrame::Notification { method, .. }) if method == "textDocument/publishDiagnostics"
        ));
    }

    #[test]
    fn classify_rejects_shapeless_frames() {
        assert!(classify(&serde_json::json!({"jsonrpc": "2.0"})).is_none());
        assert!(classify(&serde_json::json!({"id": 1})).is_none());
    }

    #[test]
    fn classify_keeps_non_numeric_reply_ids() {
        // Still a response shape; matching (and discarding) is the
        // dispatcher's job, not the classifier's.
        let frame = serde_json::json!({"jsonrpc": "2.0", "id": "x", "result": {}});
        match classify(&frame) {
            Some(IncomingFrame::Response { id, result }) => {
                assert_eq!(id, "x");
                assert!(result.unwrap().is_object());
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn request_omits_absent_params() {
        let frame = serde_json::to_value(Request::new(1, "shutdown", None)).unwrap();
        assert_eq!(frame["jsonrpc"], "2.0");
        assert_eq!(frame["method"], "shutdown");
        assert!(frame.get("params").is_none(), "params must be omitted, not null");
    }

    #[test]
    fn notification_has_no_id() {
        let frame = serde_json::to_value(Notification::new("exit", None)).unwrap();
        assert!(frame.get("id").is_none());
        assert_eq!(frame["method"], "exit");
    }

    #[test]
    fn initialize_params_declare_sync_and_completion() {
        let params = initialize_params(Some("file:///ws"));
        assert!(params["processId"].is_number());
        assert_eq!(params["rootUri"], "file:///ws");
        let td = &params["capabilities"]["textDocument"];
        assert!(td["synchronization"].is_object());
        assert!(td["completion"].is_object());
        assert!(td["publishDiagnostics"].is_object());
    }

    #[test]
    fn initialize_params_without_root() {
        let params = initialize_params(None);
        assert!(params["rootUri"].is_null());
        assert!(params["workspaceFolders"].is_null());
    }

    #[test]
    fn full_change_has_no_range() {
        let params = did_change_full_params("file:///a.zn", 2, "y");
        assert_eq!(params["textDocument"]["version"], 2);
        let change = &params["contentChanges"][0];
        assert_eq!(change["text"], "y");
        assert!(change.get("range").is_none());
    }

    #[test]
    fn incremental_change_keeps_ranges() {
        let deltas = vec![TextDelta {
            range: Range {
                start: Position::new(0, 0),
                end: Position::new(0, 1),
            },
            text: "y".to_string(),
        }];
        let params = did_change_incremental_params("file:///a.zn", 3, &deltas);
        assert_eq!(params["contentChanges"][0]["range"]["end"]["character"], 1);
        assert_eq!(params["contentChanges"][0]["text"], "y");
    }

    #[test]
    fn wire_diagnostic_defaults() {
        // Severity and source are optional on the wire.
        let params: PublishDiagnosticsParams = serde_json::from_value(serde_json::json!({
            "uri": "file:///a.zn",
            "diagnostics": [{
                "range": { "start": { "line": 3, "character": 1 }, "end": { "line": 3, "character": 4 } },
                "message": "unknown identifier"
            }]
        }))
        .unwrap();
        let diag = params.diagnostics[0].to_diagnostic();
        assert_eq!(diag.severity(), DiagnosticSeverity::Warning);
        assert_eq!(diag.source(), "zinc");
        assert_eq!(diag.line(), 3);
        assert_eq!(diag.col(), 1);
    }

    #[test]
    fn document_uri_validation() {
        assert!(parse_document_uri("file:///a.zn").is_some());
        assert!(parse_document_uri("not a uri").is_none());
    }

    #[test]
    fn path_round_trips_through_uri() {
        let path = std::path::PathBuf::from("/home/dev/project/a.zn");
        let uri = path_to_file_uri(&path).unwrap();
        assert_eq!(uri.to_file_path().unwrap(), path);
    }
}
