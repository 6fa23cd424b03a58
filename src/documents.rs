//! Open-document tracking and synchronization-notification planning.
//!
//! The store is the client-side source of truth for document text. It
//! always retains full text (deltas are applied locally) so that a newly
//! spawned server, which has no memory of prior sessions, can be brought
//! up to date with fresh `didOpen`s. Outbound notifications are queued
//! here and drained by the lifecycle controller only while the session is
//! running; while it is not, they simply accumulate in order.

use std::collections::{HashMap, VecDeque};

use crate::capabilities::SyncMode;
use crate::error::SyncError;
use crate::protocol;
use crate::types::{DocumentEdit, TextDelta};

/// One currently-open document.
#[derive(Debug)]
struct DocumentState {
    version: i32,
    text: String,
    /// True once the document has been edited past its open version.
    /// A dirty document's version is strictly greater than the last one
    /// the server acknowledged by receiving it.
    dirty: bool,
}

/// A planned outbound notification, in send order.
#[derive(Debug)]
pub(crate) struct OutboundNote {
    pub method: &'static str,
    pub params: serde_json::Value,
}

pub(crate) struct DocumentStore {
    docs: HashMap<String, DocumentState>,
    outbound: VecDeque<OutboundNote>,
    sync_mode: SyncMode,
    language_id: String,
}

impl DocumentStore {
    pub fn new(language_id: &str) -> Self {
        Self {
            docs: HashMap::new(),
            outbound: VecDeque::new(),
            // Until negotiation says otherwise, plan whole-document sends;
            // the queue is rebuilt at session entry anyway.
            sync_mode: SyncMode::Full,
            language_id: language_id.to_string(),
        }
    }

    /// Fix the sync granularity for the session being entered.
    pub fn set_sync_mode(&mut self, mode: SyncMode) {
        self.sync_mode = mode;
    }

    /// Track a newly opened document and plan its `didOpen`.
    pub fn open(&mut self, uri: &str, version: i32, text: String) -> Result<(), SyncError> {
        if self.docs.contains_key(uri) {
            return Err(SyncError::AlreadyOpen(uri.to_string()));
        }
        self.outbound.push_back(OutboundNote {
            method: "textDocument/didOpen",
            params: protocol::did_open_params(uri, &self.language_id, version, &text),
        });
        self.docs.insert(
            uri.to_string(),
            DocumentState {
                version,
                text,
                dirty: false,
            },
        );
        Ok(())
    }

    /// Apply an edit and plan its `didChange` in the negotiated shape.
    ///
    /// Versions are caller-owned and must be strictly increasing per
    /// document per session; anything else desynchronizes server and
    /// client text, so it is rejected with no mutation and no outbound
    /// notification.
    pub fn change(&mut self, uri: &str, version: i32, edit: &DocumentEdit) -> Result<(), SyncError> {
        let doc = self
            .docs
            .get_mut(uri)
            .ok_or_else(|| SyncError::NotOpen(uri.to_string()))?;
        if version <= doc.version {
            return Err(SyncError::OutOfOrderEdit {
                uri: uri.to_string(),
                version,
                last: doc.version,
            });
        }

        match edit {
            DocumentEdit::Full(text) => doc.text = text.clone(),
            DocumentEdit::Incremental(deltas) => {
                for delta in deltas {
                    doc.text = apply_delta(&doc.text, delta);
                }
            }
        }
        doc.version = version;
        doc.dirty = true;

        match self.sync_mode {
            // The server wants no change traffic; local text still tracks
            // the editor so a later replay stays correct.
            SyncMode::None => {}
            SyncMode::Full => self.outbound.push_back(OutboundNote {
                method: "textDocument/didChange",
                params: protocol::did_change_full_params(uri, version, &doc.text),
            }),
            SyncMode::Incremental => {
                let params = match edit {
                    DocumentEdit::Incremental(deltas) => {
                        protocol::did_change_incremental_params(uri, version, deltas)
                    }
                    // A full replacement is still legal incrementally: one
                    // unranged content change.
                    DocumentEdit::Full(text) => {
                        protocol::did_change_full_params(uri, version, text)
                    }
                };
                self.outbound.push_back(OutboundNote {
                    method: "textDocument/didChange",
                    params,
                });
            }
        }
        Ok(())
    }

    /// Forget a document and plan its `didClose`.
    pub fn close(&mut self, uri: &str) -> Result<(), SyncError> {
        if self.docs.remove(uri).is_none() {
            return Err(SyncError::NotOpen(uri.to_string()));
        }
        self.outbound.push_back(OutboundNote {
            method: "textDocument/didClose",
            params: protocol::did_close_params(uri),
        });
        Ok(())
    }

    /// Drain everything queued for sending, in order.
    pub fn take_outbound(&mut self) -> Vec<OutboundNote> {
        self.outbound.drain(..).collect()
    }

    /// Rebuild the queue for a fresh server: stale buffered traffic is
    /// discarded and every tracked document gets a new `didOpen` carrying
    /// its current text, so no `didChange` can precede it.
    pub fn replay_for_new_session(&mut self) {
        self.outbound.clear();
        let mut uris: Vec<&String> = self.docs.keys().collect();
        uris.sort();
        let notes: Vec<OutboundNote> = uris
            .into_iter()
            .map(|uri| {
                let doc = &self.docs[uri];
                OutboundNote {
                    method: "textDocument/didOpen",
                    params: protocol::did_open_params(
                        uri,
                        &self.language_id,
                        doc.version,
                        &doc.text,
                    ),
                }
            })
            .collect();
        for note in notes {
            self.outbound.push_back(note);
        }
        for doc in self.docs.values_mut() {
            doc.dirty = false;
        }
    }

    #[cfg(test)]
    pub fn open_count(&self) -> usize {
        self.docs.len()
    }

    #[cfg(test)]
    fn text_of(&self, uri: &str) -> &str {
        &self.docs[uri].text
    }

    #[cfg(test)]
    fn is_dirty(&self, uri: &str) -> bool {
        self.docs[uri].dirty
    }
}

/// Replace `delta.range` in `text` with `delta.text`. Positions count
/// lines and, within a line, UTF-16 code units (the protocol's default
/// position encoding); both are zero-indexed, and out-of-range positions
/// clamp to the nearest valid offset.
fn apply_delta(text: &str, delta: &TextDelta) -> String {
    let start = byte_offset(text, delta.range.start.line, delta.range.start.character);
    let end = byte_offset(text, delta.range.end.line, delta.range.end.character).max(start);
    let mut out = String::with_capacity(text.len() + delta.text.len());
    out.push_str(&text[..start]);
    out.push_str(&delta.text);
    out.push_str(&text[end..]);
    out
}

fn byte_offset(text: &str, line: u32, character: u32) -> usize {
    let mut offset = 0;
    for _ in 0..line {
        match text[offset..].find('\n') {
            Some(nl) => offset += nl + 1,
            None => return text.len(),
        }
    }
    let line_end = text[offset..]
        .find('\n')
        .map_or(text.len(), |nl| offset + nl);
    // A position landing inside a surrogate pair clamps to the start of
    // that character rather than splitting it.
    let mut units: u32 = 0;
    for (idx, ch) in text[offset..line_end].char_indices() {
        if units >= character {
            return offset + idx;
        }
        units += ch.len_utf16() as u32;
    }
    line_end
}
