//! Accumulates per-document diagnostics pushed by the server.

use std::collections::HashMap;

use crate::types::{DiagnosticsSnapshot, ZincDiagnostic};

pub(crate) struct DiagnosticsStore {
    data: HashMap<String, Vec<ZincDiagnostic>>,
}

impl DiagnosticsStore {
    pub fn new() -> Self {
        Self {
            data: HashMap::new(),
        }
    }

    /// Replace a document's diagnostics. Publishing an empty list is how
    /// the server clears previous findings.
    pub fn update(&mut self, uri: String, items: Vec<ZincDiagnostic>) {
        if items.is_empty() {
            self.data.remove(&uri);
        } else {
            self.data.insert(uri, items);
        }
    }

    /// Drop everything; a fresh server starts from a clean slate.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let mut documents: Vec<(String, Vec<ZincDiagnostic>)> = self
            .data
            .iter()
            .map(|(uri, items)| (uri.clone(), items.clone()))
            .collect();

        // Documents with errors first, then alphabetically.
        documents.sort_by(|a, b| {
            let a_has_errors = a.1.iter().any(|d| d.severity().is_error());
            let b_has_errors = b.1.iter().any(|d| d.severity().is_error());
            b_has_errors.cmp(&a_has_errors).then_with(|| a.0.cmp(&b.0))
        });

        DiagnosticsSnapshot::new(documents)
    }
}
