//! Full-text search over note titles and bodies.
//!
//! Rows live in the FTS5 `note_search` table. Writers are serialized by a
//! dedicated lock because a remove/insert pair must never interleave with
//! another writer for the same note.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::db::{LocalStore, SearchHit};
use crate::models::EntityId;
use crate::Result;

const DEFAULT_LIMIT: usize = 50;

#[derive(Clone)]
pub struct SearchIndex {
    local: LocalStore,
    writer: Arc<Mutex<()>>,
}

impl SearchIndex {
    pub fn new(local: LocalStore) -> Self {
        Self {
            local,
            writer: Arc::new(Mutex::new(())),
        }
    }

    /// Add or refresh the row for a note.
    pub async fn upsert(&self, note_id: &EntityId, title: &str, body: &str) -> Result<()> {
        let _guard = self.writer.lock().await;
        self.local.upsert_search_row(note_id, title, body).await
    }

    /// Refresh the title only; the indexed body stays as it is.
    pub async fn retitle(&self, note_id: &EntityId, title: &str) -> Result<()> {
        let _guard = self.writer.lock().await;
        self.local.retitle_search_row(note_id, title).await
    }

    pub async fn remove(&self, note_id: &EntityId) -> Result<()> {
        let _guard = self.writer.lock().await;
        self.local.remove_search_row(note_id).await?;
        Ok(())
    }

    /// Search with plain user text; every term must match.
    pub async fn search(&self, text: &str, limit: Option<usize>) -> Result<Vec<SearchHit>> {
        let Some(query) = build_match_query(text) else {
            return Ok(Vec::new());
        };
        self.local
            .search_notes(&query, limit.unwrap_or(DEFAULT_LIMIT))
            .await
    }
}

/// Quote each whitespace-separated term so FTS5 operators in user text are inert.
fn build_match_query(text: &str) -> Option<String> {
    let terms: Vec<String> = text
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}
