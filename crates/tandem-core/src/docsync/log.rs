//! Append log of document updates with snapshot compaction.

use loro::{ExportMode, LoroDoc};

use crate::db::{LocalStore, LoggedUpdate};
use crate::{Error, Result};

/// Persisted update log for one document.
///
/// Every flush appends an opaque update blob. Once the log grows past
/// `threshold` entries, all entries are merged into a single snapshot that
/// replaces them.
#[derive(Clone)]
pub struct UpdateLog {
    local: LocalStore,
    doc_name: String,
    threshold: u64,
}

impl UpdateLog {
    pub fn new(local: LocalStore, doc_name: impl Into<String>, threshold: usize) -> Self {
        Self {
            local,
            doc_name: doc_name.into(),
            threshold: u64::try_from(threshold.max(2)).unwrap_or(u64::MAX),
        }
    }

    pub fn doc_name(&self) -> &str {
        &self.doc_name
    }

    pub async fn load(&self) -> Result<Vec<LoggedUpdate>> {
        self.local.load_document_updates(&self.doc_name).await
    }

    /// Append one update; compacts when the log is over threshold.
    ///
    /// Returns whether a compaction ran.
    pub async fn append(&self, update: &[u8]) -> Result<bool> {
        if update.is_empty() {
            return Ok(false);
        }
        self.local
            .append_document_update(&self.doc_name, update)
            .await?;
        if self.local.count_document_updates(&self.doc_name).await? > self.threshold {
            self.compact().await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Merge every logged entry into one snapshot.
    pub async fn compact(&self) -> Result<()> {
        let updates = self.load().await?;
        let Some(last) = updates.last() else {
            return Ok(());
        };
        let up_to = last.id;
        let merged = merge(&updates)?;
        self.local
            .compact_document(&self.doc_name, &merged, up_to)
            .await?;
        tracing::debug!(
            doc = %self.doc_name,
            entries = updates.len(),
            bytes = merged.len(),
            "Compacted document log"
        );
        Ok(())
    }

    /// Point the log at a new document name. The rows themselves are
    /// renamed by the identity swap.
    pub fn rename(&mut self, doc_name: impl Into<String>) {
        self.doc_name = doc_name.into();
    }
}

fn merge(updates: &[LoggedUpdate]) -> Result<Vec<u8>> {
    let doc = LoroDoc::new();
    for update in updates {
        doc.import(&update.data)
            .map_err(|e| Error::Document(format!("import logged update {}: {e}", update.id)))?;
    }
    doc.export(ExportMode::Snapshot)
        .map_err(|e| Error::Document(format!("export snapshot: {e}")))
}
