//! In-memory replica of one note body.

use std::borrow::Cow;
use std::fmt;

use loro::{ExportMode, LoroDoc, VersionVector};

use super::authority::AuthoritySession;
use super::log::UpdateLog;
use crate::models::{document_name, EntityId};
use crate::{Error, Result};

/// Text container holding the note body
pub const CONTENT_CONTAINER: &str = "content";

/// Where a replica is in its sync lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaPhase {
    Unsynced,
    LoadingLocalSnapshot,
    LocalSynced,
    ConnectingToAuthority,
    Converged,
    Failed(String),
}

impl fmt::Display for ReplicaPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsynced => f.write_str("unsynced"),
            Self::LoadingLocalSnapshot => f.write_str("loading-local-snapshot"),
            Self::LocalSynced => f.write_str("local-synced"),
            Self::ConnectingToAuthority => f.write_str("connecting-to-authority"),
            Self::Converged => f.write_str("converged"),
            Self::Failed(error) => write!(f, "failed: {error}"),
        }
    }
}

pub struct DocumentReplica {
    note_id: EntityId,
    doc: LoroDoc,
    phase: ReplicaPhase,
}

impl DocumentReplica {
    pub fn new(note_id: EntityId) -> Self {
        Self {
            note_id,
            doc: LoroDoc::new(),
            phase: ReplicaPhase::Unsynced,
        }
    }

    pub const fn note_id(&self) -> &EntityId {
        &self.note_id
    }

    pub fn document_name(&self) -> String {
        document_name(&self.note_id)
    }

    pub const fn phase(&self) -> &ReplicaPhase {
        &self.phase
    }

    /// Follow an identity swap; the document content is unaffected.
    pub fn rekey(&mut self, note_id: EntityId) {
        self.note_id = note_id;
    }

    /// Replay the persisted log into this replica.
    pub async fn load_local(&mut self, log: &UpdateLog) -> Result<usize> {
        self.phase = ReplicaPhase::LoadingLocalSnapshot;
        let updates = match log.load().await {
            Ok(updates) => updates,
            Err(error) => return Err(self.fail(error)),
        };
        for update in &updates {
            if let Err(error) = self.doc.import(&update.data) {
                return Err(self.fail(Error::Document(format!(
                    "replay update {} of {}: {error}",
                    update.id,
                    log.doc_name()
                ))));
            }
        }
        self.phase = ReplicaPhase::LocalSynced;
        Ok(updates.len())
    }

    pub fn text(&self) -> String {
        self.doc.get_text(CONTENT_CONTAINER).to_string()
    }

    /// Replace the body with `text`.
    ///
    /// Returns the update blob to persist, or `None` when nothing changed.
    pub fn set_text(&mut self, text: &str) -> Result<Option<Vec<u8>>> {
        let before = self.doc.oplog_vv();
        self.doc
            .get_text(CONTENT_CONTAINER)
            .update(text, Default::default())
            .map_err(|e| Error::Document(format!("update text: {e}")))?;
        self.doc.commit();
        self.updates_since(before)
    }

    /// Merge an update from elsewhere. Returns whether anything new arrived.
    pub fn apply_remote(&mut self, update: &[u8]) -> Result<bool> {
        if update.is_empty() {
            return Ok(false);
        }
        let before = self.doc.oplog_vv();
        self.doc
            .import(update)
            .map_err(|e| Error::Document(format!("import remote update: {e}")))?;
        Ok(self.doc.oplog_vv() != before)
    }

    pub fn snapshot(&self) -> Result<Vec<u8>> {
        self.doc
            .export(ExportMode::Snapshot)
            .map_err(|e| Error::Document(format!("export snapshot: {e}")))
    }

    /// Exchange state with the authority.
    ///
    /// Returns the updates received that the local log does not have yet.
    pub async fn converge(
        &mut self,
        session: &mut dyn AuthoritySession,
    ) -> Result<Option<Vec<u8>>> {
        self.phase = ReplicaPhase::ConnectingToAuthority;
        let local_state = match self.snapshot() {
            Ok(state) => state,
            Err(error) => return Err(self.fail(error)),
        };
        let reply = match session.exchange(&local_state).await {
            Ok(reply) => reply,
            Err(error) => return Err(self.fail(error)),
        };
        let before = self.doc.oplog_vv();
        if let Err(error) = self.apply_remote(&reply) {
            return Err(self.fail(error));
        }
        let received = self.updates_since(before)?;
        self.phase = ReplicaPhase::Converged;
        Ok(received)
    }

    fn updates_since(&self, before: VersionVector) -> Result<Option<Vec<u8>>> {
        if self.doc.oplog_vv() == before {
            return Ok(None);
        }
        self.doc
            .export(ExportMode::Updates {
                from: Cow::Owned(before),
            })
            .map(Some)
            .map_err(|e| Error::Document(format!("export updates: {e}")))
    }

    fn fail(&mut self, error: Error) -> Error {
        tracing::warn!(note_id = %self.note_id, "Document replica failed: {error}");
        self.phase = ReplicaPhase::Failed(error.to_string());
        error
    }
}
