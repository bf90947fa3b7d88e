//! Document replica handle

use serde::{Deserialize, Serialize};

use super::EntityId;

/// Last-known-synced revision of a note's body.
///
/// The body bytes live in the document update log; this row only tracks the
/// revision marker so remote revision events can be compared cheaply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentReplicaState {
    /// Same value as `note_id`
    pub id: EntityId,
    pub note_id: EntityId,
    /// Revision marker (server time of the last converged revision)
    pub updated_at: i64,
}

impl DocumentReplicaState {
    pub fn new(note_id: EntityId, updated_at: i64) -> Self {
        Self {
            id: note_id.clone(),
            note_id,
            updated_at,
        }
    }

    /// Name under which the note's update log is stored.
    pub fn document_name(&self) -> String {
        document_name(&self.note_id)
    }
}

/// Update-log key for a note.
pub fn document_name(note_id: &EntityId) -> String {
    format!("note:{note_id}")
}
