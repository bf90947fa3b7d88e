//! Remote API surface consumed by the sync engine.

mod http;
mod offline;

pub use http::{HttpRemoteApi, CLIENT_ID_HEADER};
pub(crate) use http::check_status;
pub use offline::OfflineRemoteApi;

use async_trait::async_trait;

use crate::models::{
    Collection, DocumentReplicaState, EntityId, Invitation, MemberRole, Note, Setting,
};
use crate::Result;

/// Request/response wrapper for the server's CRUD endpoints.
///
/// Every call returns server-canonical entities. Implementations report a
/// missing target with an error for which [`crate::Error::is_not_found`] holds.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn list_notes(&self) -> Result<Vec<Note>>;
    async fn create_note(&self, note: &Note) -> Result<Note>;
    async fn update_note(&self, note: &Note) -> Result<Note>;
    async fn delete_note(&self, id: &EntityId) -> Result<()>;

    async fn list_collections(&self) -> Result<Vec<Collection>>;
    async fn create_collection(&self, collection: &Collection) -> Result<Collection>;
    async fn update_collection(&self, collection: &Collection) -> Result<Collection>;
    async fn delete_collection(&self, id: &EntityId) -> Result<()>;
    async fn leave_collection(&self, id: &EntityId) -> Result<()>;

    async fn list_settings(&self) -> Result<Vec<Setting>>;
    async fn update_setting(&self, setting: &Setting) -> Result<Setting>;
    /// Replace the server's settings with `settings` in one call
    async fn sync_settings(&self, settings: &[Setting]) -> Result<Vec<Setting>>;

    async fn list_document_states(&self) -> Result<Vec<DocumentReplicaState>>;

    async fn invite_member(
        &self,
        collection_id: &EntityId,
        email: &str,
        role: MemberRole,
    ) -> Result<Invitation>;
    async fn accept_invitation(&self, invitation_id: &str) -> Result<Collection>;
    async fn reject_invitation(&self, invitation_id: &str) -> Result<()>;
    async fn cancel_invitation(&self, invitation_id: &str) -> Result<()>;
    async fn remove_member(&self, collection_id: &EntityId, user_id: &str) -> Result<()>;
    async fn change_member_role(
        &self,
        collection_id: &EntityId,
        user_id: &str,
        role: MemberRole,
    ) -> Result<Collection>;
}
