//! Stand-in used when no server is configured.

use async_trait::async_trait;

use super::RemoteApi;
use crate::models::{
    Collection, DocumentReplicaState, EntityId, Invitation, MemberRole, Note, Setting,
};
use crate::{Error, Result};

/// Fails every call with a network error so queued actions stay pending.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineRemoteApi;

fn offline<T>() -> Result<T> {
    Err(Error::Network("no remote API configured".to_string()))
}

#[async_trait]
impl RemoteApi for OfflineRemoteApi {
    async fn list_notes(&self) -> Result<Vec<Note>> {
        offline()
    }
    async fn create_note(&self, _note: &Note) -> Result<Note> {
        offline()
    }
    async fn update_note(&self, _note: &Note) -> Result<Note> {
        offline()
    }
    async fn delete_note(&self, _id: &EntityId) -> Result<()> {
        offline()
    }
    async fn list_collections(&self) -> Result<Vec<Collection>> {
        offline()
    }
    async fn create_collection(&self, _collection: &Collection) -> Result<Collection> {
        offline()
    }
    async fn update_collection(&self, _collection: &Collection) -> Result<Collection> {
        offline()
    }
    async fn delete_collection(&self, _id: &EntityId) -> Result<()> {
        offline()
    }
    async fn leave_collection(&self, _id: &EntityId) -> Result<()> {
        offline()
    }
    async fn list_settings(&self) -> Result<Vec<Setting>> {
        offline()
    }
    async fn update_setting(&self, _setting: &Setting) -> Result<Setting> {
        offline()
    }
    async fn sync_settings(&self, _settings: &[Setting]) -> Result<Vec<Setting>> {
        offline()
    }
    async fn list_document_states(&self) -> Result<Vec<DocumentReplicaState>> {
        offline()
    }
    async fn invite_member(
        &self,
        _collection_id: &EntityId,
        _email: &str,
        _role: MemberRole,
    ) -> Result<Invitation> {
        offline()
    }
    async fn accept_invitation(&self, _invitation_id: &str) -> Result<Collection> {
        offline()
    }
    async fn reject_invitation(&self, _invitation_id: &str) -> Result<()> {
        offline()
    }
    async fn cancel_invitation(&self, _invitation_id: &str) -> Result<()> {
        offline()
    }
    async fn remove_member(&self, _collection_id: &EntityId, _user_id: &str) -> Result<()> {
        offline()
    }
    async fn change_member_role(
        &self,
        _collection_id: &EntityId,
        _user_id: &str,
        _role: MemberRole,
    ) -> Result<Collection> {
        offline()
    }
}
