//! In-memory stand-ins for the server and the collaboration authority.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use loro::{ExportMode, LoroDoc};
use tokio::sync::Semaphore;

use crate::api::RemoteApi;
use crate::db::LocalStore;
use crate::docsync::{AuthoritySession, DocumentAuthority, CONTENT_CONTAINER};
use crate::models::{
    Collection, CollectionMember, DocumentReplicaState, EntityId, Invitation, MemberRole, Note,
    Setting,
};
use crate::queue::ActionQueue;
use crate::search::SearchIndex;
use crate::services::SyncContext;
use crate::store::Store;
use crate::sync::SwapListener;
use crate::util::now_ms;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    /// 503
    Transient,
    /// 404
    NotFound,
    /// 422
    Rejected,
}

impl InjectedFailure {
    fn into_error(self) -> Error {
        let (status, message) = match self {
            Self::Transient => (503, "service unavailable"),
            Self::NotFound => (404, "not found"),
            Self::Rejected => (422, "rejected"),
        };
        Error::Api {
            status,
            message: message.to_string(),
        }
    }
}

#[derive(Default)]
struct ServerState {
    next_id: u64,
    notes: Vec<Note>,
    collections: Vec<Collection>,
    settings: Vec<Setting>,
    documents: Vec<DocumentReplicaState>,
    invitations: Vec<Invitation>,
    calls: Vec<String>,
    failures: VecDeque<InjectedFailure>,
}

impl ServerState {
    fn mint(&mut self, id: &EntityId) -> EntityId {
        if !id.is_local() {
            return id.clone();
        }
        self.next_id += 1;
        EntityId::new(format!("srv-{}", self.next_id))
    }

    fn collection_mut(&mut self, id: &EntityId) -> Result<&mut Collection> {
        self.collections
            .iter_mut()
            .find(|collection| &collection.id == id)
            .ok_or_else(|| missing("collection", id))
    }

    fn remove_collection(&mut self, id: &EntityId) -> Result<()> {
        let before = self.collections.len();
        self.collections.retain(|collection| &collection.id != id);
        if self.collections.len() == before {
            return Err(missing("collection", id));
        }
        self.notes
            .retain(|note| note.collection_id.as_ref() != Some(id));
        Ok(())
    }
}

fn missing(kind: &str, id: impl std::fmt::Display) -> Error {
    Error::Api {
        status: 404,
        message: format!("{kind} {id} not found"),
    }
}

/// Server double. Mutating requests are recorded as `"<method> <id>"`.
#[derive(Default)]
pub struct FakeRemoteApi {
    state: Mutex<ServerState>,
    create_gate: Mutex<Option<Arc<Semaphore>>>,
    create_reply_delay: Mutex<Duration>,
}

impl FakeRemoteApi {
    /// Park every `create_note` before it reaches the server until the
    /// returned semaphore hands out a permit.
    pub fn hold_creates(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.create_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Apply `create_note` right away but answer only after `delay`.
    pub fn delay_create_replies(&self, delay: Duration) {
        *self.create_reply_delay.lock().unwrap() = delay;
    }

    /// Fail the next request of any kind.
    pub fn fail_next(&self, failure: InjectedFailure) {
        self.state.lock().unwrap().failures.push_back(failure);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn notes(&self) -> Vec<Note> {
        self.state.lock().unwrap().notes.clone()
    }

    pub fn collections(&self) -> Vec<Collection> {
        self.state.lock().unwrap().collections.clone()
    }

    pub fn settings(&self) -> Vec<Setting> {
        self.state.lock().unwrap().settings.clone()
    }

    /// Simulate another client deleting a note.
    pub fn drop_note(&self, id: &EntityId) {
        self.state.lock().unwrap().notes.retain(|note| &note.id != id);
    }

    pub fn drop_collection(&self, id: &EntityId) {
        self.state
            .lock()
            .unwrap()
            .collections
            .retain(|collection| &collection.id != id);
    }

    pub fn put_document_state(&self, state: DocumentReplicaState) {
        let mut server = self.state.lock().unwrap();
        server.documents.retain(|existing| existing.note_id != state.note_id);
        server.documents.push(state);
    }

    fn insert_note(&self, mut note: Note) -> Note {
        let mut state = self.state.lock().unwrap();
        note.id = state.mint(&note.id);
        let now = now_ms();
        note.server_created_at = Some(now);
        note.server_updated_at = Some(now);
        state.notes.push(note.clone());
        note
    }

    fn insert_collection(&self, mut collection: Collection) -> Collection {
        let mut state = self.state.lock().unwrap();
        collection.id = state.mint(&collection.id);
        let now = now_ms();
        collection.owner_id = Some("me".to_string());
        collection.server_created_at = Some(now);
        collection.server_updated_at = Some(now);
        state.collections.push(collection.clone());
        collection
    }

    /// Record a mutating call and pop an injected failure.
    fn begin(&self, call: Option<String>) -> Result<std::sync::MutexGuard<'_, ServerState>> {
        let mut state = self.state.lock().unwrap();
        if let Some(call) = call {
            state.calls.push(call);
        }
        match state.failures.pop_front() {
            Some(failure) => Err(failure.into_error()),
            None => Ok(state),
        }
    }
}

#[async_trait]
impl RemoteApi for FakeRemoteApi {
    async fn list_notes(&self) -> Result<Vec<Note>> {
        Ok(self.begin(None)?.notes.clone())
    }

    async fn create_note(&self, note: &Note) -> Result<Note> {
        let gate = self.create_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }
        {
            let state = self.begin(Some(format!("create_note {}", note.id)))?;
            if let Some(collection_id) = &note.collection_id {
                if !state.collections.iter().any(|c| &c.id == collection_id) {
                    return Err(missing("collection", collection_id));
                }
            }
        }
        let created = self.insert_note(note.clone());
        let delay = *self.create_reply_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(created)
    }

    async fn update_note(&self, note: &Note) -> Result<Note> {
        let mut state = self.begin(Some(format!("update_note {}", note.id)))?;
        let existing = state
            .notes
            .iter_mut()
            .find(|existing| existing.id == note.id)
            .ok_or_else(|| missing("note", &note.id))?;
        *existing = Note {
            server_created_at: existing.server_created_at,
            server_updated_at: Some(now_ms()),
            ..note.clone()
        };
        Ok(existing.clone())
    }

    async fn delete_note(&self, id: &EntityId) -> Result<()> {
        let mut state = self.begin(Some(format!("delete_note {id}")))?;
        let before = state.notes.len();
        state.notes.retain(|note| &note.id != id);
        if state.notes.len() == before {
            return Err(missing("note", id));
        }
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<Collection>> {
        Ok(self.begin(None)?.collections.clone())
    }

    async fn create_collection(&self, collection: &Collection) -> Result<Collection> {
        drop(self.begin(Some(format!("create_collection {}", collection.id)))?);
        Ok(self.insert_collection(collection.clone()))
    }

    async fn update_collection(&self, collection: &Collection) -> Result<Collection> {
        let mut state = self.begin(Some(format!("update_collection {}", collection.id)))?;
        let existing = state.collection_mut(&collection.id)?;
        existing.title = collection.title.clone();
        existing.updated_at = collection.updated_at;
        existing.server_updated_at = Some(now_ms());
        Ok(existing.clone())
    }

    async fn delete_collection(&self, id: &EntityId) -> Result<()> {
        self.begin(Some(format!("delete_collection {id}")))?
            .remove_collection(id)
    }

    async fn leave_collection(&self, id: &EntityId) -> Result<()> {
        self.begin(Some(format!("leave_collection {id}")))?
            .remove_collection(id)
    }

    async fn list_settings(&self) -> Result<Vec<Setting>> {
        Ok(self.begin(None)?.settings.clone())
    }

    async fn update_setting(&self, setting: &Setting) -> Result<Setting> {
        let mut state = self.begin(Some(format!("update_setting {}", setting.key)))?;
        state.settings.retain(|existing| existing.key != setting.key);
        state.settings.push(setting.clone());
        Ok(setting.clone())
    }

    async fn sync_settings(&self, settings: &[Setting]) -> Result<Vec<Setting>> {
        let mut state = self.begin(Some(format!("sync_settings {}", settings.len())))?;
        state.settings = settings.to_vec();
        Ok(state.settings.clone())
    }

    async fn list_document_states(&self) -> Result<Vec<DocumentReplicaState>> {
        Ok(self.begin(None)?.documents.clone())
    }

    async fn invite_member(
        &self,
        collection_id: &EntityId,
        email: &str,
        role: MemberRole,
    ) -> Result<Invitation> {
        let mut state = self.begin(Some(format!("invite_member {collection_id}")))?;
        state.collection_mut(collection_id)?;
        state.next_id += 1;
        let invitation = Invitation {
            id: format!("inv-{}", state.next_id),
            collection_id: collection_id.clone(),
            email: email.to_string(),
            role,
            created_at: Some(now_ms()),
        };
        state.invitations.push(invitation.clone());
        Ok(invitation)
    }

    async fn accept_invitation(&self, invitation_id: &str) -> Result<Collection> {
        let mut state = self.begin(Some(format!("accept_invitation {invitation_id}")))?;
        let position = state
            .invitations
            .iter()
            .position(|invitation| invitation.id == invitation_id)
            .ok_or_else(|| missing("invitation", invitation_id))?;
        let invitation = state.invitations.remove(position);
        let collection = state.collection_mut(&invitation.collection_id)?;
        collection.members.push(CollectionMember {
            user_id: invitation.email,
            role: invitation.role,
        });
        Ok(collection.clone())
    }

    async fn reject_invitation(&self, invitation_id: &str) -> Result<()> {
        let mut state = self.begin(Some(format!("reject_invitation {invitation_id}")))?;
        let before = state.invitations.len();
        state.invitations.retain(|invitation| invitation.id != invitation_id);
        if state.invitations.len() == before {
            return Err(missing("invitation", invitation_id));
        }
        Ok(())
    }

    async fn cancel_invitation(&self, invitation_id: &str) -> Result<()> {
        let mut state = self.begin(Some(format!("cancel_invitation {invitation_id}")))?;
        let before = state.invitations.len();
        state.invitations.retain(|invitation| invitation.id != invitation_id);
        if state.invitations.len() == before {
            return Err(missing("invitation", invitation_id));
        }
        Ok(())
    }

    async fn remove_member(&self, collection_id: &EntityId, user_id: &str) -> Result<()> {
        let mut state = self.begin(Some(format!("remove_member {collection_id} {user_id}")))?;
        state
            .collection_mut(collection_id)?
            .members
            .retain(|member| member.user_id != user_id);
        Ok(())
    }

    async fn change_member_role(
        &self,
        collection_id: &EntityId,
        user_id: &str,
        role: MemberRole,
    ) -> Result<Collection> {
        let mut state =
            self.begin(Some(format!("change_member_role {collection_id} {user_id}")))?;
        let collection = state.collection_mut(collection_id)?;
        let member = collection
            .members
            .iter_mut()
            .find(|member| member.user_id == user_id)
            .ok_or_else(|| missing("member", user_id))?;
        member.role = role;
        collection.server_updated_at = Some(now_ms());
        Ok(collection.clone())
    }
}

#[derive(Default)]
struct AuthorityState {
    /// Merged snapshot per document name
    documents: HashMap<String, Vec<u8>>,
    unreachable: bool,
    connections: usize,
}

fn merge(existing: Option<&Vec<u8>>, incoming: &[u8]) -> LoroDoc {
    let doc = LoroDoc::new();
    if let Some(existing) = existing {
        doc.import(existing).unwrap();
    }
    if !incoming.is_empty() {
        doc.import(incoming).unwrap();
    }
    doc
}

/// Collaboration authority double that merges everything it receives.
#[derive(Default, Clone)]
pub struct FakeAuthority {
    state: Arc<Mutex<AuthorityState>>,
}

impl FakeAuthority {
    /// Merge `update` into the authority's copy, as if a peer had pushed it.
    pub fn seed(&self, doc_name: &str, update: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let doc = merge(state.documents.get(doc_name), update);
        let snapshot = doc.export(ExportMode::Snapshot).unwrap();
        state.documents.insert(doc_name.to_string(), snapshot);
    }

    pub fn text(&self, doc_name: &str) -> String {
        let state = self.state.lock().unwrap();
        merge(state.documents.get(doc_name), &[])
            .get_text(CONTENT_CONTAINER)
            .to_string()
    }

    /// Accept connections but fail every exchange.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().unreachable = unreachable;
    }

    pub fn connections(&self) -> usize {
        self.state.lock().unwrap().connections
    }
}

#[async_trait]
impl DocumentAuthority for FakeAuthority {
    async fn connect(&self, doc_name: &str) -> Result<Box<dyn AuthoritySession>> {
        self.state.lock().unwrap().connections += 1;
        Ok(Box::new(FakeSession {
            doc_name: doc_name.to_string(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeSession {
    doc_name: String,
    state: Arc<Mutex<AuthorityState>>,
}

#[async_trait]
impl AuthoritySession for FakeSession {
    async fn exchange(&mut self, local_state: &[u8]) -> Result<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        if state.unreachable {
            return Err(Error::Network(format!("{} unreachable", self.doc_name)));
        }
        let doc = merge(state.documents.get(&self.doc_name), local_state);
        let snapshot = doc.export(ExportMode::Snapshot).unwrap();
        state
            .documents
            .insert(self.doc_name.clone(), snapshot.clone());
        Ok(snapshot)
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Everything a service needs, backed by an in-memory database and
/// [`FakeRemoteApi`].
pub struct TestHarness {
    pub local: LocalStore,
    pub store: Store,
    pub queue: Arc<ActionQueue>,
    pub api: Arc<FakeRemoteApi>,
    pub search: SearchIndex,
    listener: Option<Arc<dyn SwapListener>>,
}

impl TestHarness {
    pub async fn new() -> Self {
        let local = LocalStore::open_in_memory().await.unwrap();
        let store = Store::new();
        Self {
            queue: Arc::new(ActionQueue::new(local.clone(), store.clone())),
            search: SearchIndex::new(local.clone()),
            api: Arc::new(FakeRemoteApi::default()),
            local,
            store,
            listener: None,
        }
    }

    pub async fn with_listener(listener: Arc<dyn SwapListener>) -> Self {
        let mut harness = Self::new().await;
        harness.listener = Some(listener);
        harness
    }

    pub fn context(&self) -> SyncContext {
        SyncContext {
            local: self.local.clone(),
            store: self.store.clone(),
            queue: Arc::clone(&self.queue),
            api: self.api.clone(),
            search: self.search.clone(),
            swap_listener: self.listener.clone(),
        }
    }

    /// A note that exists on the server only, as another client created it.
    pub fn seed_remote_note(&self, title: &str, collection_id: Option<EntityId>) -> Note {
        self.api.insert_note(Note::new(title, collection_id))
    }

    pub fn seed_remote_collection(&self, title: &str) -> Collection {
        self.api.insert_collection(Collection::new(title))
    }
}
