//! In-memory reactive view of local state.
//!
//! State changes are expressed as [`StoreCommand`]s folded into an immutable
//! [`StoreSnapshot`] by [`reduce`]. [`Store`] publishes every new snapshot on a
//! `tokio::sync::watch` channel so front ends can re-render on change.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::watch;

use crate::models::{
    ActionQueueItem, Collection, DocumentReplicaState, EntityId, Note, Setting,
};

/// What the user is currently looking at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub note: Option<EntityId>,
    pub collection: Option<EntityId>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSnapshot {
    pub notes: BTreeMap<EntityId, Note>,
    pub collections: BTreeMap<EntityId, Collection>,
    pub settings: BTreeMap<String, Setting>,
    pub document_states: BTreeMap<EntityId, DocumentReplicaState>,
    /// Queue items ordered by `created_at`
    pub queue: Vec<ActionQueueItem>,
    pub selection: Selection,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreCommand {
    SetNotes(Vec<Note>),
    UpsertNote(Note),
    RemoveNotes(Vec<EntityId>),
    /// A provisional note received its server identity
    SwapNote { from: EntityId, note: Note },
    SetCollections(Vec<Collection>),
    UpsertCollection(Collection),
    RemoveCollection(EntityId),
    SwapCollection { from: EntityId, collection: Collection },
    SetSettings(Vec<Setting>),
    UpsertSetting(Setting),
    RemoveSetting(String),
    SetDocumentStates(Vec<DocumentReplicaState>),
    UpsertDocumentState(DocumentReplicaState),
    SetQueue(Vec<ActionQueueItem>),
    UpsertQueueItem(ActionQueueItem),
    RemoveQueueItem(String),
    SelectNote(Option<EntityId>),
    SelectCollection(Option<EntityId>),
}

impl StoreSnapshot {
    pub fn note(&self, id: &EntityId) -> Option<&Note> {
        self.notes.get(id)
    }

    pub fn collection(&self, id: &EntityId) -> Option<&Collection> {
        self.collections.get(id)
    }

    pub fn notes_in<'a>(
        &'a self,
        collection_id: &'a EntityId,
    ) -> impl Iterator<Item = &'a Note> + 'a {
        self.notes
            .values()
            .filter(move |note| note.collection_id.as_ref() == Some(collection_id))
    }

    pub fn setting(&self, key: &str) -> Option<&Setting> {
        self.settings.get(key)
    }

    /// Fold one command into this snapshot.
    pub fn apply(&mut self, command: StoreCommand) {
        match command {
            StoreCommand::SetNotes(notes) => {
                self.notes = notes.into_iter().map(|note| (note.id.clone(), note)).collect();
                self.drop_dangling_selection();
            }
            StoreCommand::UpsertNote(note) => {
                self.notes.insert(note.id.clone(), note);
            }
            StoreCommand::RemoveNotes(ids) => {
                for id in &ids {
                    self.notes.remove(id);
                    self.document_states.remove(id);
                }
                self.drop_dangling_selection();
            }
            StoreCommand::SwapNote { from, note } => {
                let to = note.id.clone();
                // Only follow when the provisional row was still present
                if self.notes.remove(&from).is_some() || from == to {
                    self.notes.insert(to.clone(), note);
                }
                if let Some(mut state) = self.document_states.remove(&from) {
                    state.id = to.clone();
                    state.note_id = to.clone();
                    self.document_states.insert(to.clone(), state);
                }
                rewrite_queue_refs(&mut self.queue, &from, &to);
                if self.selection.note.as_ref() == Some(&from) {
                    self.selection.note = Some(to);
                }
            }
            StoreCommand::SetCollections(collections) => {
                self.collections = collections
                    .into_iter()
                    .map(|collection| (collection.id.clone(), collection))
                    .collect();
                self.drop_dangling_selection();
            }
            StoreCommand::UpsertCollection(collection) => {
                self.collections.insert(collection.id.clone(), collection);
            }
            StoreCommand::RemoveCollection(id) => {
                self.collections.remove(&id);
                self.drop_dangling_selection();
            }
            StoreCommand::SwapCollection { from, collection } => {
                let to = collection.id.clone();
                if self.collections.remove(&from).is_some() || from == to {
                    self.collections.insert(to.clone(), collection);
                }
                for note in self.notes.values_mut() {
                    if note.collection_id.as_ref() == Some(&from) {
                        note.collection_id = Some(to.clone());
                    }
                }
                rewrite_queue_refs(&mut self.queue, &from, &to);
                if self.selection.collection.as_ref() == Some(&from) {
                    self.selection.collection = Some(to);
                }
            }
            StoreCommand::SetSettings(settings) => {
                self.settings = settings
                    .into_iter()
                    .map(|setting| (setting.key.clone(), setting))
                    .collect();
            }
            StoreCommand::UpsertSetting(setting) => {
                self.settings.insert(setting.key.clone(), setting);
            }
            StoreCommand::RemoveSetting(key) => {
                self.settings.remove(&key);
            }
            StoreCommand::SetDocumentStates(states) => {
                self.document_states = states
                    .into_iter()
                    .map(|state| (state.note_id.clone(), state))
                    .collect();
            }
            StoreCommand::UpsertDocumentState(state) => {
                self.document_states.insert(state.note_id.clone(), state);
            }
            StoreCommand::SetQueue(mut items) => {
                items.sort_by_key(|item| item.created_at);
                self.queue = items;
            }
            StoreCommand::UpsertQueueItem(item) => {
                if let Some(existing) = self.queue.iter_mut().find(|queued| queued.id == item.id) {
                    *existing = item;
                } else {
                    let position = self
                        .queue
                        .partition_point(|queued| queued.created_at <= item.created_at);
                    self.queue.insert(position, item);
                }
            }
            StoreCommand::RemoveQueueItem(id) => {
                self.queue.retain(|item| item.id != id);
            }
            StoreCommand::SelectNote(id) => {
                self.selection.note = id;
            }
            StoreCommand::SelectCollection(id) => {
                self.selection.collection = id;
            }
        }
    }

    fn drop_dangling_selection(&mut self) {
        if let Some(id) = &self.selection.note {
            if !self.notes.contains_key(id) {
                self.selection.note = None;
            }
        }
        if let Some(id) = &self.selection.collection {
            if !self.collections.contains_key(id) {
                self.selection.collection = None;
            }
        }
    }
}

fn rewrite_queue_refs(queue: &mut [ActionQueueItem], from: &EntityId, to: &EntityId) {
    for item in queue.iter_mut() {
        if &item.related_entity_id == from {
            item.related_entity_id = to.clone();
        }
    }
}

/// Pure reducer: the snapshot that results from applying `command` to `state`.
#[must_use]
pub fn reduce(state: &StoreSnapshot, command: StoreCommand) -> StoreSnapshot {
    let mut next = state.clone();
    next.apply(command);
    next
}

/// Shared handle to the reactive state.
#[derive(Clone)]
pub struct Store {
    sender: Arc<watch::Sender<StoreSnapshot>>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(StoreSnapshot::default());
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn apply(&self, command: StoreCommand) {
        self.sender.send_modify(|state| state.apply(command));
    }

    /// Apply several commands as one observable change.
    pub fn apply_all(&self, commands: impl IntoIterator<Item = StoreCommand>) {
        self.sender.send_modify(|state| {
            for command in commands {
                state.apply(command);
            }
        });
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.sender.borrow().clone()
    }

    /// Read without cloning the whole snapshot.
    pub fn read<T>(&self, f: impl FnOnce(&StoreSnapshot) -> T) -> T {
        f(&self.sender.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<StoreSnapshot> {
        self.sender.subscribe()
    }
}
