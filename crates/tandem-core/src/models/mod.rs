//! Data models for Tandem

mod collection;
mod document;
mod id;
mod note;
mod queue;
mod setting;

pub use collection::{Collection, CollectionMember, Invitation, MemberRole};
pub use document::{document_name, DocumentReplicaState};
pub use id::{EntityId, SwapMapping, LOCAL_ID_PREFIX};
pub use note::{Note, NoteChanges};
pub use queue::{ActionQueueItem, ActionStatus, ActionType, EntityKind};
pub use setting::{Setting, SYNC_SETTINGS_KEY};
