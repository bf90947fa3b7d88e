//! tandem-core - Core library for Tandem
//!
//! Offline-first sync engine for collaborative notes: the local store, the
//! durable action queue, identity swaps, realtime dispatch and note body
//! replication. Front ends build a [`sync::SyncOrchestrator`] from these parts
//! and drive it.

pub mod api;
pub mod config;
pub mod db;
mod debounce;
pub mod docsync;
pub mod error;
pub mod models;
pub mod network;
pub mod queue;
pub mod realtime;
pub mod search;
pub mod services;
pub mod store;
pub mod sync;
mod util;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, Result};
pub use models::{Collection, EntityId, Note, Setting};
