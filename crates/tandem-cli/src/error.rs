use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] tandem_core::Error),
    #[error(transparent)]
    Sync(#[from] tandem_core::sync::SyncError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("No note title provided")]
    EmptyTitle,
    #[error("ID cannot be empty")]
    EmptyId,
    #[error("Search query cannot be empty")]
    EmptySearchQuery,
    #[error("Note not found for id/prefix: {0}")]
    NoteNotFound(String),
    #[error("Collection not found for id/prefix: {0}")]
    CollectionNotFound(String),
    #[error("{0}")]
    AmbiguousId(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Sync is not configured. Set TANDEM_API_URL or api_base_url in the config file.")]
    SyncNotConfigured,
}
