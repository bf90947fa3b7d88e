//! Database layer using libSQL

mod collection_repository;
mod connection;
mod document_repository;
mod local_store;
mod migrations;
mod note_repository;
mod queue_repository;
mod search_repository;
mod settings_repository;

pub use collection_repository::{CollectionRepository, LibSqlCollectionRepository};
pub use connection::Database;
pub use document_repository::{DocumentRepository, LibSqlDocumentRepository, LoggedUpdate};
pub use local_store::LocalStore;
pub use note_repository::{LibSqlNoteRepository, NoteRepository};
pub use queue_repository::{LibSqlQueueRepository, QueueRepository};
pub use search_repository::{LibSqlSearchRepository, SearchHit, SearchRepository};
pub use settings_repository::{LibSqlSettingsRepository, SettingsRepository};

use libsql::{Connection, Value};

use crate::error::Result;

/// Commit when `result` is `Ok`, roll back otherwise.
///
/// Pairs with an explicit `BEGIN TRANSACTION` issued by the caller.
pub(crate) async fn finish_transaction<T>(conn: &Connection, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            if let Err(error) = conn.execute("COMMIT", ()).await {
                conn.execute("ROLLBACK", ()).await.ok();
                return Err(error.into());
            }
            Ok(value)
        }
        Err(error) => {
            conn.execute("ROLLBACK", ()).await.ok();
            Err(error)
        }
    }
}

pub(crate) fn text_or_null(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |value| Value::Text(value.to_string()))
}

pub(crate) fn int_or_null(value: Option<i64>) -> Value {
    value.map_or(Value::Null, Value::Integer)
}

pub(crate) fn optional_text(value: Value) -> Option<String> {
    match value {
        Value::Text(text) => Some(text),
        _ => None,
    }
}

pub(crate) fn optional_int(value: Value) -> Option<i64> {
    match value {
        Value::Integer(number) => Some(number),
        _ => None,
    }
}
