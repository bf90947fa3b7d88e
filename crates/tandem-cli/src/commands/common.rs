use std::env;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tandem_core::config::ClientConfig;
use tandem_core::models::{ActionQueueItem, Collection, EntityId, Note, LOCAL_ID_PREFIX};

use crate::app::App;
use crate::error::CliError;

pub const ENV_DB_PATH: &str = "TANDEM_DB_PATH";
pub const ENV_CONFIG_PATH: &str = "TANDEM_CONFIG";

#[derive(Debug, Serialize)]
pub struct NoteListItem {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub collection_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub relative_time: String,
    pub synced: bool,
}

#[derive(Debug, Serialize)]
pub struct CollectionListItem {
    pub id: String,
    pub title: String,
    pub owner_id: Option<String>,
    pub members: usize,
    pub synced: bool,
}

#[derive(Debug, Serialize)]
pub struct QueueListItem {
    pub id: String,
    pub action: String,
    pub entity_id: String,
    pub status: String,
    pub attempts: u32,
    pub error: Option<String>,
    pub created_at: i64,
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os(ENV_DB_PATH).map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tandem")
        .join("tandem.db")
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tandem")
        .join("config.json")
}

/// Config file (explicit, `TANDEM_CONFIG`, or the default location) with
/// `TANDEM_*` overrides on top.
pub fn resolve_config(cli_config_path: Option<PathBuf>) -> Result<ClientConfig, CliError> {
    let path = cli_config_path
        .or_else(|| env::var_os(ENV_CONFIG_PATH).map(PathBuf::from))
        .unwrap_or_else(default_config_path);
    load_config(&path, |key| env::var(key).ok())
}

pub fn load_config(
    path: &Path,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<ClientConfig, CliError> {
    ClientConfig::load_from_path(path)
        .and_then(|config| config.with_env_overrides(lookup))
        .map_err(|error| CliError::Config(error.to_string()))
}

pub fn normalize_title(parts: &[String]) -> Result<String, CliError> {
    let joined = parts.join(" ");
    let trimmed = joined.trim();
    if trimmed.is_empty() {
        Err(CliError::EmptyTitle)
    } else {
        Ok(trimmed.to_string())
    }
}

pub fn normalize_identifier(id: &str) -> Result<String, CliError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        Err(CliError::EmptyId)
    } else {
        Ok(trimmed.to_string())
    }
}

pub fn normalize_search_query(query: &str) -> Result<String, CliError> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        Err(CliError::EmptySearchQuery)
    } else {
        Ok(trimmed.to_string())
    }
}

/// JSON when it parses, a plain string otherwise.
pub fn parse_setting_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

enum PrefixMatch<T> {
    None,
    One(T),
    Many(Vec<String>),
}

fn match_prefix<T>(query: &str, items: Vec<T>, id_of: impl Fn(&T) -> &EntityId) -> PrefixMatch<T> {
    let mut matches: Vec<T> = items
        .into_iter()
        .filter(|item| id_of(item).as_str().starts_with(query))
        .collect();
    if let Some(position) = matches.iter().position(|item| id_of(item).as_str() == query) {
        return PrefixMatch::One(matches.swap_remove(position));
    }
    match matches.len() {
        0 => PrefixMatch::None,
        1 => PrefixMatch::One(matches.remove(0)),
        _ => PrefixMatch::Many(
            matches
                .iter()
                .take(3)
                .map(|item| short_id(id_of(item)))
                .collect(),
        ),
    }
}

/// Look a note up by exact id or unique id prefix.
pub async fn resolve_note(query: &str, app: &App) -> Result<Note, CliError> {
    let query = normalize_identifier(query)?;
    if let Some(note) = app.local.get_note(&EntityId::new(query.as_str())).await? {
        return Ok(note);
    }
    match match_prefix(&query, app.local.list_notes().await?, |note| &note.id) {
        PrefixMatch::One(note) => Ok(note),
        PrefixMatch::None => Err(CliError::NoteNotFound(query)),
        PrefixMatch::Many(options) => Err(CliError::AmbiguousId(format!(
            "ID prefix '{query}' is ambiguous; matches: {}",
            options.join(", ")
        ))),
    }
}

pub async fn resolve_collection(query: &str, app: &App) -> Result<Collection, CliError> {
    let query = normalize_identifier(query)?;
    if let Some(collection) = app
        .local
        .get_collection(&EntityId::new(query.as_str()))
        .await?
    {
        return Ok(collection);
    }
    match match_prefix(&query, app.local.list_collections().await?, |collection| {
        &collection.id
    }) {
        PrefixMatch::One(collection) => Ok(collection),
        PrefixMatch::None => Err(CliError::CollectionNotFound(query)),
        PrefixMatch::Many(options) => Err(CliError::AmbiguousId(format!(
            "ID prefix '{query}' is ambiguous; matches: {}",
            options.join(", ")
        ))),
    }
}

/// Provisional ids start with `local-` and a millisecond timestamp, so they
/// keep a longer prefix.
pub fn short_id(id: &EntityId) -> String {
    let id = id.as_str();
    let width = if id.starts_with(LOCAL_ID_PREFIX) { 24 } else { 13 };
    id.chars().take(width).collect()
}

pub fn format_note_lines(notes: &[Note]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    notes
        .iter()
        .map(|note| {
            let id = short_id(&note.id);
            let title = truncate(&note.title, 40);
            let relative_time = format_relative_time(note.updated_at, now_ms);
            let marker = if note.is_synced() { " " } else { "*" };
            format!("{marker}{id:<24}  {title:<40}  {relative_time}")
        })
        .collect()
}

pub fn note_to_list_item(note: &Note) -> NoteListItem {
    NoteListItem {
        id: note.id.to_string(),
        title: note.title.clone(),
        description: note.description.clone(),
        collection_id: note.collection_id.as_ref().map(ToString::to_string),
        created_at: note.created_at,
        updated_at: note.updated_at,
        relative_time: format_relative_time(note.updated_at, Utc::now().timestamp_millis()),
        synced: note.is_synced(),
    }
}

pub fn format_collection_lines(collections: &[Collection]) -> Vec<String> {
    collections
        .iter()
        .map(|collection| {
            let marker = if collection.is_synced() { " " } else { "*" };
            format!(
                "{marker}{:<24}  {:<32}  {} member(s)",
                short_id(&collection.id),
                truncate(&collection.title, 32),
                collection.members.len()
            )
        })
        .collect()
}

pub fn collection_to_list_item(collection: &Collection) -> CollectionListItem {
    CollectionListItem {
        id: collection.id.to_string(),
        title: collection.title.clone(),
        owner_id: collection.owner_id.clone(),
        members: collection.members.len(),
        synced: collection.is_synced(),
    }
}

pub fn format_queue_lines(items: &[ActionQueueItem]) -> Vec<String> {
    items
        .iter()
        .map(|item| {
            let mut line = format!(
                "{}  {:<17}  {:<10}  {}",
                format_timestamp(item.created_at),
                item.action_type,
                item.status,
                item.related_entity_id
            );
            if item.attempts > 0 {
                line.push_str(&format!("  attempts={}", item.attempts));
            }
            if let Some(error) = &item.error {
                line.push_str(&format!("  error={}", truncate(error, 60)));
            }
            line
        })
        .collect()
}

pub fn queue_item_to_list_item(item: &ActionQueueItem) -> QueueListItem {
    QueueListItem {
        id: item.id.clone(),
        action: item.action_type.to_string(),
        entity_id: item.related_entity_id.to_string(),
        status: item.status.to_string(),
        attempts: item.attempts,
        error: item.error.clone(),
        created_at: item.created_at,
    }
}

pub fn truncate(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        collapsed
    } else {
        let take_len = max_chars.saturating_sub(3);
        let mut truncated = collapsed.chars().take(take_len).collect::<String>();
        truncated.push_str("...");
        truncated
    }
}

pub fn format_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;
    let month = 30 * day;
    let year = 365 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else if diff < month {
        format!("{}w ago", diff / week)
    } else if diff < year {
        format!("{}mo ago", diff / month)
    } else {
        format!("{}y ago", diff / year)
    }
}
