use tandem_core::models::{EntityId, Note, NoteChanges};

use crate::app::App;
use crate::commands::common::{
    format_note_lines, format_timestamp, normalize_search_query, normalize_title,
    note_to_list_item, resolve_collection, resolve_note, NoteListItem,
};
use crate::error::CliError;

pub async fn run_add(
    title_parts: &[String],
    description: Option<String>,
    collection: Option<&str>,
    body: Option<&str>,
    app: &App,
) -> Result<(), CliError> {
    let title = normalize_title(title_parts)?;
    let collection_id = match collection {
        Some(query) => Some(resolve_collection(query, app).await?.id),
        None => None,
    };

    let note = app.notes.create_note(&title, description, collection_id).await?;
    if let Some(body) = body {
        write_body(&note.id, body, app).await?;
    }

    println!("{}", note.id);
    Ok(())
}

pub async fn run_edit(
    id: &str,
    title: Option<String>,
    description: Option<String>,
    body: Option<&str>,
    app: &App,
) -> Result<(), CliError> {
    let note = resolve_note(id, app).await?;
    if title.is_some() || description.is_some() {
        let changes = NoteChanges {
            title,
            description: description.map(Some),
            collection_id: None,
        };
        app.notes.update_note(&note.id, changes).await?;
    }
    if let Some(body) = body {
        write_body(&note.id, body, app).await?;
    }

    println!("{}", note.id);
    Ok(())
}

pub async fn run_move(
    id: &str,
    collection: Option<&str>,
    app: &App,
) -> Result<(), CliError> {
    let note = resolve_note(id, app).await?;
    let target = match collection {
        Some(query) => Some(resolve_collection(query, app).await?.id),
        None => None,
    };

    let moved = app.notes.move_note(&note.id, target).await?;
    match &moved.collection_id {
        Some(collection_id) => println!("{} -> {collection_id}", moved.id),
        None => println!("{}", moved.id),
    }
    Ok(())
}

pub async fn run_show(id: &str, app: &App) -> Result<(), CliError> {
    let note = resolve_note(id, app).await?;
    let body = app.documents.body_text(&note.id).await?;

    println!("{}", note.title);
    println!("id:         {}", note.id);
    if let Some(collection_id) = &note.collection_id {
        println!("collection: {collection_id}");
    }
    println!("updated:    {}", format_timestamp(note.updated_at));
    if !note.is_synced() {
        println!("status:     not yet uploaded");
    }
    if let Some(description) = &note.description {
        println!();
        println!("{description}");
    }
    if !body.is_empty() {
        println!();
        println!("{body}");
    }
    Ok(())
}

pub async fn run_delete(id: &str, app: &App) -> Result<(), CliError> {
    let note = resolve_note(id, app).await?;
    app.notes.delete_note(&note.id).await?;
    println!("{}", note.id);
    Ok(())
}

pub async fn run_list(
    collection: Option<&str>,
    limit: usize,
    as_json: bool,
    app: &App,
) -> Result<(), CliError> {
    let collection_id = match collection {
        Some(query) => Some(resolve_collection(query, app).await?.id),
        None => None,
    };
    let mut notes: Vec<Note> = app.store.read(|state| match &collection_id {
        Some(collection_id) => state.notes_in(collection_id).cloned().collect(),
        None => state.notes.values().cloned().collect(),
    });
    sort_recent_first(&mut notes);
    notes.truncate(limit);

    if as_json {
        let json_items = notes
            .iter()
            .map(note_to_list_item)
            .collect::<Vec<NoteListItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
    } else {
        for line in format_note_lines(&notes) {
            println!("{line}");
        }
    }

    Ok(())
}

pub async fn run_search(
    query: &str,
    limit: usize,
    as_json: bool,
    app: &App,
) -> Result<(), CliError> {
    let query = normalize_search_query(query)?;
    let hits = app.search.search(&query, Some(limit)).await?;

    let mut notes = Vec::with_capacity(hits.len());
    for hit in hits {
        if let Some(note) = app.local.get_note(&hit.note_id).await? {
            notes.push(note);
        }
    }

    if as_json {
        let json_items = notes
            .iter()
            .map(note_to_list_item)
            .collect::<Vec<NoteListItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
    } else if notes.is_empty() {
        println!("No notes match '{query}'.");
    } else {
        for line in format_note_lines(&notes) {
            println!("{line}");
        }
    }
    Ok(())
}

/// Replace a note body through the document engine and flush it.
async fn write_body(note_id: &EntityId, body: &str, app: &App) -> Result<(), CliError> {
    app.documents.open_note(note_id).await?;
    if !app.documents.edit_text(body).await? {
        tracing::debug!(note_id = %note_id, "Body unchanged");
    }
    app.documents.close_note().await?;
    Ok(())
}

pub fn sort_recent_first(notes: &mut [Note]) {
    notes.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}
