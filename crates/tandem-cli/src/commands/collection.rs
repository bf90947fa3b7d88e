use tandem_core::models::MemberRole;

use crate::app::App;
use crate::cli::{CollectionCommands, RoleArg};
use crate::commands::common::{
    collection_to_list_item, format_collection_lines, normalize_identifier, normalize_title,
    resolve_collection, CollectionListItem,
};
use crate::error::CliError;

impl From<RoleArg> for MemberRole {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Editor => Self::Editor,
            RoleArg::Viewer => Self::Viewer,
        }
    }
}

pub async fn run_collection(command: CollectionCommands, app: &App) -> Result<(), CliError> {
    match command {
        CollectionCommands::Create { title } => {
            let title = normalize_title(&title)?;
            let collection = app.collections.create_collection(&title).await?;
            println!("{}", collection.id);
        }
        CollectionCommands::Rename { id, title } => {
            let title = normalize_title(&title)?;
            let collection = resolve_collection(&id, app).await?;
            let renamed = app.collections.rename_collection(&collection.id, &title).await?;
            println!("{}", renamed.id);
        }
        CollectionCommands::Delete { id } => {
            let collection = resolve_collection(&id, app).await?;
            app.collections.delete_collection(&collection.id).await?;
            println!("{}", collection.id);
        }
        CollectionCommands::Leave { id } => {
            let collection = resolve_collection(&id, app).await?;
            app.collections.leave_collection(&collection.id).await?;
            println!("{}", collection.id);
        }
        CollectionCommands::List { json } => run_list(json, app).await?,
        CollectionCommands::Invite { id, email, role } => {
            app.require_remote()?;
            let collection = resolve_collection(&id, app).await?;
            let invitation = app
                .collections
                .invite_member(&collection.id, &email, role.into())
                .await?;
            println!("{}", invitation.id);
        }
        CollectionCommands::Accept { invitation_id } => {
            app.require_remote()?;
            let invitation_id = normalize_identifier(&invitation_id)?;
            let collection = app.collections.accept_invitation(&invitation_id).await?;
            println!("{}", collection.id);
        }
        CollectionCommands::Reject { invitation_id } => {
            app.require_remote()?;
            let invitation_id = normalize_identifier(&invitation_id)?;
            app.collections.reject_invitation(&invitation_id).await?;
            println!("{invitation_id}");
        }
        CollectionCommands::CancelInvite { invitation_id } => {
            app.require_remote()?;
            let invitation_id = normalize_identifier(&invitation_id)?;
            app.collections.cancel_invitation(&invitation_id).await?;
            println!("{invitation_id}");
        }
        CollectionCommands::RemoveMember { id, user_id } => {
            app.require_remote()?;
            let user_id = normalize_identifier(&user_id)?;
            let collection = resolve_collection(&id, app).await?;
            app.collections.remove_member(&collection.id, &user_id).await?;
            println!("{user_id}");
        }
        CollectionCommands::SetRole { id, user_id, role } => {
            app.require_remote()?;
            let user_id = normalize_identifier(&user_id)?;
            let collection = resolve_collection(&id, app).await?;
            app.collections
                .change_member_role(&collection.id, &user_id, role.into())
                .await?;
            println!("{user_id}");
        }
    }
    Ok(())
}

async fn run_list(as_json: bool, app: &App) -> Result<(), CliError> {
    let mut collections = app.local.list_collections().await?;
    collections.sort_by(|a, b| a.title.to_lowercase().cmp(&b.title.to_lowercase()));

    if as_json {
        let json_items = collections
            .iter()
            .map(collection_to_list_item)
            .collect::<Vec<CollectionListItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
    } else if collections.is_empty() {
        println!("No collections yet.");
    } else {
        for line in format_collection_lines(&collections) {
            println!("{line}");
        }
    }
    Ok(())
}
