use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "tandem")]
#[command(about = "Offline-first collaborative notes from the command line")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Optional path to a JSON client config file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a new note
    #[command(alias = "new")]
    Add {
        /// Note title
        title: Vec<String>,
        /// Short description shown in listings
        #[arg(short, long)]
        description: Option<String>,
        /// Collection ID or unique ID prefix
        #[arg(short, long, value_name = "ID")]
        collection: Option<String>,
        /// Initial body text
        #[arg(short, long)]
        body: Option<String>,
    },
    /// Edit a note's metadata or body
    Edit {
        /// Note ID or unique ID prefix
        id: String,
        #[arg(short, long)]
        title: Option<String>,
        #[arg(short, long)]
        description: Option<String>,
        /// Replace the body with this text
        #[arg(short, long)]
        body: Option<String>,
    },
    /// Move a note into a collection, or out of any with --none
    Move {
        /// Note ID or unique ID prefix
        id: String,
        /// Target collection ID or unique ID prefix
        #[arg(value_name = "COLLECTION", required_unless_present = "none")]
        collection: Option<String>,
        #[arg(long, conflicts_with = "collection")]
        none: bool,
    },
    /// Print a note with its body
    Show {
        /// Note ID or unique ID prefix
        id: String,
    },
    /// Delete a note
    Delete {
        /// Note ID or unique ID prefix
        id: String,
    },
    /// List notes
    List {
        /// Only notes in this collection
        #[arg(short, long, value_name = "ID")]
        collection: Option<String>,
        /// Number of notes to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Search note titles and bodies
    Search {
        /// Search query
        query: String,
        /// Number of notes to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage collections and their members
    Collection {
        #[command(subcommand)]
        command: CollectionCommands,
    },
    /// Manage settings
    Setting {
        #[command(subcommand)]
        command: SettingCommands,
    },
    /// Show queued changes waiting for upload
    Queue {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run one full sync cycle against the server
    Sync,
    /// Keep syncing in the foreground until interrupted
    Watch,
}

#[derive(Subcommand)]
pub enum CollectionCommands {
    /// Create a collection
    Create { title: Vec<String> },
    /// Rename a collection
    Rename {
        /// Collection ID or unique ID prefix
        id: String,
        title: Vec<String>,
    },
    /// Delete a collection and its notes
    Delete {
        /// Collection ID or unique ID prefix
        id: String,
    },
    /// Leave a shared collection
    Leave {
        /// Collection ID or unique ID prefix
        id: String,
    },
    /// List collections
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Invite someone by email
    Invite {
        /// Collection ID or unique ID prefix
        id: String,
        email: String,
        #[arg(long, value_enum, default_value_t = RoleArg::Viewer)]
        role: RoleArg,
    },
    /// Accept an invitation
    Accept { invitation_id: String },
    /// Reject an invitation
    Reject { invitation_id: String },
    /// Withdraw an invitation you sent
    CancelInvite { invitation_id: String },
    /// Remove a member from a collection
    RemoveMember {
        /// Collection ID or unique ID prefix
        id: String,
        user_id: String,
    },
    /// Change a member's role
    SetRole {
        /// Collection ID or unique ID prefix
        id: String,
        user_id: String,
        #[arg(value_enum)]
        role: RoleArg,
    },
}

#[derive(Subcommand)]
pub enum SettingCommands {
    /// Set a value (parsed as JSON, plain text otherwise)
    Set { key: String, value: String },
    /// List settings
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Turn settings sync on or off
    SyncSettings {
        #[arg(value_enum)]
        state: Toggle,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum RoleArg {
    Editor,
    Viewer,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum Toggle {
    On,
    Off,
}

impl Toggle {
    pub const fn is_on(self) -> bool {
        matches!(self, Self::On)
    }
}
