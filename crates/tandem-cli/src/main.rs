//! Tandem CLI - offline-first collaborative notes from the terminal
//!
//! Every command works against the local database first; `sync` and `watch`
//! talk to the server when one is configured.

mod app;
mod cli;
mod commands;
mod error;


use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::app::App;
use crate::cli::{Cli, Commands};
use crate::commands::collection::run_collection;
use crate::commands::common::{resolve_config, resolve_db_path};
use crate::commands::note::{
    run_add, run_delete, run_edit, run_list, run_move, run_search, run_show,
};
use crate::commands::queue::run_queue;
use crate::commands::setting::run_setting;
use crate::commands::sync::{run_sync, run_watch};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("tandem=info,tandem_core=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);
    let config = resolve_config(cli.config)?;
    let app = App::open(&db_path, config).await?;

    let outcome = dispatch(cli.command, &app).await;
    let closed = app.close().await;
    outcome?;
    closed
}

async fn dispatch(command: Commands, app: &App) -> Result<(), CliError> {
    match command {
        Commands::Add {
            title,
            description,
            collection,
            body,
        } => run_add(&title, description, collection.as_deref(), body.as_deref(), app).await,
        Commands::Edit {
            id,
            title,
            description,
            body,
        } => run_edit(&id, title, description, body.as_deref(), app).await,
        Commands::Move {
            id,
            collection,
            none: _,
        } => run_move(&id, collection.as_deref(), app).await,
        Commands::Show { id } => run_show(&id, app).await,
        Commands::Delete { id } => run_delete(&id, app).await,
        Commands::List {
            collection,
            limit,
            json,
        } => run_list(collection.as_deref(), limit, json, app).await,
        Commands::Search { query, limit, json } => run_search(&query, limit, json, app).await,
        Commands::Collection { command } => run_collection(command, app).await,
        Commands::Setting { command } => run_setting(command, app).await,
        Commands::Queue { json } => run_queue(json, app).await,
        Commands::Sync => run_sync(app).await,
        Commands::Watch => run_watch(app).await,
    }
}
