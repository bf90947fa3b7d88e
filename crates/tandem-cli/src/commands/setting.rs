use serde::Serialize;
use tandem_core::models::Setting;

use crate::app::App;
use crate::cli::SettingCommands;
use crate::commands::common::{format_timestamp, normalize_identifier, parse_setting_value};
use crate::error::CliError;

#[derive(Debug, Serialize)]
struct SettingListItem<'a> {
    key: &'a str,
    value: &'a serde_json::Value,
    updated_at: i64,
}

pub async fn run_setting(command: SettingCommands, app: &App) -> Result<(), CliError> {
    match command {
        SettingCommands::Set { key, value } => {
            let key = normalize_identifier(&key)?;
            let setting = app
                .settings
                .set_setting(&key, parse_setting_value(&value))
                .await?;
            println!("{} = {}", setting.key, setting.value);
        }
        SettingCommands::List { json } => {
            let mut settings = app.local.list_settings().await?;
            settings.sort_by(|a, b| a.key.cmp(&b.key));
            if json {
                let items = settings.iter().map(to_list_item).collect::<Vec<_>>();
                println!("{}", serde_json::to_string_pretty(&items)?);
            } else {
                for setting in &settings {
                    println!(
                        "{:<24}  {:<32}  {}",
                        setting.key,
                        setting.value,
                        format_timestamp(setting.updated_at)
                    );
                }
            }
        }
        SettingCommands::SyncSettings { state } => {
            app.settings.set_sync_enabled(state.is_on()).await?;
            let enabled = app.settings.sync_enabled().await?;
            println!("Settings sync {}", if enabled { "on" } else { "off" });
        }
    }
    Ok(())
}

fn to_list_item(setting: &Setting) -> SettingListItem<'_> {
    SettingListItem {
        key: &setting.key,
        value: &setting.value,
        updated_at: setting.updated_at,
    }
}
