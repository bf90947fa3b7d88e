use crate::app::App;
use crate::commands::common::{format_queue_lines, queue_item_to_list_item, QueueListItem};
use crate::error::CliError;

pub async fn run_queue(as_json: bool, app: &App) -> Result<(), CliError> {
    let items = app.local.list_queue().await?;

    if as_json {
        let json_items = items
            .iter()
            .map(queue_item_to_list_item)
            .collect::<Vec<QueueListItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if items.is_empty() {
        println!("Nothing waiting to upload.");
        return Ok(());
    }

    for line in format_queue_lines(&items) {
        println!("{line}");
    }
    Ok(())
}
