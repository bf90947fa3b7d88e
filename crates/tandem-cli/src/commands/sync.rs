use tandem_core::sync::{SyncPhase, SyncReport};

use crate::app::App;
use crate::error::CliError;

pub async fn run_sync(app: &App) -> Result<(), CliError> {
    let report = app.sync_once().await?;
    for line in format_sync_report(&report) {
        println!("{line}");
    }
    Ok(())
}

/// Run the background loops until Ctrl-C.
pub async fn run_watch(app: &App) -> Result<(), CliError> {
    app.require_remote()?;
    let mut status = app.orchestrator.watch_state();
    app.orchestrator.start();
    println!("Watching for changes, press Ctrl-C to stop");

    let mut last_phase = SyncPhase::Idle;
    let mut last_error: Option<String> = None;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = status.borrow_and_update().clone();
                if snapshot.phase != last_phase {
                    tracing::info!(phase = snapshot.phase.as_str(), "Sync phase changed");
                    last_phase = snapshot.phase;
                }
                if snapshot.last_error != last_error {
                    if let Some(error) = &snapshot.last_error {
                        tracing::warn!("Sync error: {error}");
                    }
                    last_error = snapshot.last_error;
                }
            }
        }
    }

    app.orchestrator.shutdown();
    println!("Stopped");
    Ok(())
}

pub fn format_sync_report(report: &SyncReport) -> Vec<String> {
    if report.skipped {
        return vec!["A sync is already running".to_string()];
    }
    if report.offline {
        return vec!["Server unreachable, local changes stay queued".to_string()];
    }

    let queue = &report.queue;
    let mut lines = vec![format!(
        "Uploaded {} change(s), {} already gone, {} rejected",
        queue.processed, queue.absorbed, queue.failed
    )];
    if queue.deferred {
        let reason = queue.last_error.as_deref().unwrap_or("server unavailable");
        lines.push(format!("Upload paused: {reason}"));
    }
    for (name, reconciled) in &report.reconciled {
        lines.push(format!(
            "{name}: {} updated, {} removed, {} waiting on local changes",
            reconciled.upserted, reconciled.pruned, reconciled.deferred
        ));
    }
    lines.push("Sync completed".to_string());
    lines
}
