use std::path::Path;

use chrono::Utc;
use stockroom_core::sync::EngineSnapshot;

use crate::commands::common::{format_relative_time, open_engine};
use crate::error::CliError;

pub async fn run_status(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let engine = open_engine(db_path).await?;
    // Without a remote the probe would only report a configuration error.
    if engine.remote().is_configured() {
        engine.check_connection().await;
    }
    let snapshot = engine.snapshot().await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        for line in format_status_lines(&snapshot, engine.remote().is_configured()) {
            println!("{line}");
        }
    }
    Ok(())
}

pub fn format_status_lines(snapshot: &EngineSnapshot, remote_configured: bool) -> Vec<String> {
    let connection = if remote_configured {
        snapshot.connection.to_string()
    } else {
        "not configured".to_string()
    };
    let last_sync = snapshot
        .last_sync_time
        .map_or_else(|| "never".to_string(), |at| format_relative_time(at, Utc::now()));

    vec![
        format!("Connection:  {connection}"),
        format!("Sync:        {}", snapshot.sync),
        format!("Last sync:   {last_sync}"),
        format!(
            "Queue:       {} pending ({} blocked, {} failing)",
            snapshot.queue.pending, snapshot.queue.blocked, snapshot.queue.failing
        ),
        format!("Conflicts:   {} unresolved", snapshot.unresolved_conflicts),
    ]
}
