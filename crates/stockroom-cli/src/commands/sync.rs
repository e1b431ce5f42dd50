use std::path::Path;

use stockroom_core::sync::SkipReason;
use stockroom_core::{SyncOutcome, SyncReport};

use crate::commands::common::{open_engine, short_id};
use crate::error::CliError;

pub async fn run_check(db_path: &Path) -> Result<(), CliError> {
    let engine = open_engine(db_path).await?;
    if !engine.remote().is_configured() {
        return Err(CliError::RemoteNotConfigured);
    }

    if engine.check_connection().await {
        println!("Remote store is reachable");
        Ok(())
    } else {
        Err(CliError::Offline)
    }
}

pub async fn run_sync(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let engine = open_engine(db_path).await?;
    if !engine.remote().is_configured() {
        return Err(CliError::RemoteNotConfigured);
    }

    engine.check_connection().await;
    let outcome = engine.sync_data().await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    match outcome {
        SyncOutcome::Skipped {
            reason: SkipReason::Offline,
        } => Err(CliError::Offline),
        SyncOutcome::Skipped {
            reason: SkipReason::AlreadySyncing,
        } => {
            println!("A sync is already running");
            Ok(())
        }
        SyncOutcome::Completed(report) => {
            for line in format_report_lines(&report) {
                println!("{line}");
            }
            Ok(())
        }
    }
}

pub fn format_report_lines(report: &SyncReport) -> Vec<String> {
    let mut lines = vec![format!("Sync completed: {} applied", report.applied)];

    if !report.conflicts.is_empty() {
        lines.push(format!(
            "{} new conflict(s); see `stockroom conflicts`",
            report.conflicts.len()
        ));
    }
    for failure in &report.failed {
        let kind = if failure.transient { "will retry" } else { "rejected" };
        lines.push(format!(
            "  {} {} {} {kind}: {}",
            short_id(&failure.operation_id.to_string()),
            failure.operation_kind,
            failure.entity_id,
            failure.error
        ));
    }
    if report.deferred > 0 {
        lines.push(format!("{} operation(s) deferred", report.deferred));
    }
    if !report.fetch_failed.is_empty() {
        let kinds = report
            .fetch_failed
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        lines.push(format!("Could not refresh: {kinds}"));
    }
    lines
}
