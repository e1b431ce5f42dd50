use std::path::Path;

use crate::commands::common::{
    find_operation, format_operation_lines, open_engine, operation_to_list_item,
    OperationListItem,
};
use crate::error::CliError;

pub async fn run_queue_list(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let engine = open_engine(db_path).await?;
    let operations = engine.queue().operations().await?;

    if as_json {
        let json_items = operations
            .iter()
            .map(operation_to_list_item)
            .collect::<Vec<OperationListItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if operations.is_empty() {
        println!("No pending operations.");
        return Ok(());
    }
    for line in format_operation_lines(&operations) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_queue_discard(id: &str, db_path: &Path) -> Result<(), CliError> {
    let engine = open_engine(db_path).await?;
    let operations = engine.queue().operations().await?;
    let target = find_operation(&operations, id.trim())?.id;

    let discarded = engine.discard_operation(target).await?;
    println!(
        "Discarded {} of {} {}",
        discarded.operation_kind, discarded.entity_type, discarded.entity_id
    );
    Ok(())
}
