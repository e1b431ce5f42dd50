use std::path::Path;

use serde::Serialize;
use serde_json::Value;
use stockroom_core::conflict::{merge_objects, resolution_options};
use stockroom_core::{Conflict, Entity, ResolutionStrategy};

use crate::commands::common::{
    capture_editor_input_with_initial, find_conflict, format_conflict_lines, format_timestamp,
    open_engine, parse_json_object,
};
use crate::error::CliError;

/// Both sides of a conflict plus what each strategy would produce.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictDetail<'a> {
    #[serde(flatten)]
    pub conflict: &'a Conflict,
    pub options: Vec<ResolutionStrategy>,
    pub merge_candidate: Option<Value>,
}

pub async fn run_conflicts_list(
    include_resolved: bool,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let engine = open_engine(db_path).await?;
    let conflicts: Vec<Conflict> = if include_resolved {
        engine.load_conflict_history().await.conflicts
    } else {
        engine.unresolved_conflicts().await
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&conflicts)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No conflicts recorded.");
        return Ok(());
    }
    for line in format_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_conflicts_show(id: &str, as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let engine = open_engine(db_path).await?;
    let history = engine.load_conflict_history().await;
    let conflict = find_conflict(&history.conflicts, id.trim())?;

    let detail = ConflictDetail {
        conflict,
        options: resolution_options(conflict),
        merge_candidate: merge_candidate(conflict)
            .map(|entity| entity.to_row().map(Value::Object))
            .transpose()?,
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&detail)?);
        return Ok(());
    }

    for line in format_conflict_detail(&detail)? {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_resolve(
    id: &str,
    strategy: ResolutionStrategy,
    data: Option<&str>,
    db_path: &Path,
) -> Result<(), CliError> {
    let engine = open_engine(db_path).await?;
    let history = engine.load_conflict_history().await;
    let conflict = find_conflict(&history.conflicts, id.trim())?;
    if conflict.resolved {
        return Err(CliError::AlreadyResolved(conflict.id.to_string()));
    }

    let resolved_data = match (strategy, data) {
        (_, Some(raw)) => Some(parse_resolved_data(conflict, raw)?),
        (ResolutionStrategy::Manual, None) => Some(edit_resolution(conflict)?),
        (_, None) => None,
    };

    if engine
        .resolve_conflict(conflict.id, strategy, resolved_data)
        .await?
    {
        println!(
            "Resolved {} conflict on {} {} with {strategy}",
            conflict.conflict_type, conflict.entity, conflict.entity_id
        );
        Ok(())
    } else {
        Err(CliError::AlreadyResolved(conflict.id.to_string()))
    }
}

fn parse_resolved_data(conflict: &Conflict, raw: &str) -> Result<Entity, CliError> {
    let mut row = parse_json_object(raw)?;
    row.insert("id".to_string(), Value::String(conflict.entity_id.clone()));
    Ok(Entity::from_row(conflict.entity, row)?)
}

/// Prefill the editor with the merge candidate, falling back to whichever
/// side exists.
fn edit_resolution(conflict: &Conflict) -> Result<Entity, CliError> {
    let initial = match merge_candidate(conflict)
        .or_else(|| conflict.client_data.clone())
        .or_else(|| conflict.server_data.clone())
    {
        Some(entity) => serde_json::to_string_pretty(&entity.to_row()?)?,
        None => "{}".to_string(),
    };

    let edited = capture_editor_input_with_initial(&initial)?.ok_or(CliError::EmptyData)?;
    parse_resolved_data(conflict, &edited)
}

fn merge_candidate(conflict: &Conflict) -> Option<Entity> {
    match (&conflict.client_data, &conflict.server_data) {
        (Some(client), Some(server)) => merge_objects(client, server).ok(),
        _ => None,
    }
}

fn format_conflict_detail(detail: &ConflictDetail<'_>) -> Result<Vec<String>, CliError> {
    let conflict = detail.conflict;
    let mut lines = vec![
        format!("Conflict:  {}", conflict.id),
        format!("Entity:    {} {}", conflict.entity, conflict.entity_id),
        format!("Type:      {}", conflict.conflict_type),
        format!("Detected:  {}", format_timestamp(conflict.created_at)),
    ];
    match (conflict.resolution, conflict.resolved_at) {
        (Some(strategy), Some(at)) => {
            lines.push(format!("Resolved:  {strategy} at {}", format_timestamp(at)));
        }
        _ => {
            let options = detail
                .options
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            lines.push(format!("Options:   {options}"));
        }
    }

    lines.push(String::new());
    lines.push("Local:".to_string());
    lines.push(render_side(conflict.client_data.as_ref())?);
    lines.push("Remote:".to_string());
    lines.push(render_side(conflict.server_data.as_ref())?);
    if let Some(candidate) = &detail.merge_candidate {
        lines.push("Merged:".to_string());
        lines.push(serde_json::to_string_pretty(candidate)?);
    }
    Ok(lines)
}

fn render_side(entity: Option<&Entity>) -> Result<String, CliError> {
    match entity {
        Some(entity) => Ok(serde_json::to_string_pretty(&entity.to_row()?)?),
        None => Ok("(deleted)".to_string()),
    }
}
