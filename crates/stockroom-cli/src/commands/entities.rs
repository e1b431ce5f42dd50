use std::path::Path;

use stockroom_core::{Entity, EntityKind};

use crate::commands::common::{
    format_entity_lines, normalize_identifier, open_engine, resolve_json_object,
};
use crate::error::CliError;

pub async fn run_list(kind: EntityKind, as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let engine = open_engine(db_path).await?;
    let entities = engine.store().load_entities(kind).await?;

    if as_json {
        let rows = entities
            .iter()
            .map(Entity::to_row)
            .collect::<stockroom_core::Result<Vec<_>>>()?;
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else if entities.is_empty() {
        println!("No cached {kind} records.");
    } else {
        for line in format_entity_lines(&entities) {
            println!("{line}");
        }
    }
    Ok(())
}

pub async fn run_put(kind: EntityKind, data: Option<&str>, db_path: &Path) -> Result<(), CliError> {
    let mut row = resolve_json_object(data)?;
    let id = match row.get("id").and_then(|id| id.as_str()) {
        Some(id) => normalize_identifier(id)?,
        None => return Err(CliError::EmptyIdentifier),
    };
    row.insert("id".to_string(), id.into());

    let entity = Entity::from_row(kind, row)?;
    let engine = open_engine(db_path).await?;
    let created = engine.create(entity).await?;
    println!("Queued create of {kind} {}", created.id());
    Ok(())
}

pub async fn run_patch(
    kind: EntityKind,
    id: &str,
    data: Option<&str>,
    db_path: &Path,
) -> Result<(), CliError> {
    let id = normalize_identifier(id)?;
    let mut patch = resolve_json_object(data)?;
    patch.remove("id");
    if patch.is_empty() {
        return Err(CliError::EmptyData);
    }

    let engine = open_engine(db_path).await?;
    let updated = engine.update(kind, &id, patch).await?;
    println!("Queued update of {kind} {}", updated.id());
    Ok(())
}

pub async fn run_delete(kind: EntityKind, id: &str, db_path: &Path) -> Result<(), CliError> {
    let id = normalize_identifier(id)?;
    let engine = open_engine(db_path).await?;
    engine.delete(kind, &id).await?;
    println!("Deleted {kind} {id}");
    Ok(())
}
