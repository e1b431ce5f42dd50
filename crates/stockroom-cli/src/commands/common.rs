use std::env;
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use stockroom_core::config::{EngineConfig, RemoteConfig};
use stockroom_core::models::{ConflictId, OperationId, Row, WriteGuard};
use stockroom_core::remote::{RemoteError, RemoteResult, RemoteStore, RestRemoteStore};
use stockroom_core::services::LocalStore;
use stockroom_core::{Conflict, Entity, PendingOperation, SyncEngine};

use crate::error::CliError;

/// Remote used by the CLI: the REST store when configured, otherwise a
/// placeholder that always reports the remote as unreachable.
pub enum CliRemote {
    Rest(RestRemoteStore),
    Unconfigured,
}

impl CliRemote {
    pub const fn is_configured(&self) -> bool {
        matches!(self, Self::Rest(_))
    }

    fn unconfigured() -> RemoteError {
        RemoteError::Transient("remote store is not configured".to_string())
    }
}

impl RemoteStore for CliRemote {
    async fn ping(&self) -> RemoteResult<()> {
        match self {
            Self::Rest(remote) => remote.ping().await,
            Self::Unconfigured => Err(Self::unconfigured()),
        }
    }

    async fn select_all(&self, table: &str) -> RemoteResult<Vec<Row>> {
        match self {
            Self::Rest(remote) => remote.select_all(table).await,
            Self::Unconfigured => Err(Self::unconfigured()),
        }
    }

    async fn select_by_id(&self, table: &str, id: &str) -> RemoteResult<Option<Row>> {
        match self {
            Self::Rest(remote) => remote.select_by_id(table, id).await,
            Self::Unconfigured => Err(Self::unconfigured()),
        }
    }

    async fn insert(&self, table: &str, row: &Row) -> RemoteResult<Row> {
        match self {
            Self::Rest(remote) => remote.insert(table, row).await,
            Self::Unconfigured => Err(Self::unconfigured()),
        }
    }

    async fn update(
        &self,
        table: &str,
        id: &str,
        patch: &Row,
        guard: &WriteGuard,
    ) -> RemoteResult<Row> {
        match self {
            Self::Rest(remote) => remote.update(table, id, patch, guard).await,
            Self::Unconfigured => Err(Self::unconfigured()),
        }
    }

    async fn delete(
        &self,
        table: &str,
        id: &str,
        guard: &WriteGuard,
    ) -> RemoteResult<()> {
        match self {
            Self::Rest(remote) => remote.delete(table, id, guard).await,
            Self::Unconfigured => Err(Self::unconfigured()),
        }
    }

    async fn upsert(&self, table: &str, row: &Row) -> RemoteResult<Row> {
        match self {
            Self::Rest(remote) => remote.upsert(table, row).await,
            Self::Unconfigured => Err(Self::unconfigured()),
        }
    }
}

pub type CliEngine = SyncEngine<CliRemote>;

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("STOCKROOM_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("stockroom")
        .join("stockroom.db")
}

pub async fn open_engine(db_path: &Path) -> Result<CliEngine, CliError> {
    let remote = match RemoteConfig::from_env()? {
        Some(config) => {
            tracing::debug!("Using remote store at {}", config.url);
            CliRemote::Rest(RestRemoteStore::new(&config).map_err(stockroom_core::Error::from)?)
        }
        None => CliRemote::Unconfigured,
    };
    open_engine_with(db_path, remote, EngineConfig::from_env()?).await
}

pub async fn open_engine_with(
    db_path: &Path,
    remote: CliRemote,
    config: EngineConfig,
) -> Result<CliEngine, CliError> {
    let store = LocalStore::open_path(db_path).await?;
    Ok(SyncEngine::new(store, remote, config))
}

pub fn normalize_identifier(id: &str) -> Result<String, CliError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        Err(CliError::EmptyIdentifier)
    } else {
        Ok(trimmed.to_string())
    }
}

/// JSON object from the argument, or from piped stdin when the argument is absent.
pub fn resolve_json_object(data: Option<&str>) -> Result<Row, CliError> {
    let raw = match data.and_then(normalize_content) {
        Some(raw) => raw,
        None => read_piped_stdin()?.ok_or(CliError::EmptyData)?,
    };
    parse_json_object(&raw)
}

pub fn parse_json_object(raw: &str) -> Result<Row, CliError> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(row)) => Ok(row),
        Ok(other) => Err(CliError::InvalidData(format!("got {other}"))),
        Err(error) => Err(CliError::InvalidData(error.to_string())),
    }
}

pub fn normalize_content(content: &str) -> Option<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn read_piped_stdin() -> Result<Option<String>, CliError> {
    let stdin = io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }

    let mut buffer = String::new();
    stdin.lock().read_to_string(&mut buffer)?;
    Ok(normalize_content(&buffer))
}

/// Open `$VISUAL`/`$EDITOR` on `initial_content` and return the edited text.
pub fn capture_editor_input_with_initial(
    initial_content: &str,
) -> Result<Option<String>, CliError> {
    let editor = preferred_editor();
    let temp_file = create_temp_file_path();
    std::fs::write(&temp_file, initial_content)?;

    let launch_result = launch_editor(&editor, &temp_file);
    let edited = std::fs::read_to_string(&temp_file)?;
    let _ = std::fs::remove_file(&temp_file);

    launch_result?;
    Ok(normalize_content(&edited))
}

pub fn launch_editor(editor: &str, file_path: &Path) -> Result<(), CliError> {
    match Command::new(editor).arg(file_path).status() {
        Ok(status) => {
            if status.success() {
                Ok(())
            } else {
                Err(CliError::EditorFailed(format!(
                    "`{editor}` exited with status {status}"
                )))
            }
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            let mut parts = editor.split_whitespace();
            let Some(program) = parts.next() else {
                return Err(CliError::EditorFailed("empty EDITOR command".into()));
            };

            let mut command = Command::new(program);
            command.args(parts).arg(file_path);

            let status = command.status()?;
            if status.success() {
                Ok(())
            } else {
                Err(CliError::EditorFailed(format!(
                    "`{editor}` exited with status {status}"
                )))
            }
        }
        Err(err) => Err(CliError::Io(err)),
    }
}

pub fn preferred_editor() -> String {
    env::var("VISUAL")
        .or_else(|_| env::var("EDITOR"))
        .unwrap_or_else(|_| default_editor().to_string())
}

pub const fn default_editor() -> &'static str {
    if cfg!(windows) {
        "notepad"
    } else {
        "vi"
    }
}

fn create_temp_file_path() -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_nanos());
    env::temp_dir().join(format!("stockroom-resolve-{}-{now}.json", std::process::id()))
}

/// Find a conflict by full id or unique id prefix.
pub fn find_conflict<'a>(conflicts: &'a [Conflict], query: &str) -> Result<&'a Conflict, CliError> {
    if let Ok(id) = query.parse::<ConflictId>() {
        if let Some(conflict) = conflicts.iter().find(|conflict| conflict.id == id) {
            return Ok(conflict);
        }
    }

    let matches: Vec<&Conflict> = conflicts
        .iter()
        .filter(|conflict| conflict.id.to_string().starts_with(query))
        .collect();
    match matches.as_slice() {
        [] => Err(CliError::ConflictNotFound(query.to_string())),
        [conflict] => Ok(*conflict),
        several => Err(CliError::AmbiguousId(format!(
            "ID prefix '{query}' is ambiguous; matches: {}",
            short_ids(several.iter().map(|conflict| conflict.id.to_string()))
        ))),
    }
}

/// Find a queued operation by full id or unique id prefix.
pub fn find_operation<'a>(
    operations: &'a [PendingOperation],
    query: &str,
) -> Result<&'a PendingOperation, CliError> {
    if let Ok(id) = query.parse::<OperationId>() {
        if let Some(operation) = operations.iter().find(|operation| operation.id == id) {
            return Ok(operation);
        }
    }

    let matches: Vec<&PendingOperation> = operations
        .iter()
        .filter(|operation| operation.id.to_string().starts_with(query))
        .collect();
    match matches.as_slice() {
        [] => Err(CliError::OperationNotFound(query.to_string())),
        [operation] => Ok(*operation),
        several => Err(CliError::AmbiguousId(format!(
            "ID prefix '{query}' is ambiguous; matches: {}",
            short_ids(several.iter().map(|operation| operation.id.to_string()))
        ))),
    }
}

fn short_ids(ids: impl Iterator<Item = String>) -> String {
    ids.take(3)
        .map(|id| short_id(&id))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn short_id(id: &str) -> String {
    id.chars().take(13).collect()
}

pub fn format_relative_time(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let diff = (now - timestamp).num_milliseconds().max(0);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;
    let month = 30 * day;
    let year = 365 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else if diff < month {
        format!("{}w ago", diff / week)
    } else if diff < year {
        format!("{}mo ago", diff / month)
    } else {
        format!("{}y ago", diff / year)
    }
}

pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

/// Short human label for a record: its most descriptive field.
pub fn entity_label(entity: &Entity) -> String {
    let label = match entity {
        Entity::Product(product) => Some(product.name.clone()),
        Entity::Meter(meter) => Some(meter.serial_number.clone()),
        Entity::Customer(customer) => Some(customer.name.clone()),
        Entity::Sale(sale) => sale.amount.map(|amount| format!("{amount:.2}")),
    };
    label
        .and_then(|label| normalize_content(&label))
        .unwrap_or_else(|| "-".to_string())
}

pub fn format_entity_lines(entities: &[Entity]) -> Vec<String> {
    let now = Utc::now();
    entities
        .iter()
        .map(|entity| {
            let updated = entity
                .updated_at()
                .map_or_else(|| "-".to_string(), |at| format_relative_time(at, now));
            format!("{:<36}  {:<32}  {updated}", entity.id(), entity_label(entity))
        })
        .collect()
}

#[derive(Debug, Serialize)]
pub struct OperationListItem {
    pub id: String,
    pub entity: String,
    pub entity_id: String,
    pub operation: String,
    pub created_at: String,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub blocked_by: Option<String>,
}

pub fn operation_to_list_item(operation: &PendingOperation) -> OperationListItem {
    OperationListItem {
        id: operation.id.to_string(),
        entity: operation.entity_type.to_string(),
        entity_id: operation.entity_id.clone(),
        operation: operation.operation_kind.to_string(),
        created_at: operation.created_at.to_rfc3339(),
        retry_count: operation.retry_count,
        last_error: operation.last_error.clone(),
        blocked_by: operation.blocked_by.map(|id| id.to_string()),
    }
}

pub fn format_operation_lines(operations: &[PendingOperation]) -> Vec<String> {
    let now = Utc::now();
    operations
        .iter()
        .map(|operation| {
            let id = short_id(&operation.id.to_string());
            let state = match (operation.blocked_by, operation.retry_count) {
                (Some(conflict), _) => format!("blocked by {}", short_id(&conflict.to_string())),
                (None, 0) => "pending".to_string(),
                (None, retries) => format!("failed x{retries}"),
            };
            format!(
                "{id:<13}  {:<6}  {:<8} {:<36}  {:<10}  {state}",
                operation.operation_kind,
                operation.entity_type,
                operation.entity_id,
                format_relative_time(operation.created_at, now)
            )
        })
        .collect()
}

pub fn format_conflict_lines(conflicts: &[Conflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            let id = short_id(&conflict.id.to_string());
            let state = match conflict.resolution {
                Some(strategy) => format!("resolved ({strategy})"),
                None => "unresolved".to_string(),
            };
            format!(
                "{id:<13}  {}  {:<7}  {}={}  {state}",
                format_timestamp(conflict.created_at),
                conflict.conflict_type,
                conflict.entity,
                conflict.entity_id
            )
        })
        .collect()
}
