//! In-process remote store for tests and local development.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{ConflictSignal, RemoteError, RemoteResult, RemoteStore};
use crate::models::{Entity, Row, WriteGuard};

#[derive(Debug)]
struct MemoryState {
    tables: BTreeMap<String, Vec<Row>>,
    reachable: bool,
    latency: Duration,
    write_failure: Option<RemoteError>,
}

/// Shared, cloneable in-memory table store.
///
/// Clones observe the same tables, so a test can keep a handle while the
/// engine owns another.
#[derive(Debug, Clone)]
pub struct MemoryRemoteStore {
    state: Arc<Mutex<MemoryState>>,
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                tables: BTreeMap::new(),
                reachable: true,
                latency: Duration::ZERO,
                write_failure: None,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulate losing or regaining connectivity.
    pub fn set_reachable(&self, reachable: bool) {
        self.state().reachable = reachable;
    }

    /// Delay applied before every call.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Make every write fail with `error` until cleared with `None`.
    pub fn fail_writes_with(&self, error: Option<RemoteError>) {
        self.state().write_failure = error;
    }

    /// Store `entity` directly, bypassing guards.
    pub fn put(&self, entity: &Entity) -> crate::Result<()> {
        let row = entity.to_row()?;
        let mut state = self.state();
        let table = state
            .tables
            .entry(entity.kind().table().to_string())
            .or_default();
        replace_or_push(table, row);
        Ok(())
    }

    /// Remove a row directly; returns whether it existed.
    pub fn remove(&self, table: &str, id: &str) -> bool {
        let mut state = self.state();
        let Some(rows) = state.tables.get_mut(table) else {
            return false;
        };
        let before = rows.len();
        rows.retain(|row| row_id(row) != Some(id));
        rows.len() != before
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.state().tables.get(table).cloned().unwrap_or_default()
    }

    pub fn row(&self, table: &str, id: &str) -> Option<Row> {
        self.state()
            .tables
            .get(table)
            .and_then(|rows| rows.iter().find(|row| row_id(row) == Some(id)).cloned())
    }

    async fn enter(&self) -> RemoteResult<()> {
        let latency = self.state().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.state().reachable {
            Ok(())
        } else {
            Err(RemoteError::Transient("remote unreachable".to_string()))
        }
    }

    async fn enter_write(&self) -> RemoteResult<()> {
        self.enter().await?;
        match self.state().write_failure.clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

fn row_id(row: &Row) -> Option<&str> {
    row.get("id").and_then(Value::as_str)
}

fn row_updated_at(row: &Row) -> Option<DateTime<Utc>> {
    row.get("updated_at")
        .cloned()
        .and_then(|value| serde_json::from_value(value).ok())
}

fn replace_or_push(rows: &mut Vec<Row>, row: Row) {
    let id = row_id(&row).map(str::to_string);
    if let Some(existing) = rows.iter_mut().find(|r| row_id(r).map(str::to_string) == id) {
        *existing = row;
    } else {
        rows.push(row);
    }
}

/// Numbers compare by value so `250` and `250.0` match.
fn same_value(stored: Option<&Value>, expected: &Value) -> bool {
    match (stored.unwrap_or(&Value::Null), expected) {
        (Value::Number(left), Value::Number(right)) => left.as_f64() == right.as_f64(),
        (left, right) => left == right,
    }
}

/// Locate `id` and check the guard, mirroring a filtered write that matches
/// zero rows.
fn guarded_position(rows: &[Row], id: &str, guard: &WriteGuard) -> RemoteResult<usize> {
    let position = rows
        .iter()
        .position(|row| row_id(row) == Some(id))
        .ok_or(RemoteError::Conflict(ConflictSignal::NoMatchingRow))?;

    let row = &rows[position];
    let matches = match guard {
        WriteGuard::Unguarded => true,
        WriteGuard::UpdatedAt(expected) => row_updated_at(row) == Some(*expected),
        WriteGuard::Fields(expected) => expected
            .iter()
            .all(|(field, value)| same_value(row.get(field), value)),
    };
    if !matches {
        return Err(RemoteError::Conflict(ConflictSignal::StalePredicate));
    }
    Ok(position)
}

impl RemoteStore for MemoryRemoteStore {
    async fn ping(&self) -> RemoteResult<()> {
        self.enter().await
    }

    async fn select_all(&self, table: &str) -> RemoteResult<Vec<Row>> {
        self.enter().await?;
        Ok(self.rows(table))
    }

    async fn select_by_id(&self, table: &str, id: &str) -> RemoteResult<Option<Row>> {
        self.enter().await?;
        Ok(self.row(table, id))
    }

    async fn insert(&self, table: &str, row: &Row) -> RemoteResult<Row> {
        self.enter_write().await?;
        let id = row_id(row)
            .ok_or_else(|| RemoteError::Rejected {
                status: 400,
                message: "row is missing an id".to_string(),
            })?
            .to_string();

        let mut state = self.state();
        let rows = state.tables.entry(table.to_string()).or_default();
        if rows.iter().any(|existing| row_id(existing) == Some(id.as_str())) {
            return Err(RemoteError::Conflict(ConflictSignal::DuplicateKey));
        }
        rows.push(row.clone());
        Ok(row.clone())
    }

    async fn update(
        &self,
        table: &str,
        id: &str,
        patch: &Row,
        guard: &WriteGuard,
    ) -> RemoteResult<Row> {
        self.enter_write().await?;
        let mut state = self.state();
        let rows = state.tables.entry(table.to_string()).or_default();
        let position = guarded_position(rows, id, guard)?;

        let row = &mut rows[position];
        for (field, value) in patch {
            row.insert(field.clone(), value.clone());
        }
        Ok(row.clone())
    }

    async fn delete(
        &self,
        table: &str,
        id: &str,
        guard: &WriteGuard,
    ) -> RemoteResult<()> {
        self.enter_write().await?;
        let mut state = self.state();
        let rows = state.tables.entry(table.to_string()).or_default();
        let position = guarded_position(rows, id, guard)?;
        rows.remove(position);
        Ok(())
    }

    async fn upsert(&self, table: &str, row: &Row) -> RemoteResult<Row> {
        self.enter_write().await?;
        if row_id(row).is_none() {
            return Err(RemoteError::Rejected {
                status: 400,
                message: "row is missing an id".to_string(),
            });
        }
        let mut state = self.state();
        let rows = state.tables.entry(table.to_string()).or_default();
        replace_or_push(rows, row.clone());
        Ok(row.clone())
    }
}
