//! Sync conflict model and the persisted conflict history

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::entity::{Entity, EntityKind};
use super::operation::OperationId;
use crate::error::{Error, Result};

/// Schema tag written alongside the persisted conflict history.
pub const HISTORY_SCHEMA_VERSION: u32 = 1;

/// A unique identifier for a conflict, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConflictId(Uuid);

impl ConflictId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ConflictId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConflictId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s.trim())?))
    }
}

/// Classification of a divergence between client and server copies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictType {
    /// Reserved for a finer-grained concurrent field-edit detector; never
    /// produced by detection today.
    Update,
    /// One side no longer has the record
    Delete,
    /// Both sides present, `updated_at` disagrees
    Version,
    /// Field values differ without a usable version signal
    Data,
}

impl ConflictType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Version => "version",
            Self::Data => "data",
        }
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a conflict was (or may be) settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionStrategy {
    /// Remote copy wins
    Server,
    /// Local copy wins
    Client,
    /// Field-level combination of both copies
    Merge,
    /// User-edited combination
    Manual,
}

impl ResolutionStrategy {
    pub const ALL: [Self; 4] = [Self::Server, Self::Client, Self::Merge, Self::Manual];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Client => "client",
            Self::Merge => "merge",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "server" => Ok(Self::Server),
            "client" => Ok(Self::Client),
            "merge" => Ok(Self::Merge),
            "manual" => Ok(Self::Manual),
            other => Err(Error::InvalidInput(format!(
                "unknown resolution strategy '{other}'"
            ))),
        }
    }
}

/// A detected divergence for one entity instance.
///
/// `server_data` and `client_data` are snapshots taken at detection time and
/// are never rewritten. `None` means that side no longer has the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub id: ConflictId,
    pub entity: EntityKind,
    pub entity_id: String,
    #[serde(rename = "type")]
    pub conflict_type: ConflictType,
    pub server_data: Option<Entity>,
    pub client_data: Option<Entity>,
    pub created_at: DateTime<Utc>,
    pub resolved: bool,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolution: Option<ResolutionStrategy>,
    /// Value committed by the resolution; `None` with `resolved` means deletion
    #[serde(default)]
    pub resolved_data: Option<Entity>,
    /// Queued operation whose replay surfaced this conflict
    #[serde(default)]
    pub operation_id: Option<OperationId>,
}

impl Conflict {
    /// Create an unresolved conflict from detection snapshots.
    pub fn new(
        entity: EntityKind,
        entity_id: impl Into<String>,
        conflict_type: ConflictType,
        client_data: Option<Entity>,
        server_data: Option<Entity>,
    ) -> Self {
        Self {
            id: ConflictId::new(),
            entity,
            entity_id: entity_id.into(),
            conflict_type,
            server_data,
            client_data,
            created_at: Utc::now(),
            resolved: false,
            resolved_at: None,
            resolution: None,
            resolved_data: None,
            operation_id: None,
        }
    }

    #[must_use]
    pub const fn with_operation(mut self, operation_id: OperationId) -> Self {
        self.operation_id = Some(operation_id);
        self
    }

    pub fn concerns(&self, kind: EntityKind, entity_id: &str) -> bool {
        self.entity == kind && self.entity_id == entity_id
    }

    /// Transition `Unresolved -> Resolved`. Fails if already resolved.
    pub fn mark_resolved(
        &mut self,
        strategy: ResolutionStrategy,
        resolved_data: Option<Entity>,
    ) -> Result<()> {
        if self.resolved {
            return Err(Error::Resolution(format!(
                "conflict {} is already resolved",
                self.id
            )));
        }
        self.resolved = true;
        self.resolved_at = Some(Utc::now());
        self.resolution = Some(strategy);
        self.resolved_data = resolved_data;
        Ok(())
    }
}

/// Append-only log of every detected conflict, persisted as one object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictHistory {
    #[serde(default)]
    pub conflicts: Vec<Conflict>,
    #[serde(default = "default_history_version")]
    pub version: u32,
}

const fn default_history_version() -> u32 {
    HISTORY_SCHEMA_VERSION
}

impl Default for ConflictHistory {
    fn default() -> Self {
        Self {
            conflicts: Vec::new(),
            version: HISTORY_SCHEMA_VERSION,
        }
    }
}

impl ConflictHistory {
    pub fn push(&mut self, conflict: Conflict) {
        self.conflicts.push(conflict);
    }

    pub fn find(&self, id: ConflictId) -> Option<&Conflict> {
        self.conflicts.iter().find(|conflict| conflict.id == id)
    }

    pub fn find_mut(&mut self, id: ConflictId) -> Option<&mut Conflict> {
        self.conflicts.iter_mut().find(|conflict| conflict.id == id)
    }

    /// Unresolved conflicts in insertion order.
    pub fn unresolved(&self) -> impl Iterator<Item = &Conflict> {
        self.conflicts.iter().filter(|conflict| !conflict.resolved)
    }

    pub fn has_unresolved_for(&self, kind: EntityKind, entity_id: &str) -> bool {
        self.unresolved()
            .any(|conflict| conflict.concerns(kind, entity_id))
    }

    pub fn len(&self) -> usize {
        self.conflicts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Conflict {
        Conflict::new(EntityKind::Meter, "meter-1", ConflictType::Delete, None, None)
    }

    #[test]
    fn mark_resolved_sets_resolution_once() {
        let mut conflict = sample();
        assert!(conflict.resolution.is_none());

        conflict
            .mark_resolved(ResolutionStrategy::Server, None)
            .unwrap();
        assert!(conflict.resolved);
        assert!(conflict.resolved_at.is_some());
        assert_eq!(conflict.resolution, Some(ResolutionStrategy::Server));

        let second = conflict.mark_resolved(ResolutionStrategy::Client, None);
        assert!(second.is_err());
        assert_eq!(conflict.resolution, Some(ResolutionStrategy::Server));
    }

    #[test]
    fn history_filters_unresolved_in_order() {
        let mut history = ConflictHistory::default();
        let first = sample();
        let mut second = sample();
        second
            .mark_resolved(ResolutionStrategy::Client, None)
            .unwrap();
        let third = Conflict::new(EntityKind::Sale, "sale-1", ConflictType::Data, None, None);

        history.push(first.clone());
        history.push(second);
        history.push(third.clone());

        let ids: Vec<_> = history.unresolved().map(|c| c.id).collect();
        assert_eq!(ids, vec![first.id, third.id]);
        assert!(history.has_unresolved_for(EntityKind::Meter, "meter-1"));
        assert!(!history.has_unresolved_for(EntityKind::Meter, "meter-2"));
    }

    #[test]
    fn conflict_serializes_type_field() {
        let value = serde_json::to_value(sample()).unwrap();
        assert_eq!(value["type"], json!("delete"));
        assert_eq!(value["entity"], json!("meter"));
        assert_eq!(value["entityId"], json!("meter-1"));
    }

    #[test]
    fn history_defaults_missing_version() {
        let history: ConflictHistory = serde_json::from_str(r#"{"conflicts": []}"#).unwrap();
        assert_eq!(history.version, HISTORY_SCHEMA_VERSION);
    }
}
