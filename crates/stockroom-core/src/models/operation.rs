//! Pending operation model

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::conflict::ConflictId;
use super::entity::{validate_patch, Entity, EntityKind, Row};
use crate::error::Result;

/// A unique identifier for a queued operation, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(Uuid);

impl OperationId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OperationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s.trim())?))
    }
}

/// Mutation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Predicate a remote write must match before it applies.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum WriteGuard {
    /// Apply to whatever row carries the id
    #[default]
    Unguarded,
    /// The row must still carry this `updated_at`
    UpdatedAt(DateTime<Utc>),
    /// The row must still hold these field values
    Fields(Row),
}

impl WriteGuard {
    pub const fn is_guarded(&self) -> bool {
        !matches!(self, Self::Unguarded)
    }
}

/// A mutation awaiting confirmed application to the remote store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    pub id: OperationId,
    pub entity_type: EntityKind,
    pub operation_kind: OperationKind,
    pub entity_id: String,
    /// Full row for creates, field patch for updates, absent for deletes
    #[serde(default)]
    pub payload: Option<Row>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    /// `updated_at` of the cached copy the mutation was made against
    #[serde(default)]
    pub base_updated_at: Option<DateTime<Utc>>,
    /// Prior values of the touched fields, kept when the cached copy had no
    /// `updated_at` to guard on
    #[serde(default)]
    pub base_values: Option<Row>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Conflict that superseded this operation, if any
    #[serde(default)]
    pub blocked_by: Option<ConflictId>,
}

impl PendingOperation {
    fn new(
        entity_type: EntityKind,
        operation_kind: OperationKind,
        entity_id: String,
        payload: Option<Row>,
        base_updated_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: OperationId::new(),
            entity_type,
            operation_kind,
            entity_id,
            payload,
            created_at: Utc::now(),
            retry_count: 0,
            base_updated_at,
            base_values: None,
            last_error: None,
            blocked_by: None,
        }
    }

    /// Queue the creation of `entity`.
    pub fn create(entity: &Entity) -> Result<Self> {
        Ok(Self::new(
            entity.kind(),
            OperationKind::Create,
            entity.id().to_string(),
            Some(entity.to_row()?),
            None,
        ))
    }

    /// Queue a field patch against the cached copy last seen at `base_updated_at`.
    pub fn update(
        kind: EntityKind,
        entity_id: impl Into<String>,
        patch: Row,
        base_updated_at: Option<DateTime<Utc>>,
    ) -> Result<Self> {
        validate_patch(kind, &patch)?;
        Ok(Self::new(
            kind,
            OperationKind::Update,
            entity_id.into(),
            Some(patch),
            base_updated_at,
        ))
    }

    pub fn delete(
        kind: EntityKind,
        entity_id: impl Into<String>,
        base_updated_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self::new(
            kind,
            OperationKind::Delete,
            entity_id.into(),
            None,
            base_updated_at,
        )
    }

    #[must_use]
    pub fn with_base_values(mut self, values: Row) -> Self {
        self.base_values = Some(values);
        self
    }

    /// Guard for replaying this operation: the base `updated_at` when known,
    /// otherwise the recorded prior field values.
    pub fn guard(&self) -> WriteGuard {
        match (self.base_updated_at, &self.base_values) {
            (Some(updated_at), _) => WriteGuard::UpdatedAt(updated_at),
            (None, Some(values)) if !values.is_empty() => WriteGuard::Fields(values.clone()),
            _ => WriteGuard::Unguarded,
        }
    }

    /// `(kind, id)` of the entity this operation targets
    pub fn target(&self) -> (EntityKind, &str) {
        (self.entity_type, &self.entity_id)
    }

    pub fn targets(&self, kind: EntityKind, entity_id: &str) -> bool {
        self.entity_type == kind && self.entity_id == entity_id
    }

    pub const fn is_blocked(&self) -> bool {
        self.blocked_by.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Meter;
    use serde_json::json;

    #[test]
    fn operation_id_parse_roundtrip() {
        let id = OperationId::new();
        let parsed: OperationId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn update_rejects_undeclared_fields() {
        let patch = json!({"colour": "red"}).as_object().cloned().unwrap();
        assert!(PendingOperation::update(EntityKind::Meter, "meter-1", patch, None).is_err());
    }

    #[test]
    fn create_carries_full_row() {
        let entity = Entity::Meter(Meter {
            id: "meter-1".to_string(),
            serial_number: "SN-1".to_string(),
            ..Meter::default()
        });
        let op = PendingOperation::create(&entity).unwrap();
        assert_eq!(op.operation_kind, OperationKind::Create);
        assert_eq!(op.entity_id, "meter-1");
        assert_eq!(op.payload.unwrap()["serial_number"], json!("SN-1"));
    }

    #[test]
    fn serializes_with_camel_case_layout() {
        let op = PendingOperation::delete(EntityKind::Sale, "sale-9", None);
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["entityType"], json!("sale"));
        assert_eq!(value["operationKind"], json!("delete"));
        assert_eq!(value["entityId"], json!("sale-9"));
        assert_eq!(value["retryCount"], json!(0));
        assert!(value.get("createdAt").is_some());
    }

    #[test]
    fn guard_prefers_updated_at_over_field_values() {
        let values = json!({"phone": "555-0000"}).as_object().cloned().unwrap();
        let unstamped = PendingOperation::delete(EntityKind::Customer, "customer-7", None)
            .with_base_values(values.clone());
        assert_eq!(unstamped.guard(), WriteGuard::Fields(values.clone()));

        let at = Utc::now();
        let stamped =
            PendingOperation::delete(EntityKind::Customer, "customer-7", Some(at)).with_base_values(values);
        assert_eq!(stamped.guard(), WriteGuard::UpdatedAt(at));

        let bare = PendingOperation::delete(EntityKind::Customer, "customer-7", None);
        assert!(!bare.guard().is_guarded());
    }
}
