//! Outcome of a sync run

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{ConflictId, EntityKind, OperationId, OperationKind};

/// Why `sync_data` returned without doing anything
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Offline,
    AlreadySyncing,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    Skipped { reason: SkipReason },
    Completed(SyncReport),
}

impl SyncOutcome {
    pub const fn report(&self) -> Option<&SyncReport> {
        match self {
            Self::Completed(report) => Some(report),
            Self::Skipped { .. } => None,
        }
    }
}

/// A queued operation that could not be applied this run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedOperation {
    pub operation_id: OperationId,
    pub entity: EntityKind,
    pub entity_id: String,
    pub operation_kind: OperationKind,
    pub error: String,
    /// Network or server outage rather than a rejection
    pub transient: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    /// Operations confirmed by the remote and removed from the queue
    pub applied: usize,
    /// Conflicts recorded during the drain
    pub conflicts: Vec<ConflictId>,
    pub failed: Vec<FailedOperation>,
    /// Operations held back because an earlier one for the same entity did not apply
    pub deferred: usize,
    pub refreshed: Vec<EntityKind>,
    pub fetch_failed: Vec<EntityKind>,
    pub finished_at: DateTime<Utc>,
}

impl Default for SyncReport {
    fn default() -> Self {
        Self {
            applied: 0,
            conflicts: Vec::new(),
            failed: Vec::new(),
            deferred: 0,
            refreshed: Vec::new(),
            fetch_failed: Vec::new(),
            finished_at: Utc::now(),
        }
    }
}

impl SyncReport {
    /// Nothing failed and nothing new needs attention.
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty() && self.failed.is_empty() && self.fetch_failed.is_empty()
    }
}
