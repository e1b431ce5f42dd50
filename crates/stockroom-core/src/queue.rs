//! Pending operation queue
//!
//! Mutations made against the local cache are recorded here until the remote
//! store confirms them. The queue is persisted as one ordered list under
//! [`keys::PENDING_OPERATIONS`]; creation order is preserved on every write.

use std::collections::HashSet;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::models::{ConflictId, EntityKind, OperationId, PendingOperation};
use crate::services::{keys, LocalStore};

/// Counts shown by status displays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub blocked: usize,
    /// Unblocked operations that failed at least once
    pub failing: usize,
}

#[derive(Clone)]
pub struct PendingQueue {
    store: LocalStore,
}

impl PendingQueue {
    pub const fn new(store: LocalStore) -> Self {
        Self { store }
    }

    /// Every queued operation in creation order.
    pub async fn operations(&self) -> Result<Vec<PendingOperation>> {
        self.store.load(keys::PENDING_OPERATIONS).await
    }

    async fn save(&self, operations: &[PendingOperation]) -> Result<()> {
        self.store.save(keys::PENDING_OPERATIONS, operations).await
    }

    pub async fn enqueue(&self, operation: PendingOperation) -> Result<()> {
        let mut operations = self.operations().await?;
        tracing::debug!(
            "Queued {} of {} {} ({})",
            operation.operation_kind,
            operation.entity_type,
            operation.entity_id,
            operation.id
        );
        operations.push(operation);
        self.save(&operations).await
    }

    /// Operations eligible for replay, in creation order.
    pub async fn ready(&self) -> Result<Vec<PendingOperation>> {
        Ok(self
            .operations()
            .await?
            .into_iter()
            .filter(|operation| !operation.is_blocked())
            .collect())
    }

    pub async fn find(&self, id: OperationId) -> Result<Option<PendingOperation>> {
        Ok(self
            .operations()
            .await?
            .into_iter()
            .find(|operation| operation.id == id))
    }

    /// Drop an applied operation. Returns whether it was queued.
    pub async fn remove(&self, id: OperationId) -> Result<bool> {
        let mut operations = self.operations().await?;
        let before = operations.len();
        operations.retain(|operation| operation.id != id);
        if operations.len() == before {
            return Ok(false);
        }
        self.save(&operations).await?;
        Ok(true)
    }

    /// Count a failed replay attempt and keep the operation queued.
    pub async fn record_failure(&self, id: OperationId, error: &str) -> Result<()> {
        self.modify(id, |operation| {
            operation.retry_count = operation.retry_count.saturating_add(1);
            operation.last_error = Some(error.to_string());
        })
        .await
    }

    /// Park an operation behind the conflict its replay surfaced.
    pub async fn block(&self, id: OperationId, conflict: ConflictId) -> Result<()> {
        self.modify(id, |operation| operation.blocked_by = Some(conflict))
            .await
    }

    /// Drop every operation superseded by `conflict`. Returns how many.
    pub async fn release(&self, conflict: ConflictId) -> Result<usize> {
        let mut operations = self.operations().await?;
        let before = operations.len();
        operations.retain(|operation| operation.blocked_by != Some(conflict));
        let released = before - operations.len();
        if released > 0 {
            self.save(&operations).await?;
            tracing::debug!("Released {released} operation(s) superseded by conflict {conflict}");
        }
        Ok(released)
    }

    /// Drop every operation targeting the entity. Returns how many.
    pub async fn remove_for(&self, kind: EntityKind, entity_id: &str) -> Result<usize> {
        let mut operations = self.operations().await?;
        let before = operations.len();
        operations.retain(|operation| !operation.targets(kind, entity_id));
        let removed = before - operations.len();
        if removed > 0 {
            self.save(&operations).await?;
        }
        Ok(removed)
    }

    /// Manually abandon an operation. Unlike [`Self::remove`], an unknown id
    /// is an error.
    pub async fn discard(&self, id: OperationId) -> Result<PendingOperation> {
        let mut operations = self.operations().await?;
        let position = operations
            .iter()
            .position(|operation| operation.id == id)
            .ok_or_else(|| Error::NotFound(format!("pending operation {id}")))?;
        let discarded = operations.remove(position);
        self.save(&operations).await?;
        tracing::info!(
            "Discarded {} of {} {}",
            discarded.operation_kind,
            discarded.entity_type,
            discarded.entity_id
        );
        Ok(discarded)
    }

    /// Queued operations for the entity, blocked or not, in queue order.
    pub async fn outstanding_for(
        &self,
        kind: EntityKind,
        entity_id: &str,
    ) -> Result<Vec<PendingOperation>> {
        Ok(self
            .operations()
            .await?
            .into_iter()
            .filter(|operation| operation.targets(kind, entity_id))
            .collect())
    }

    /// Every entity with at least one queued operation, blocked or not.
    pub async fn outstanding_targets(&self) -> Result<HashSet<(EntityKind, String)>> {
        Ok(self
            .operations()
            .await?
            .into_iter()
            .map(|operation| (operation.entity_type, operation.entity_id))
            .collect())
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let operations = self.operations().await?;
        let blocked = operations.iter().filter(|op| op.is_blocked()).count();
        let failing = operations
            .iter()
            .filter(|op| !op.is_blocked() && op.retry_count > 0)
            .count();
        Ok(QueueStats {
            pending: operations.len(),
            blocked,
            failing,
        })
    }

    async fn modify(&self, id: OperationId, apply: impl FnOnce(&mut PendingOperation)) -> Result<()> {
        let mut operations = self.operations().await?;
        let operation = operations
            .iter_mut()
            .find(|operation| operation.id == id)
            .ok_or_else(|| Error::NotFound(format!("pending operation {id}")))?;
        apply(operation);
        self.save(&operations).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Entity, Sale};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn queue() -> PendingQueue {
        PendingQueue::new(LocalStore::open_in_memory().await.unwrap())
    }

    fn sale(id: &str) -> PendingOperation {
        PendingOperation::create(&Entity::Sale(Sale {
            id: id.to_string(),
            amount: Some(120.0),
            ..Sale::default()
        }))
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn operations_keep_creation_order() {
        let queue = queue().await;
        let first = sale("sale-1");
        let second = PendingOperation::delete(EntityKind::Meter, "meter-1", None);
        let third = sale("sale-2");
        for operation in [&first, &second, &third] {
            queue.enqueue(operation.clone()).await.unwrap();
        }

        let ids: Vec<_> = queue.operations().await.unwrap().iter().map(|op| op.id).collect();
        assert_eq!(ids, vec![first.id, second.id, third.id]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn record_failure_increments_retry_count() {
        let queue = queue().await;
        let operation = sale("sale-1");
        queue.enqueue(operation.clone()).await.unwrap();

        queue.record_failure(operation.id, "timeout").await.unwrap();
        queue.record_failure(operation.id, "HTTP 503").await.unwrap();

        let stored = queue.find(operation.id).await.unwrap().unwrap();
        assert_eq!(stored.retry_count, 2);
        assert_eq!(stored.last_error.as_deref(), Some("HTTP 503"));
        assert_eq!(
            queue.stats().await.unwrap(),
            QueueStats {
                pending: 1,
                blocked: 0,
                failing: 1,
            }
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn blocked_operations_are_not_ready_until_released() {
        let queue = queue().await;
        let blocked = sale("sale-1");
        let free = sale("sale-2");
        queue.enqueue(blocked.clone()).await.unwrap();
        queue.enqueue(free.clone()).await.unwrap();

        let conflict = ConflictId::new();
        queue.block(blocked.id, conflict).await.unwrap();

        let ready: Vec<_> = queue.ready().await.unwrap().iter().map(|op| op.id).collect();
        assert_eq!(ready, vec![free.id]);
        assert_eq!(
            queue.outstanding_for(EntityKind::Sale, "sale-1").await.unwrap(),
            vec![PendingOperation {
                blocked_by: Some(conflict),
                ..blocked.clone()
            }]
        );
        assert!(queue
            .outstanding_targets()
            .await
            .unwrap()
            .contains(&(EntityKind::Sale, "sale-2".to_string())));
        assert_eq!(queue.stats().await.unwrap().blocked, 1);

        assert_eq!(queue.release(conflict).await.unwrap(), 1);
        assert_eq!(queue.release(conflict).await.unwrap(), 0);
        assert!(queue
            .outstanding_for(EntityKind::Sale, "sale-1")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn discard_unknown_operation_is_not_found() {
        let queue = queue().await;
        let operation = sale("sale-1");
        queue.enqueue(operation.clone()).await.unwrap();

        let discarded = queue.discard(operation.id).await.unwrap();
        assert_eq!(discarded.entity_id, "sale-1");
        assert!(matches!(
            queue.discard(operation.id).await,
            Err(Error::NotFound(_))
        ));
        assert!(!queue.remove(operation.id).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn corrupt_queue_loads_empty() {
        let store = LocalStore::open_in_memory().await.unwrap();
        store
            .save_raw(keys::PENDING_OPERATIONS, &json!({"oops": true}).to_string())
            .await
            .unwrap();

        let queue = PendingQueue::new(store);
        assert!(queue.operations().await.unwrap().is_empty());
        assert_eq!(queue.stats().await.unwrap(), QueueStats::default());
    }
}
