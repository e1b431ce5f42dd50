//! Sync engine: connectivity probing, queue replay, cache refresh and
//! conflict resolution against a [`RemoteStore`].
//!
//! All mutating operations run inside one critical section, so a queue drain,
//! a resolution and a local edit never interleave. Status values are
//! published through `watch` channels; consumers can read or subscribe but
//! only the engine writes them.

mod report;


use std::collections::HashSet;

use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{watch, Mutex};

use crate::config::EngineConfig;
use crate::conflict::{detect, ensure_allowed, merge_objects, ConflictResolver};
use crate::error::{Error, Result};
use crate::models::{
    is_volatile, Conflict, ConflictHistory, ConflictId, Entity, EntityKind, OperationId,
    OperationKind, PendingOperation, ResolutionStrategy, Row, WriteGuard,
};
use crate::queue::{PendingQueue, QueueStats};
use crate::remote::{ConflictSignal, RemoteError, RemoteStore};
use crate::services::LocalStore;
use crate::state::{ConnectionStatus, SyncStatus};

pub use report::{FailedOperation, SkipReason, SyncOutcome, SyncReport};

/// Point-in-time summary for status displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineSnapshot {
    pub connection: ConnectionStatus,
    pub sync: SyncStatus,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub queue: QueueStats,
    pub unresolved_conflicts: usize,
}

enum Replay {
    Applied,
    Conflicted(Conflict),
}

/// Resets the sync status to idle on every exit path.
struct SyncingGuard<'a> {
    status: &'a watch::Sender<SyncStatus>,
}

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.status.send_replace(SyncStatus::Idle);
    }
}

pub struct SyncEngine<R> {
    store: LocalStore,
    queue: PendingQueue,
    conflicts: ConflictResolver,
    remote: R,
    config: EngineConfig,
    critical: Mutex<()>,
    connection: watch::Sender<ConnectionStatus>,
    sync_status: watch::Sender<SyncStatus>,
}

impl<R: RemoteStore> SyncEngine<R> {
    pub fn new(store: LocalStore, remote: R, config: EngineConfig) -> Self {
        let (connection, _) = watch::channel(ConnectionStatus::Checking);
        let (sync_status, _) = watch::channel(SyncStatus::Idle);
        Self {
            queue: PendingQueue::new(store.clone()),
            conflicts: ConflictResolver::new(store.clone()),
            store,
            remote,
            config,
            critical: Mutex::new(()),
            connection,
            sync_status,
        }
    }

    pub const fn store(&self) -> &LocalStore {
        &self.store
    }

    pub const fn queue(&self) -> &PendingQueue {
        &self.queue
    }

    pub const fn conflicts(&self) -> &ConflictResolver {
        &self.conflicts
    }

    pub const fn remote(&self) -> &R {
        &self.remote
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        *self.connection.borrow()
    }

    pub fn sync_status(&self) -> SyncStatus {
        *self.sync_status.borrow()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection.subscribe()
    }

    pub fn subscribe_sync(&self) -> watch::Receiver<SyncStatus> {
        self.sync_status.subscribe()
    }

    pub async fn snapshot(&self) -> Result<EngineSnapshot> {
        Ok(EngineSnapshot {
            connection: self.connection_status(),
            sync: self.sync_status(),
            last_sync_time: self.store.last_sync_time().await?,
            queue: self.queue.stats().await?,
            unresolved_conflicts: self.conflicts.unresolved().await.len(),
        })
    }

    /// Probe the remote within the configured timeout.
    ///
    /// The status reads `checking` while the probe is in flight and `online`
    /// or `offline` afterwards.
    pub async fn check_connection(&self) -> bool {
        self.connection.send_replace(ConnectionStatus::Checking);
        let timeout = self.config.connection_timeout();

        let online = match tokio::time::timeout(timeout, self.remote.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(error)) => {
                tracing::warn!("Remote store unreachable: {error}");
                false
            }
            Err(_) => {
                tracing::warn!("Remote store probe timed out after {timeout:?}");
                false
            }
        };

        self.connection.send_replace(if online {
            ConnectionStatus::Online
        } else {
            ConnectionStatus::Offline
        });
        online
    }

    /// Replay queued operations, refresh the cache and stamp the sync time.
    ///
    /// Skipped while offline or when another sync is running.
    pub async fn sync_data(&self) -> Result<SyncOutcome> {
        if self.connection_status() != ConnectionStatus::Online {
            tracing::debug!("Skipping sync while {}", self.connection_status());
            return Ok(SyncOutcome::Skipped {
                reason: SkipReason::Offline,
            });
        }

        let started = self.sync_status.send_if_modified(|status| {
            if *status == SyncStatus::Idle {
                *status = SyncStatus::Syncing;
                true
            } else {
                false
            }
        });
        if !started {
            tracing::debug!("Skipping sync: another sync is in flight");
            return Ok(SyncOutcome::Skipped {
                reason: SkipReason::AlreadySyncing,
            });
        }
        let _syncing = SyncingGuard {
            status: &self.sync_status,
        };
        let _critical = self.critical.lock().await;

        tracing::info!("Sync started");
        let mut report = SyncReport::default();
        self.drain(&mut report).await?;
        self.refresh(&mut report).await?;

        report.finished_at = Utc::now();
        self.store.set_last_sync_time(report.finished_at).await?;
        tracing::info!(
            "Sync finished: {} applied, {} conflicts, {} failed, {} deferred",
            report.applied,
            report.conflicts.len(),
            report.failed.len(),
            report.deferred
        );
        Ok(SyncOutcome::Completed(report))
    }

    async fn drain(&self, report: &mut SyncReport) -> Result<()> {
        let history = self.conflicts.load_history().await;
        let mut held: HashSet<(EntityKind, String)> = history
            .unresolved()
            .map(|conflict| (conflict.entity, conflict.entity_id.clone()))
            .collect();

        for operation in self.queue.ready().await? {
            let target = (operation.entity_type, operation.entity_id.clone());
            if held.contains(&target) {
                report.deferred += 1;
                continue;
            }

            match self.replay(&operation).await {
                Ok(Replay::Applied) => {
                    self.queue.remove(operation.id).await?;
                    report.applied += 1;
                    tracing::debug!(
                        "Applied {} of {} {}",
                        operation.operation_kind,
                        operation.entity_type,
                        operation.entity_id
                    );
                }
                Ok(Replay::Conflicted(conflict)) => {
                    let conflict_id = conflict.id;
                    self.conflicts
                        .record(conflict.with_operation(operation.id))
                        .await?;
                    self.queue.block(operation.id, conflict_id).await?;
                    report.conflicts.push(conflict_id);
                    held.insert(target);
                }
                Err(error @ (Error::Remote(_) | Error::InvalidInput(_) | Error::Serialization(_))) => {
                    let transient = matches!(&error, Error::Remote(remote) if remote.is_transient());
                    tracing::warn!(
                        "Failed to apply {} of {} {}: {error}",
                        operation.operation_kind,
                        operation.entity_type,
                        operation.entity_id
                    );
                    self.queue
                        .record_failure(operation.id, &error.to_string())
                        .await?;
                    report.failed.push(FailedOperation {
                        operation_id: operation.id,
                        entity: operation.entity_type,
                        entity_id: operation.entity_id.clone(),
                        operation_kind: operation.operation_kind,
                        error: error.to_string(),
                        transient,
                    });
                    held.insert(target);
                }
                Err(error) => return Err(error),
            }
        }
        Ok(())
    }

    async fn replay(&self, operation: &PendingOperation) -> Result<Replay> {
        let (kind, entity_id) = operation.target();
        let table = kind.table();

        match operation.operation_kind {
            OperationKind::Create => {
                let row = payload(operation)?;
                match self.remote.insert(table, row).await {
                    Ok(_) => Ok(Replay::Applied),
                    Err(RemoteError::Conflict(ConflictSignal::DuplicateKey)) => {
                        let client = Entity::from_row(kind, row.clone())?;
                        let server = self.fetch(kind, entity_id).await?;
                        classify(kind, entity_id, Some(&client), server.as_ref())
                    }
                    Err(error) => Err(error.into()),
                }
            }
            OperationKind::Update => {
                let patch = payload(operation)?;
                let result = self
                    .remote
                    .update(table, entity_id, patch, &operation.guard())
                    .await;
                match result {
                    Ok(_) => Ok(Replay::Applied),
                    Err(error) if error.conflict_signal().is_some() => {
                        let server = self.fetch(kind, entity_id).await?;
                        let client = match self.store.find_cached(kind, entity_id).await? {
                            Some(cached) => Some(cached),
                            None => server
                                .as_ref()
                                .map(|server| server.with_patch(patch))
                                .transpose()?,
                        };
                        classify(kind, entity_id, client.as_ref(), server.as_ref())
                    }
                    Err(error) => Err(error.into()),
                }
            }
            OperationKind::Delete => {
                let result = self
                    .remote
                    .delete(table, entity_id, &operation.guard())
                    .await;
                match result {
                    Ok(()) => Ok(Replay::Applied),
                    Err(error) if error.conflict_signal().is_some() => {
                        // Already gone remotely: the delete has nothing left to do.
                        let server = self.fetch(kind, entity_id).await?;
                        classify(kind, entity_id, None, server.as_ref())
                    }
                    Err(error) => Err(error.into()),
                }
            }
        }
    }

    async fn fetch(&self, kind: EntityKind, entity_id: &str) -> Result<Option<Entity>> {
        self.remote
            .select_by_id(kind.table(), entity_id)
            .await?
            .map(|row| Entity::from_row(kind, row))
            .transpose()
    }

    /// Overwrite cached collections with the remote copy, except entities with
    /// outstanding operations or unresolved conflicts.
    async fn refresh(&self, report: &mut SyncReport) -> Result<()> {
        let mut protected = self.queue.outstanding_targets().await?;
        protected.extend(
            self.conflicts
                .load_history()
                .await
                .unresolved()
                .map(|conflict| (conflict.entity, conflict.entity_id.clone())),
        );

        for kind in EntityKind::ALL {
            let rows = match self.remote.select_all(kind.table()).await {
                Ok(rows) => rows,
                Err(error) => {
                    tracing::warn!("Keeping cached {kind} collection: fetch failed: {error}");
                    report.fetch_failed.push(kind);
                    continue;
                }
            };

            let local = self.store.load_entities(kind).await?;
            let is_protected =
                |entity_id: &str| protected.contains(&(kind, entity_id.to_string()));

            let mut merged = Vec::with_capacity(rows.len());
            let mut seen = HashSet::new();
            for row in rows {
                let server = match Entity::from_row(kind, row) {
                    Ok(entity) => entity,
                    Err(error) => {
                        tracing::warn!("Skipping unreadable remote {kind}: {error}");
                        continue;
                    }
                };
                seen.insert(server.id().to_string());
                if is_protected(server.id()) {
                    if let Some(cached) = local.iter().find(|e| e.id() == server.id()) {
                        merged.push(cached.clone());
                    }
                } else {
                    merged.push(server);
                }
            }
            merged.extend(
                local
                    .into_iter()
                    .filter(|entity| is_protected(entity.id()) && !seen.contains(entity.id())),
            );

            self.store.save_entities(kind, &merged).await?;
            report.refreshed.push(kind);
        }
        Ok(())
    }

    pub async fn load_conflict_history(&self) -> ConflictHistory {
        self.conflicts.load_history().await
    }

    /// Unresolved conflicts in detection order.
    pub async fn unresolved_conflicts(&self) -> Vec<Conflict> {
        self.conflicts.unresolved().await
    }

    /// Settle a conflict and commit the outcome remotely and locally.
    ///
    /// `server` adopts the current remote copy and `client` pushes the local
    /// snapshot; neither accepts `data`. `merge` pushes `data` or, without it, the field-level merge of
    /// both snapshots; `manual` pushes `data`, which is required. A missing
    /// value means the record is deleted. Returns `Ok(false)` for an unknown
    /// or already resolved conflict. On any error the conflict stays
    /// unresolved.
    pub async fn resolve_conflict(
        &self,
        conflict_id: ConflictId,
        strategy: ResolutionStrategy,
        data: Option<Entity>,
    ) -> Result<bool> {
        let _critical = self.critical.lock().await;

        let Some(conflict) = self.conflicts.find(conflict_id).await else {
            return Ok(false);
        };
        if conflict.resolved {
            return Ok(false);
        }
        ensure_allowed(&conflict, strategy)?;
        if data.is_some()
            && matches!(
                strategy,
                ResolutionStrategy::Server | ResolutionStrategy::Client
            )
        {
            return Err(Error::Resolution(format!(
                "{strategy} resolution takes no data"
            )));
        }
        if let Some(entity) = &data {
            if !conflict.concerns(entity.kind(), entity.id()) {
                return Err(Error::Resolution(format!(
                    "data for {} {} cannot resolve a conflict on {} {}",
                    entity.kind(),
                    entity.id(),
                    conflict.entity,
                    conflict.entity_id
                )));
            }
        }

        let kind = conflict.entity;
        let entity_id = conflict.entity_id.as_str();
        let committed = match strategy {
            ResolutionStrategy::Server => self.fetch(kind, entity_id).await?,
            ResolutionStrategy::Client => {
                let value = conflict.client_data.clone().map(touch);
                self.commit(kind, entity_id, value.as_ref()).await?;
                value
            }
            ResolutionStrategy::Merge => {
                let merged = match (data, &conflict.client_data, &conflict.server_data) {
                    (Some(entity), _, _) => entity,
                    (None, Some(client), Some(server)) => merge_objects(client, server)?,
                    (None, _, _) => {
                        return Err(Error::Resolution(
                            "merge needs both client and server copies".to_string(),
                        ))
                    }
                };
                let value = Some(touch(merged));
                self.commit(kind, entity_id, value.as_ref()).await?;
                value
            }
            ResolutionStrategy::Manual => {
                let edited = data.ok_or_else(|| {
                    Error::Resolution("manual resolution requires edited data".to_string())
                })?;
                let value = Some(touch(edited));
                self.commit(kind, entity_id, value.as_ref()).await?;
                value
            }
        };

        match &committed {
            Some(entity) => self.store.upsert_cached(entity).await?,
            None => {
                self.store.remove_cached(kind, entity_id).await?;
            }
        }
        self.queue.release(conflict_id).await?;
        self.conflicts
            .resolve(conflict_id, strategy, committed)
            .await
    }

    /// Write the resolved value to the remote store; `None` deletes.
    async fn commit(&self, kind: EntityKind, entity_id: &str, value: Option<&Entity>) -> Result<()> {
        match value {
            Some(entity) => {
                self.remote.upsert(kind.table(), &entity.to_row()?).await?;
            }
            None => match self
                .remote
                .delete(kind.table(), entity_id, &WriteGuard::Unguarded)
                .await {
                Ok(()) | Err(RemoteError::Conflict(ConflictSignal::NoMatchingRow)) => {}
                Err(error) => return Err(error.into()),
            },
        }
        Ok(())
    }

    /// Record a new entity locally and queue its creation.
    pub async fn create(&self, entity: Entity) -> Result<Entity> {
        let _critical = self.critical.lock().await;
        let kind = entity.kind();
        if self.store.find_cached(kind, entity.id()).await?.is_some() {
            return Err(Error::InvalidInput(format!(
                "{kind} {} already exists",
                entity.id()
            )));
        }

        let now = now();
        let mut row = entity.to_row()?;
        if matches!(row.get("created_at"), None | Some(Value::Null)) {
            row.insert("created_at".to_string(), serde_json::to_value(now)?);
        }
        row.insert("updated_at".to_string(), serde_json::to_value(now)?);
        let entity = Entity::from_row(kind, row)?;

        self.store.upsert_cached(&entity).await?;
        self.queue.enqueue(PendingOperation::create(&entity)?).await?;
        Ok(entity)
    }

    /// Apply `patch` to the cached copy and queue it for the remote.
    pub async fn update(&self, kind: EntityKind, entity_id: &str, mut patch: Row) -> Result<Entity> {
        let _critical = self.critical.lock().await;
        let cached = self
            .store
            .find_cached(kind, entity_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{kind} {entity_id}")))?;

        let base_updated_at = cached.updated_at();
        let base_values = match base_updated_at {
            Some(_) => None,
            None => Some(prior_values(&cached, Some(&patch))?),
        };
        patch.insert("updated_at".to_string(), serde_json::to_value(now())?);
        let mut operation = PendingOperation::update(kind, entity_id, patch, base_updated_at)?;
        if let Some(values) = base_values {
            operation = operation.with_base_values(values);
        }
        let updated = match &operation.payload {
            Some(patch) => cached.with_patch(patch)?,
            None => cached,
        };

        self.store.upsert_cached(&updated).await?;
        self.queue.enqueue(operation).await?;
        Ok(updated)
    }

    /// Remove the cached copy and queue the deletion.
    ///
    /// An entity whose creation never reached the remote is simply forgotten
    /// along with its queued edits.
    pub async fn delete(&self, kind: EntityKind, entity_id: &str) -> Result<()> {
        let _critical = self.critical.lock().await;
        let cached = self
            .store
            .find_cached(kind, entity_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{kind} {entity_id}")))?;

        let pending = self.queue.outstanding_for(kind, entity_id).await?;
        let unsent_create = pending.iter().any(|operation| {
            operation.operation_kind == OperationKind::Create && !operation.is_blocked()
        }) && pending.iter().all(|operation| !operation.is_blocked());

        self.store.remove_cached(kind, entity_id).await?;
        if unsent_create {
            let dropped = self.queue.remove_for(kind, entity_id).await?;
            tracing::debug!("Dropped {dropped} unsent operation(s) for deleted {kind} {entity_id}");
        } else {
            let base_updated_at = cached.updated_at();
            let mut operation = PendingOperation::delete(kind, entity_id, base_updated_at);
            if base_updated_at.is_none() {
                operation = operation.with_base_values(prior_values(&cached, None)?);
            }
            self.queue.enqueue(operation).await?;
        }
        Ok(())
    }

    /// Abandon a queued operation. The cached copy keeps its optimistic
    /// state until the next refresh.
    pub async fn discard_operation(&self, operation_id: OperationId) -> Result<PendingOperation> {
        let _critical = self.critical.lock().await;
        self.queue.discard(operation_id).await
    }

    /// Clear every local key. Never touches the remote.
    pub async fn wipe_local_data(&self) -> Result<()> {
        let _critical = self.critical.lock().await;
        self.store.wipe().await
    }
}

/// Non-volatile values of `cached` to guard a write on when it carries no
/// `updated_at`. With a patch only the patched fields are kept.
fn prior_values(cached: &Entity, patch: Option<&Row>) -> Result<Row> {
    Ok(cached
        .to_row()?
        .into_iter()
        .filter(|(field, _)| field != "id" && !is_volatile(field))
        .filter(|(field, _)| patch.is_none_or(|patch| patch.contains_key(field)))
        .collect())
}

fn payload(operation: &PendingOperation) -> Result<&Row> {
    operation.payload.as_ref().ok_or_else(|| {
        Error::InvalidInput(format!(
            "queued {} of {} {} has no payload",
            operation.operation_kind, operation.entity_type, operation.entity_id
        ))
    })
}

fn classify(
    kind: EntityKind,
    entity_id: &str,
    client: Option<&Entity>,
    server: Option<&Entity>,
) -> Result<Replay> {
    Ok(match detect(kind, entity_id, client, server)? {
        Some(conflict) => Replay::Conflicted(conflict),
        None => Replay::Applied,
    })
}

/// Timestamps are kept at microsecond precision to survive a round trip
/// through the remote.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn touch(mut entity: Entity) -> Entity {
    entity.set_updated_at(now());
    entity
}
