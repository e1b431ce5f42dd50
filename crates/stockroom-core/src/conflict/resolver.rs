//! Persistent conflict history and resolution bookkeeping

use super::detect::resolution_options;
use crate::error::{Error, Result};
use crate::models::{Conflict, ConflictHistory, ConflictId, Entity, ResolutionStrategy, HISTORY_SCHEMA_VERSION};
use crate::services::{keys, LocalStore};

/// Records detected conflicts and tracks their resolution in the local store.
///
/// Conflicts are never removed; resolving one only flips its state.
#[derive(Clone)]
pub struct ConflictResolver {
    store: LocalStore,
}

impl ConflictResolver {
    pub const fn new(store: LocalStore) -> Self {
        Self { store }
    }

    /// Load the persisted history.
    ///
    /// Absent, corrupt or unreadable content yields an empty history.
    pub async fn load_history(&self) -> ConflictHistory {
        match self.store.load::<ConflictHistory>(keys::CONFLICT_HISTORY).await {
            Ok(history) => {
                if history.version > HISTORY_SCHEMA_VERSION {
                    tracing::warn!(
                        "Conflict history version {} is newer than supported version {}",
                        history.version,
                        HISTORY_SCHEMA_VERSION
                    );
                }
                history
            }
            Err(error) => {
                tracing::warn!("Failed to load conflict history: {error}");
                ConflictHistory::default()
            }
        }
    }

    pub async fn save_history(&self, history: &ConflictHistory) -> Result<()> {
        self.store.save(keys::CONFLICT_HISTORY, history).await
    }

    /// Append a newly detected conflict.
    pub async fn record(&self, conflict: Conflict) -> Result<()> {
        let mut history = self.load_history().await;
        tracing::info!(
            "Recorded {} conflict {} on {} {}",
            conflict.conflict_type,
            conflict.id,
            conflict.entity,
            conflict.entity_id
        );
        history.push(conflict);
        self.save_history(&history).await
    }

    /// Unresolved conflicts in detection order.
    pub async fn unresolved(&self) -> Vec<Conflict> {
        self.load_history().await.unresolved().cloned().collect()
    }

    pub async fn find(&self, id: ConflictId) -> Option<Conflict> {
        self.load_history().await.find(id).cloned()
    }

    /// Mark `id` resolved with `strategy`, storing the committed value.
    ///
    /// Returns `Ok(false)` when the conflict is unknown or already resolved.
    /// A strategy not offered for the conflict, or data for another entity, is
    /// an error and leaves the history untouched.
    pub async fn resolve(
        &self,
        id: ConflictId,
        strategy: ResolutionStrategy,
        resolved_data: Option<Entity>,
    ) -> Result<bool> {
        let mut history = self.load_history().await;
        let Some(conflict) = history.find_mut(id) else {
            tracing::debug!("Conflict {id} not found");
            return Ok(false);
        };
        if conflict.resolved {
            tracing::debug!("Conflict {id} is already resolved");
            return Ok(false);
        }

        ensure_allowed(conflict, strategy)?;
        if let Some(data) = &resolved_data {
            if !conflict.concerns(data.kind(), data.id()) {
                return Err(Error::Resolution(format!(
                    "resolved data {} {} does not match conflict on {} {}",
                    data.kind(),
                    data.id(),
                    conflict.entity,
                    conflict.entity_id
                )));
            }
        }

        conflict.mark_resolved(strategy, resolved_data)?;
        self.save_history(&history).await?;
        tracing::info!("Resolved conflict {id} using {strategy}");
        Ok(true)
    }
}

pub(crate) fn ensure_allowed(conflict: &Conflict, strategy: ResolutionStrategy) -> Result<()> {
    if resolution_options(conflict).contains(&strategy) {
        Ok(())
    } else {
        Err(Error::Resolution(format!(
            "strategy '{strategy}' is not available for {} conflicts",
            conflict.conflict_type
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConflictType, Customer, EntityKind, Meter};
    use pretty_assertions::assert_eq;

    async fn resolver() -> ConflictResolver {
        ConflictResolver::new(LocalStore::open_in_memory().await.unwrap())
    }

    fn customer_conflict(index: usize) -> Conflict {
        let entity = |phone: &str| {
            Entity::Customer(Customer {
                id: format!("customer-{index}"),
                name: "Ada".to_string(),
                phone: Some(phone.to_string()),
                ..Customer::default()
            })
        };
        Conflict::new(
            EntityKind::Customer,
            format!("customer-{index}"),
            ConflictType::Data,
            Some(entity("555-0100")),
            Some(entity("555-0199")),
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn history_round_trips_every_conflict() {
        let resolver = resolver().await;
        let conflicts: Vec<_> = (0..5).map(customer_conflict).collect();
        for conflict in &conflicts {
            resolver.record(conflict.clone()).await.unwrap();
        }

        let history = resolver.load_history().await;
        assert_eq!(history.conflicts, conflicts);
        assert_eq!(history.version, HISTORY_SCHEMA_VERSION);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn corrupt_history_loads_empty() {
        let store = LocalStore::open_in_memory().await.unwrap();
        store
            .save_raw(keys::CONFLICT_HISTORY, "{\"conflicts\": 12")
            .await
            .unwrap();

        let resolver = ConflictResolver::new(store);
        assert!(resolver.load_history().await.is_empty());
        assert!(resolver.unresolved().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn newer_history_version_is_still_read() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let mut history = ConflictHistory::default();
        history.push(customer_conflict(1));
        history.version = HISTORY_SCHEMA_VERSION + 1;
        store.save(keys::CONFLICT_HISTORY, &history).await.unwrap();

        let resolver = ConflictResolver::new(store);
        assert_eq!(resolver.load_history().await.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resolve_succeeds_only_once() {
        let resolver = resolver().await;
        let conflict = customer_conflict(7);
        let server = conflict.server_data.clone();
        resolver.record(conflict.clone()).await.unwrap();

        assert!(resolver
            .resolve(conflict.id, ResolutionStrategy::Server, server.clone())
            .await
            .unwrap());
        assert!(!resolver
            .resolve(conflict.id, ResolutionStrategy::Client, None)
            .await
            .unwrap());

        let stored = resolver.find(conflict.id).await.unwrap();
        assert!(stored.resolved);
        assert_eq!(stored.resolution, Some(ResolutionStrategy::Server));
        assert_eq!(stored.resolved_data, server);
        assert!(resolver.unresolved().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resolve_unknown_conflict_returns_false() {
        let resolver = resolver().await;
        assert!(!resolver
            .resolve(ConflictId::new(), ResolutionStrategy::Server, None)
            .await
            .unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn merge_is_rejected_for_delete_conflicts() {
        let resolver = resolver().await;
        let client = Entity::Meter(Meter {
            id: "meter-1".to_string(),
            ..Meter::default()
        });
        let conflict = Conflict::new(
            EntityKind::Meter,
            "meter-1",
            ConflictType::Delete,
            Some(client.clone()),
            None,
        );
        resolver.record(conflict.clone()).await.unwrap();

        let result = resolver
            .resolve(conflict.id, ResolutionStrategy::Merge, Some(client))
            .await;
        assert!(matches!(result, Err(Error::Resolution(_))));
        assert_eq!(resolver.unresolved().await.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resolved_data_must_match_the_entity() {
        let resolver = resolver().await;
        let conflict = customer_conflict(1);
        resolver.record(conflict.clone()).await.unwrap();

        let other = customer_conflict(2).server_data;
        let result = resolver
            .resolve(conflict.id, ResolutionStrategy::Manual, other)
            .await;
        assert!(result.is_err());
        assert!(!resolver.find(conflict.id).await.unwrap().resolved);
    }
}
