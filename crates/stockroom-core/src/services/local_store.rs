//! Local persistence store shared by the queue, conflict history and sync engine.
//!
//! Values are JSON documents stored under a fixed set of keys. Reads never fail
//! on malformed content: a corrupt document is logged and replaced by the
//! type's default, so a damaged cache degrades to "empty" rather than a crash.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::db::{Database, KeyValueRepository, LibSqlKeyValueRepository};
use crate::models::{Entity, EntityKind};
use crate::{Error, Result};

/// Keys used in the local store besides the per-kind entity collections.
pub mod keys {
    pub const PENDING_OPERATIONS: &str = "pendingOperations";
    pub const CONFLICT_HISTORY: &str = "conflictHistory";
    pub const LAST_SYNC_TIME: &str = "lastSyncTime";
}

/// Every key the store owns, in the order they are wiped.
pub fn tracked_keys() -> Vec<&'static str> {
    let mut tracked: Vec<&'static str> = EntityKind::ALL
        .iter()
        .map(|kind| kind.storage_key())
        .collect();
    tracked.extend([
        keys::PENDING_OPERATIONS,
        keys::CONFLICT_HISTORY,
        keys::LAST_SYNC_TIME,
    ]);
    tracked
}

/// Thread-safe handle to the local key-value store.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
}

impl LocalStore {
    /// Open the store at the given filesystem path.
    ///
    /// A file that is not a valid database is moved aside and a fresh store is
    /// created in its place.
    pub async fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = match Database::open(&db_path).await {
            Ok(db) => db,
            Err(error) if is_unreadable_store(&error) => {
                let backup = set_aside(&db_path)?;
                tracing::warn!(
                    "Local store at {} is unreadable ({error}); moved it to {} and starting fresh",
                    db_path.display(),
                    backup.display()
                );
                Database::open(&db_path).await?
            }
            Err(error) => return Err(error),
        };

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
        })
    }

    /// Open an in-memory store (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Raw textual value under `key`.
    pub async fn load_raw(&self, key: &str) -> Result<Option<String>> {
        let db = self.db.lock().await;
        let repo = LibSqlKeyValueRepository::new(db.connection());
        repo.get(key).await
    }

    pub async fn save_raw(&self, key: &str, value: &str) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlKeyValueRepository::new(db.connection());
        repo.set(key, value).await
    }

    /// Load and decode `key`, falling back to `T::default()` when the key is
    /// absent or its content cannot be decoded.
    pub async fn load<T>(&self, key: &str) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        let Some(raw) = self.load_raw(key).await? else {
            return Ok(T::default());
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Ok(value),
            Err(error) => {
                tracing::warn!("Discarding corrupt local value for '{key}': {error}");
                Ok(T::default())
            }
        }
    }

    pub async fn save<T>(&self, key: &str, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let raw = serde_json::to_string(value)?;
        self.save_raw(key, &raw).await
    }

    /// Remove every key in `keys`. Irreversible.
    pub async fn clear(&self, keys: &[&str]) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlKeyValueRepository::new(db.connection());
        for key in keys {
            repo.remove(key).await?;
        }
        Ok(())
    }

    /// Clear every tracked key: cached entities, queue, history and sync time.
    pub async fn wipe(&self) -> Result<()> {
        let stored = self.stored_keys().await?;
        let present: Vec<&str> = tracked_keys()
            .into_iter()
            .filter(|key| stored.iter().any(|stored| stored == key))
            .collect();
        self.clear(&present).await?;
        tracing::info!("Wiped local data ({} key(s) cleared)", present.len());
        Ok(())
    }

    /// Keys currently present in the store.
    pub async fn stored_keys(&self) -> Result<Vec<String>> {
        let db = self.db.lock().await;
        let repo = LibSqlKeyValueRepository::new(db.connection());
        repo.keys().await
    }

    /// Cached collection for `kind`, in stored order. Unreadable rows are skipped.
    pub async fn load_entities(&self, kind: EntityKind) -> Result<Vec<Entity>> {
        let rows: Vec<Value> = self.load(kind.storage_key()).await?;
        let mut entities = Vec::with_capacity(rows.len());
        for row in rows {
            match Entity::from_value(kind, row) {
                Ok(entity) => entities.push(entity),
                Err(error) => tracing::warn!("Skipping unreadable cached {kind}: {error}"),
            }
        }
        Ok(entities)
    }

    pub async fn save_entities(&self, kind: EntityKind, entities: &[Entity]) -> Result<()> {
        let rows = entities
            .iter()
            .filter(|entity| entity.kind() == kind)
            .map(Entity::to_row)
            .collect::<Result<Vec<_>>>()?;
        self.save(kind.storage_key(), &rows).await
    }

    pub async fn find_cached(&self, kind: EntityKind, entity_id: &str) -> Result<Option<Entity>> {
        Ok(self
            .load_entities(kind)
            .await?
            .into_iter()
            .find(|entity| entity.id() == entity_id))
    }

    /// Replace the cached copy of `entity`, or append it if absent.
    pub async fn upsert_cached(&self, entity: &Entity) -> Result<()> {
        let kind = entity.kind();
        let mut entities = self.load_entities(kind).await?;
        if let Some(existing) = entities.iter_mut().find(|e| e.id() == entity.id()) {
            *existing = entity.clone();
        } else {
            entities.push(entity.clone());
        }
        self.save_entities(kind, &entities).await
    }

    /// Drop the cached copy; returns whether one existed.
    pub async fn remove_cached(&self, kind: EntityKind, entity_id: &str) -> Result<bool> {
        let mut entities = self.load_entities(kind).await?;
        let before = entities.len();
        entities.retain(|entity| entity.id() != entity_id);
        let removed = entities.len() != before;
        if removed {
            self.save_entities(kind, &entities).await?;
        }
        Ok(removed)
    }

    pub async fn last_sync_time(&self) -> Result<Option<DateTime<Utc>>> {
        self.load(keys::LAST_SYNC_TIME).await
    }

    pub async fn set_last_sync_time(&self, at: DateTime<Utc>) -> Result<()> {
        self.save(keys::LAST_SYNC_TIME, &at).await
    }
}

/// Files SQLite keeps next to an open database.
const SIDECAR_SUFFIXES: [&str; 3] = ["-wal", "-shm", "-journal"];

/// libSQL only reports a damaged or foreign file through the message text.
fn is_unreadable_store(error: &Error) -> bool {
    let Error::LibSql(inner) = error else {
        return false;
    };
    let message = inner.to_string().to_ascii_lowercase();
    message.contains("not a database") || message.contains("malformed")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Rename the store file to `<file>.corrupt-<millis>` and delete its
/// sidecars, which are meaningless without it. Returns the backup path.
fn set_aside(db_path: &Path) -> Result<PathBuf> {
    let backup = with_suffix(
        db_path,
        &format!(".corrupt-{}", Utc::now().timestamp_millis()),
    );
    std::fs::rename(db_path, &backup)?;

    for suffix in SIDECAR_SUFFIXES {
        let sidecar = with_suffix(db_path, suffix);
        match std::fs::remove_file(&sidecar) {
            Ok(()) => tracing::debug!("Removed {}", sidecar.display()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => return Err(error.into()),
        }
    }
    Ok(backup)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Customer, Meter};
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn customer(id: &str, name: &str) -> Entity {
        Entity::Customer(Customer {
            id: id.to_string(),
            name: name.to_string(),
            ..Customer::default()
        })
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn load_missing_key_returns_default() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let value: Vec<String> = store.load("products").await.unwrap();
        assert!(value.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn load_corrupt_value_returns_default() {
        let store = LocalStore::open_in_memory().await.unwrap();
        store.save_raw("meters", "{not json").await.unwrap();

        let entities = store.load_entities(EntityKind::Meter).await.unwrap();
        assert!(entities.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn entity_cache_upsert_and_remove() {
        let store = LocalStore::open_in_memory().await.unwrap();

        store.upsert_cached(&customer("customer-1", "Ada")).await.unwrap();
        store.upsert_cached(&customer("customer-2", "Grace")).await.unwrap();
        store.upsert_cached(&customer("customer-1", "Ada L.")).await.unwrap();

        let cached = store.load_entities(EntityKind::Customer).await.unwrap();
        assert_eq!(
            cached,
            vec![customer("customer-1", "Ada L."), customer("customer-2", "Grace")]
        );

        assert!(store
            .remove_cached(EntityKind::Customer, "customer-1")
            .await
            .unwrap());
        assert!(!store
            .remove_cached(EntityKind::Customer, "customer-1")
            .await
            .unwrap());
        assert_eq!(store.load_entities(EntityKind::Customer).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unreadable_rows_are_skipped() {
        let store = LocalStore::open_in_memory().await.unwrap();
        store
            .save_raw("meters", r#"[{"id": "meter-1", "serial_number": "SN"}, {"serial_number": "no-id"}]"#)
            .await
            .unwrap();

        let cached = store.load_entities(EntityKind::Meter).await.unwrap();
        assert_eq!(
            cached,
            vec![Entity::Meter(Meter {
                id: "meter-1".to_string(),
                serial_number: "SN".to_string(),
                ..Meter::default()
            })]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn wipe_clears_every_tracked_key() {
        let store = LocalStore::open_in_memory().await.unwrap();
        for key in tracked_keys() {
            store.save_raw(key, "[]").await.unwrap();
        }
        store.save_raw("unrelated", "1").await.unwrap();

        store.wipe().await.unwrap();
        store.wipe().await.unwrap();

        assert_eq!(store.stored_keys().await.unwrap(), vec!["unrelated"]);
        assert_eq!(store.last_sync_time().await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn open_path_recovers_from_corrupted_file() {
        let tmp = tempdir().unwrap();
        let db_path = tmp.path().join("stockroom.db");
        std::fs::write(&db_path, vec![b'x'; 4096]).unwrap();

        let store = LocalStore::open_path(&db_path).await.unwrap();
        store.save("products", &Vec::<Value>::new()).await.unwrap();

        let backups = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(std::result::Result::ok)
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with("stockroom.db.corrupt-")
            })
            .count();
        assert_eq!(backups, 1);
    }

    #[test]
    fn set_aside_keeps_the_file_and_drops_its_sidecars() {
        let tmp = tempdir().unwrap();
        let db_path = tmp.path().join("stockroom.db");
        let wal_path = tmp.path().join("stockroom.db-wal");
        let other_path = tmp.path().join("stockroom.db-notes");
        std::fs::write(&db_path, b"bad").unwrap();
        std::fs::write(&wal_path, b"wal").unwrap();
        std::fs::write(&other_path, b"keep").unwrap();

        let backup = set_aside(&db_path).unwrap();

        assert!(!db_path.exists());
        assert!(!wal_path.exists());
        assert!(other_path.exists());
        assert_eq!(std::fs::read(backup).unwrap(), b"bad");
    }

    #[test]
    fn only_libsql_failures_count_as_unreadable() {
        assert!(!is_unreadable_store(&Error::InvalidInput(
            "file is not a database".to_string()
        )));
    }
}
