//! Schema migrations for the local store
//!
//! Each entry in [`MIGRATIONS`] is applied once, inside its own transaction,
//! in ascending version order.

use crate::error::Result;
use libsql::Connection;

struct Migration {
    version: i32,
    description: &'static str,
    statements: &'static [&'static str],
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "key-value store",
    statements: &["CREATE TABLE IF NOT EXISTS kv_store (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )"],
}];

/// Highest schema version this build knows about
pub const SCHEMA_VERSION: i32 = 1;

/// Bring the schema up to [`SCHEMA_VERSION`].
pub async fn run(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
        (),
    )
    .await?;

    let current = applied_version(conn).await?;
    if current > SCHEMA_VERSION {
        tracing::warn!(
            "Local store schema {current} is newer than supported {SCHEMA_VERSION}; continuing"
        );
    }

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        apply(conn, migration).await?;
    }
    Ok(())
}

async fn applied_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;
    match rows.next().await? {
        Some(row) => Ok(row.get(0)?),
        None => Ok(0),
    }
}

async fn apply(conn: &Connection, migration: &Migration) -> Result<()> {
    conn.execute("BEGIN TRANSACTION", ()).await?;

    let outcome = async {
        for statement in migration.statements {
            conn.execute(statement, ()).await?;
        }
        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            [migration.version],
        )
        .await?;
        conn.execute("COMMIT", ()).await?;
        Ok::<_, crate::Error>(())
    }
    .await;

    if outcome.is_err() {
        conn.execute("ROLLBACK", ()).await.ok();
    } else {
        tracing::info!(
            "Migrated local store to version {} ({})",
            migration.version,
            migration.description
        );
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use libsql::Builder;

    async fn setup() -> Connection {
        let db = Builder::new_local(":memory:").build().await.unwrap();
        db.connect().unwrap()
    }

    async fn table_exists(conn: &Connection, name: &str) -> bool {
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [name],
            )
            .await
            .unwrap();
        rows.next()
            .await
            .unwrap()
            .is_some_and(|row| row.get::<i64>(0).unwrap() > 0)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fresh_database_reaches_latest_version() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        assert_eq!(applied_version(&conn).await.unwrap(), SCHEMA_VERSION);
        assert!(table_exists(&conn, "kv_store").await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rerunning_applies_nothing_twice() {
        let conn = setup().await;
        run(&conn).await.unwrap();
        run(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT COUNT(*) FROM schema_version", ())
            .await
            .unwrap();
        let applied: i64 = rows.next().await.unwrap().unwrap().get(0).unwrap();
        assert_eq!(applied, i64::from(SCHEMA_VERSION));
    }
}
