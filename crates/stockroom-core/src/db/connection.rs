//! libSQL connection for the local store

use std::path::Path;

use libsql::{Builder, Connection, Database as LibSqlDatabase};

use super::migrations;
use crate::error::Result;

const IN_MEMORY: &str = ":memory:";

/// An open, migrated local database
pub struct Database {
    // Keeps the handle alive for the lifetime of `conn`.
    _db: LibSqlDatabase,
    conn: Connection,
}

impl Database {
    /// Open (or create) the database file at `path` and migrate it.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let location = path.as_ref().to_string_lossy().into_owned();
        let database = Self::connect(&location).await?;
        tracing::debug!("Opened local store at {location}");
        Ok(database)
    }

    /// Open a private in-memory database. Contents vanish on drop.
    pub async fn open_in_memory() -> Result<Self> {
        Self::connect(IN_MEMORY).await
    }

    async fn connect(location: &str) -> Result<Self> {
        let db = Builder::new_local(location).build().await?;
        let conn = db.connect()?;

        // WAL is unavailable for in-memory databases.
        if location != IN_MEMORY {
            conn.execute("PRAGMA journal_mode = WAL;", ()).await.ok();
        }
        conn.execute("PRAGMA synchronous = NORMAL;", ()).await.ok();

        migrations::run(&conn).await?;
        Ok(Self { _db: db, conn })
    }

    pub const fn connection(&self) -> &Connection {
        &self.conn
    }
}
