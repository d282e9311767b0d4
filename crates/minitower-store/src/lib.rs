//! Transactional run-state store for MiniTower.
//!
//! All durable state lives in one SQLite file. Writes serialize on a
//! single-connection pool so every compare-and-set reads stable state inside
//! its transaction; reads go through a shared pool. The store exposes typed
//! operations only: no SQL escapes into the handler layer, and database
//! errors surface as the closed [`StoreError`] set.

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};

pub mod error;
pub mod lease;
pub mod model;
pub mod reaper;
pub mod runs;
pub mod tenancy;

pub use error::{Result, StoreError};
pub use lease::Leased;
pub use reaper::ReapOutcome;

#[derive(Clone)]
pub struct Store {
    write: SqlitePool,
    read: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database file at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);
        Self::open_with(opts).await
    }

    async fn open_with(opts: SqliteConnectOptions) -> Result<Self> {
        // One writer connection; CAS semantics depend on it.
        let write = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts.clone())
            .await?;
        let read = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(opts)
            .await?;
        Ok(Self { write, read })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.write).await?;
        Ok(())
    }
}
