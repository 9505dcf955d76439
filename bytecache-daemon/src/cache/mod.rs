//! SQLite-backed offline cache for catalog items
//!
//! The cache keeps the last successfully fetched catalog on disk so consumers
//! can read it without a network connection. It is stored in a SQLite
//! database at `$XDG_DATA_HOME/bytecache/cache.db` unless configured otherwise.
//!
//! # Database Schema
//!
//! - `items`: Cached catalog rows, keyed by item identifier
//! - `job_state`: Next scheduled run per recurring job
//! - `schema_version`: Migration tracking
//!
//! # Consistency
//!
//! Every [`CacheStore::replace_all`] call is one transaction. After it commits,
//! the full table is re-read and published to subscribers as a single
//! immutable snapshot, so observers never see half of a batch.
//!
//! # Example
//!
//! ```no_run
//! use bytecache_daemon::cache::{CacheStore, SqliteCache};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let cache = SqliteCache::open()?;
//! let mut feed = cache.read_all();
//! while let Some(items) = feed.next().await {
//!     println!("{} cached items", items.len());
//! }
//! # Ok(())
//! # }
//! ```

mod feed;
mod provider;

pub use feed::{ItemFeed, Snapshot};
pub use provider::StoreProvider;

use anyhow::{anyhow, Context, Result};
use bytecache_core::{ItemId, PersistedItem};
use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::scheduler::JobStateStore;

// ============================================================================
// Cache Trait
// ============================================================================

/// Operations the repository needs from the offline cache.
pub trait CacheStore: Send + Sync {
    /// Live view of every cached row.
    fn read_all(&self) -> ItemFeed<PersistedItem>;

    /// One-shot read of every cached row.
    fn snapshot(&self) -> Result<Vec<PersistedItem>>;

    /// Insert or replace each item by identifier, as a single unit.
    ///
    /// Returns the number of rows written. A malformed item fails the whole
    /// call and leaves the cache unchanged.
    fn replace_all(&self, items: &[PersistedItem]) -> Result<usize>;

    /// Number of cached rows.
    fn count(&self) -> Result<usize>;
}

// ============================================================================
// SqliteCache Implementation
// ============================================================================

/// SQLite-based implementation of the cache.
///
/// The connection sits behind a `Mutex`; readers of [`CacheStore::read_all`]
/// never touch it and only see published snapshots.
pub struct SqliteCache {
    conn: Mutex<Connection>,
    snapshot_tx: watch::Sender<Snapshot>,
}

impl SqliteCache {
    /// Open the cache database at the default location, creating it if needed.
    pub fn open() -> Result<Self> {
        let db_path = Self::default_db_path()?;
        Self::open_at(&db_path)
    }

    /// Open the cache database at a specific path.
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create cache directory: {:?}", parent))?;
        }

        info!("Opening cache database at: {:?}", path);

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;

        Self::from_connection(conn)
    }

    /// Open a cache that lives only as long as this value.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let (snapshot_tx, _) = watch::channel(Arc::new(Vec::new()));
        let cache = Self {
            conn: Mutex::new(conn),
            snapshot_tx,
        };
        cache.run_migrations()?;

        let initial = {
            let conn = cache.lock()?;
            Self::load_items(&conn)?
        };
        debug!("Loaded {} cached items", initial.len());
        cache.snapshot_tx.send_replace(Arc::new(initial));

        Ok(cache)
    }

    /// Get the default database path using XDG directories.
    pub fn default_db_path() -> Result<PathBuf> {
        let project_dirs = ProjectDirs::from("", "raibid-labs", "bytecache")
            .context("Failed to determine project directories")?;

        Ok(project_dirs.data_dir().join("cache.db"))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Cache connection lock poisoned"))
    }

    /// Run database migrations to set up the schema.
    fn run_migrations(&self) -> Result<()> {
        let mut conn = self.lock()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            [],
        )
        .context("Failed to create schema_version table")?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .context("Failed to read schema version")?;

        debug!("Current schema version: {}", current_version);

        if current_version < 1 {
            Self::migrate_to_v1(&mut conn)?;
        }

        Ok(())
    }

    /// Migration to version 1: Initial schema.
    fn migrate_to_v1(conn: &mut Connection) -> Result<()> {
        info!("Running migration to schema version 1");

        let tx = conn.transaction()?;

        tx.execute(
            "CREATE TABLE IF NOT EXISTS items (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                url TEXT NOT NULL,
                updated TEXT NOT NULL,
                thumbnail TEXT NOT NULL,
                cached_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )
        .context("Failed to create items table")?;

        tx.execute(
            "CREATE TABLE IF NOT EXISTS job_state (
                job_name TEXT PRIMARY KEY,
                next_run TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )
        .context("Failed to create job_state table")?;

        tx.execute(
            "CREATE INDEX IF NOT EXISTS idx_items_updated
             ON items(updated DESC)",
            [],
        )?;

        tx.execute("INSERT INTO schema_version (version) VALUES (1)", [])
            .context("Failed to update schema version")?;

        tx.commit()?;

        info!("Successfully migrated to schema version 1");
        Ok(())
    }

    fn load_items(conn: &Connection) -> Result<Vec<PersistedItem>> {
        let mut stmt = conn.prepare(
            "SELECT id, title, description, url, updated, thumbnail
             FROM items
             ORDER BY updated DESC, id",
        )?;

        let items = stmt
            .query_map([], |row| {
                Ok(PersistedItem {
                    id: ItemId(row.get(0)?),
                    title: row.get(1)?,
                    description: row.get(2)?,
                    url: row.get(3)?,
                    updated: row.get(4)?,
                    thumbnail: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to read cached items")?;

        Ok(items)
    }
}

impl CacheStore for SqliteCache {
    fn read_all(&self) -> ItemFeed<PersistedItem> {
        ItemFeed::new(self.snapshot_tx.subscribe())
    }

    fn snapshot(&self) -> Result<Vec<PersistedItem>> {
        let conn = self.lock()?;
        Self::load_items(&conn)
    }

    fn replace_all(&self, items: &[PersistedItem]) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        for item in items {
            item.validate()
                .with_context(|| format!("Rejected cache row {:?}", item.id.as_str()))?;

            tx.execute(
                "INSERT INTO items (id, title, description, url, updated, thumbnail, cached_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, datetime('now'))
                 ON CONFLICT(id) DO UPDATE SET
                    title = excluded.title,
                    description = excluded.description,
                    url = excluded.url,
                    updated = excluded.updated,
                    thumbnail = excluded.thumbnail,
                    cached_at = datetime('now')",
                params![
                    item.id.as_str(),
                    &item.title,
                    &item.description,
                    &item.url,
                    &item.updated,
                    &item.thumbnail,
                ],
            )?;
        }

        // Read back inside the transaction: a failed read rolls the batch back
        // instead of leaving observers behind storage.
        let snapshot = Self::load_items(&tx)?;
        tx.commit().context("Failed to commit cache batch")?;

        // Published under the connection lock so snapshots go out in commit order.
        debug!(
            "Replaced {} items, cache now holds {}",
            items.len(),
            snapshot.len()
        );
        self.snapshot_tx.send_replace(Arc::new(snapshot));

        Ok(items.len())
    }

    fn count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

impl JobStateStore for SqliteCache {
    fn next_run(&self, job_name: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.lock()?;

        let next_run: Option<String> = conn
            .query_row(
                "SELECT next_run FROM job_state WHERE job_name = ?",
                [job_name],
                |row| row.get(0),
            )
            .optional()?;

        next_run
            .map(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|dt| dt.with_timezone(&Utc))
                    .with_context(|| format!("Invalid next_run for job '{}': {}", job_name, s))
            })
            .transpose()
    }

    fn set_next_run(&self, job_name: &str, next_run: DateTime<Utc>) -> Result<()> {
        let conn = self.lock()?;

        conn.execute(
            "INSERT INTO job_state (job_name, next_run, updated_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(job_name) DO UPDATE SET
                next_run = excluded.next_run,
                updated_at = datetime('now')",
            params![job_name, next_run.to_rfc3339()],
        )?;

        debug!("Persisted next run for job '{}': {}", job_name, next_run);
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
