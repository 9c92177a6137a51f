//! L2 persistent result cache backed by SQLite.
//! Complements the in-memory LRU L1 cache for cross-restart persistence.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use super::cache::{now_unix, now_unix_ms, CacheError, CachedResult, ResultCache};

/// SQLite-backed result cache (L2).
pub struct SqliteResultCache {
    conn: Mutex<Connection>,
}

impl SqliteResultCache {
    /// Open (or create) the SQLite cache database at the given path.
    pub fn open(db_path: &Path) -> Result<Self, CacheError> {
        let conn = Connection::open(db_path)?;

        // WAL mode for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let cache = Self::with_connection(conn)?;

        info!(path = %db_path.display(), "SQLite L2 cache opened");
        Ok(cache)
    }

    pub fn open_in_memory() -> Result<Self, CacheError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    // expires_at holds Unix milliseconds; rows from older second-based files
    // read as long expired and are purged by the next cleanup.
    fn with_connection(conn: Connection) -> Result<Self, CacheError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS result_cache (
                cache_key TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_result_cache_expires
                ON result_cache(expires_at);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lookup(&self, key: &str) -> Result<Option<(CachedResult, Duration)>, CacheError> {
        let now = now_unix_ms();
        let conn = self.conn.lock();
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT payload, expires_at FROM result_cache
                 WHERE cache_key = ?1 AND expires_at > ?2",
                params![key, now],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            Some((json, expires_at)) => {
                debug!("L2 cache hit");
                let left = u64::try_from(expires_at - now).unwrap_or(0);
                Ok(Some((serde_json::from_str(&json)?, Duration::from_millis(left))))
            }
            None => Ok(None),
        }
    }

    fn store(&self, key: &str, value: &CachedResult, ttl: Duration) -> Result<(), CacheError> {
        let payload = serde_json::to_string(value)?;
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at = now_unix_ms().saturating_add(ttl_ms);
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO result_cache (cache_key, payload, expires_at)
             VALUES (?1, ?2, ?3)",
            params![key, payload, expires_at],
        )?;
        Ok(())
    }

    /// Remove expired entries. Called periodically from a background task.
    pub fn cleanup_expired(&self) -> usize {
        let conn = self.conn.lock();
        match conn.execute(
            "DELETE FROM result_cache WHERE expires_at <= ?1",
            params![now_unix_ms()],
        ) {
            Ok(count) => {
                if count > 0 {
                    info!(removed = count, "L2 cache cleanup");
                }
                count
            }
            Err(e) => {
                warn!(error = %e, "L2 cache cleanup failed");
                0
            }
        }
    }

    /// Start a background cleanup loop (runs every hour).
    pub fn start_cleanup_loop(cache: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(3600));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                cache.cleanup_expired();
            }
        })
    }
}

#[async_trait]
impl ResultCache for SqliteResultCache {
    async fn get(&self, key: &str) -> Result<Option<CachedResult>, CacheError> {
        Ok(self.lookup(key)?.map(|(value, _)| value))
    }

    async fn get_expiring(&self, key: &str) -> Result<Option<(CachedResult, Option<Duration>)>, CacheError> {
        Ok(self.lookup(key)?.map(|(value, left)| (value, Some(left))))
    }

    async fn set(&self, key: &str, value: CachedResult, ttl: Duration) -> Result<(), CacheError> {
        self.store(key, &value, ttl)
    }
}
