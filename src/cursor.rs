// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Checkpoint persistence.
//!
//! Stores, per (consumer, shard), the highest sequence token below which
//! every event has been durably handled. Checkpoints live in SQLite so a
//! restart resumes where the previous run stopped instead of jumping to
//! the shard head.
//!
//! # Debounced Writes
//!
//! - `set()` updates the in-memory cache immediately and marks the entry dirty
//! - `flush_dirty()` persists all dirty entries in one pass
//! - `set_now()` writes one entry through, for a shard's first position
//! - The engine calls `flush_dirty()` on an interval and on shutdown
//!
//! A crash between `set()` and `flush_dirty()` loses at most one flush
//! interval of progress. The lost range is redelivered on restart, which
//! consumers tolerate (at-least-once).
//!
//! # Monotonicity
//!
//! A checkpoint never moves backwards. `set()` with an older token is
//! ignored.
//!
//! # SQLite Busy Handling
//!
//! SQLITE_BUSY/SQLITE_LOCKED are retried with exponential backoff
//! (max 5 attempts). The cache is updated first so readers never block on
//! disk contention.

use crate::error::{FanoutError, Result};
use crate::event::SequenceToken;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::cursor_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(operation = operation_name, attempts, "SQLite busy, max retries exceeded");
                }
                return Err(e);
            }
        }
    }
}

/// Identifies one checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CheckpointKey {
    pub consumer: String,
    pub shard: String,
}

impl CheckpointKey {
    pub fn new(consumer: impl Into<String>, shard: impl Into<String>) -> Self {
        Self {
            consumer: consumer.into(),
            shard: shard.into(),
        }
    }
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.consumer, self.shard)
    }
}

/// Persistent checkpoint storage backed by SQLite.
pub struct CursorStore {
    pool: SqlitePool,
    cache: Arc<RwLock<HashMap<CheckpointKey, SequenceToken>>>,
    dirty: Arc<RwLock<HashSet<CheckpointKey>>>,
    path: String,
}

impl CursorStore {
    /// Open (or create) a checkpoint store at `path`.
    ///
    /// `":memory:"` gives a private in-memory database, useful for tests.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(path, true).await
    }

    /// Open with an explicit journal mode choice.
    pub async fn open(path: impl AsRef<Path>, wal_mode: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let in_memory = path_str == ":memory:";
        info!(path = %path_str, "Initializing checkpoint store");

        let journal = if wal_mode && !in_memory {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Memory
        };

        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", path_str)
        };

        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| FanoutError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(journal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        // Every in-memory connection is its own database, so pin to one.
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 2 })
            .min_connections(if in_memory { 1 } else { 0 })
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                consumer TEXT NOT NULL,
                shard TEXT NOT NULL,
                sequence_token TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (consumer, shard)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, String, String)> =
            sqlx::query_as("SELECT consumer, shard, sequence_token FROM checkpoints")
                .fetch_all(&pool)
                .await?;

        let mut cache = HashMap::new();
        for (consumer, shard, token) in rows {
            debug!(%consumer, %shard, %token, "Loaded checkpoint from disk");
            cache.insert(CheckpointKey::new(consumer, shard), SequenceToken::from(token));
        }

        if !cache.is_empty() {
            info!(count = cache.len(), "Restored checkpoints from previous run");
        }

        Ok(Self {
            pool,
            cache: Arc::new(RwLock::new(cache)),
            dirty: Arc::new(RwLock::new(HashSet::new())),
            path: path_str,
        })
    }

    /// Checkpoint for (consumer, shard). `None` means the shard has never
    /// been acknowledged by this consumer.
    pub async fn get(&self, consumer: &str, shard: &str) -> Option<SequenceToken> {
        self.cache
            .read()
            .await
            .get(&CheckpointKey::new(consumer, shard))
            .cloned()
    }

    /// Advance a checkpoint (debounced). Returns `false` if `token` is not
    /// newer than the stored one.
    pub async fn set(&self, consumer: &str, shard: &str, token: &SequenceToken) -> bool {
        let key = CheckpointKey::new(consumer, shard);
        {
            let mut cache = self.cache.write().await;
            if let Some(current) = cache.get(&key) {
                if token <= current {
                    debug!(%key, %token, %current, "Ignoring checkpoint regression");
                    return false;
                }
            }
            cache.insert(key.clone(), token.clone());
        }

        debug!(%key, %token, "Checkpoint updated (pending flush)");
        self.dirty.write().await.insert(key);
        true
    }

    /// Advance a checkpoint and write it to disk before returning.
    ///
    /// For positions that must survive a crash before the next flush. On a
    /// write failure the entry stays dirty for the periodic flush.
    pub async fn set_now(&self, consumer: &str, shard: &str, token: &SequenceToken) -> Result<bool> {
        if !self.set(consumer, shard, token).await {
            return Ok(false);
        }
        let key = CheckpointKey::new(consumer, shard);
        self.upsert(&key, token, chrono::Utc::now().timestamp_millis())
            .await
            .map_err(|e| FanoutError::Internal(format!("Failed to persist checkpoint {}: {}", key, e)))?;
        self.dirty.write().await.remove(&key);
        debug!(%key, %token, "Checkpoint persisted");
        Ok(true)
    }

    async fn upsert(
        &self,
        key: &CheckpointKey,
        token: &SequenceToken,
        now: i64,
    ) -> std::result::Result<(), sqlx::Error> {
        let pool = &self.pool;
        execute_with_retry("checkpoint_flush", || async {
            sqlx::query(
                r#"
                INSERT INTO checkpoints (consumer, shard, sequence_token, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(consumer, shard) DO UPDATE SET
                    sequence_token = excluded.sequence_token,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&key.consumer)
            .bind(&key.shard)
            .bind(token.as_str())
            .bind(now)
            .execute(pool)
            .await
        })
        .await
        .map(|_| ())
    }

    /// Lowest checkpoint across `consumers` for a shard.
    ///
    /// `None` if any consumer has no checkpoint yet.
    pub async fn shard_checkpoint(&self, shard: &str, consumers: &[&str]) -> Option<SequenceToken> {
        let cache = self.cache.read().await;
        let mut lowest: Option<SequenceToken> = None;
        for consumer in consumers {
            let token = cache.get(&CheckpointKey::new(*consumer, shard))?;
            lowest = match lowest {
                Some(current) if current <= *token => Some(current),
                _ => Some(token.clone()),
            };
        }
        lowest
    }

    /// Flush all dirty checkpoints to disk. Returns the number flushed.
    pub async fn flush_dirty(&self) -> Result<usize> {
        let dirty_keys: Vec<CheckpointKey> = {
            let mut dirty = self.dirty.write().await;
            dirty.drain().collect()
        };

        if dirty_keys.is_empty() {
            return Ok(0);
        }

        let now = chrono::Utc::now().timestamp_millis();

        // Snapshot so the cache lock is not held across disk writes.
        let snapshot: Vec<(CheckpointKey, SequenceToken)> = {
            let cache = self.cache.read().await;
            dirty_keys
                .into_iter()
                .filter_map(|k| cache.get(&k).cloned().map(|t| (k, t)))
                .collect()
        };

        let mut flushed = 0;
        let mut errors = 0;

        for (key, token) in snapshot {
            match self.upsert(&key, &token, now).await {
                Ok(_) => flushed += 1,
                Err(e) => {
                    errors += 1;
                    warn!(%key, error = %e, "Failed to flush checkpoint");
                    self.dirty.write().await.insert(key);
                }
            }
        }

        if flushed > 0 || errors > 0 {
            debug!(flushed, errors, "Flushed dirty checkpoints");
            crate::metrics::record_cursor_flush(flushed, errors);
        }

        if errors > 0 {
            return Err(FanoutError::Internal(format!(
                "Failed to flush {} checkpoints",
                errors
            )));
        }

        Ok(flushed)
    }

    pub async fn has_dirty(&self) -> bool {
        !self.dirty.read().await.is_empty()
    }

    pub async fn dirty_count(&self) -> usize {
        self.dirty.read().await.len()
    }

    /// Forget a checkpoint (e.g. when a shard is retired).
    pub async fn delete(&self, consumer: &str, shard: &str) -> Result<()> {
        let key = CheckpointKey::new(consumer, shard);
        self.cache.write().await.remove(&key);
        self.dirty.write().await.remove(&key);

        let pool = &self.pool;
        execute_with_retry("checkpoint_delete", || async {
            sqlx::query("DELETE FROM checkpoints WHERE consumer = ? AND shard = ?")
                .bind(&key.consumer)
                .bind(&key.shard)
                .execute(pool)
                .await
        })
        .await?;

        info!(%key, "Deleted checkpoint");
        Ok(())
    }

    /// All checkpoints (for health checks).
    pub async fn get_all(&self) -> HashMap<CheckpointKey, SequenceToken> {
        self.cache.read().await.clone()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database.
    pub async fn checkpoint_wal(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("checkpoint_wal", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Flush dirty entries, checkpoint the WAL and close the pool.
    pub async fn close(&self) {
        if self.has_dirty().await {
            match self.flush_dirty().await {
                Ok(count) if count > 0 => info!(count, "Flushed dirty checkpoints on close"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to flush dirty checkpoints on close"),
            }
        }

        if let Err(e) = self.checkpoint_wal().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Checkpoint store closed");
    }
}
