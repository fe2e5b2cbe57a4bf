use chrono::{TimeZone, Utc};
use log::{debug, info, warn};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{SqliteConnection, SqlitePool};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use super::migrations::DatabaseMigrations;
use super::models::{BufferStats, BufferedBatch, Sample, SampleRow};
use crate::config::BufferConfig;
use crate::utils::error::{WatcherError, WatcherResult};

const META_LEN: &str = "len";
const META_OVERFLOW: &str = "overflow";
const META_NEXT_SEQ: &str = "next_batch_seq";
const IDENTITY_WATCHER_ID: &str = "watcher_id";

const SELECT_COLUMNS: &str =
    "id, source_id, monotonic_ms, wall_clock_us, metric_name, value, unit, quality";

/// Bounded, durable FIFO of samples backed by SQLite.
///
/// Samples leave the queue only through `ack` (delivered) or overflow
/// eviction (oldest first). A drained batch is persisted as in-flight, so
/// draining again after a crash or failed send returns the same batch with
/// the same sequence number.
#[derive(Clone)]
pub struct SampleBuffer {
    pool: SqlitePool,
    capacity: usize,
}

impl SampleBuffer {
    pub async fn open(config: &BufferConfig) -> WatcherResult<Self> {
        // Create database directory if it doesn't exist
        if let Some(parent) = Path::new(&config.database_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    WatcherError::Storage(format!("Failed to create buffer directory: {}", e))
                })?;
            }
        }

        info!("🗄️  Opening sample buffer: {} (capacity {})", config.database_path, config.capacity);

        let options = SqliteConnectOptions::new()
            .filename(&config.database_path)
            .create_if_missing(true)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(match config.sync_mode.as_str() {
                "OFF" => SqliteSynchronous::Off,
                "NORMAL" => SqliteSynchronous::Normal,
                "FULL" => SqliteSynchronous::Full,
                _ => SqliteSynchronous::Full,
            });

        // Single connection: every mutation is serialized, no BUSY upgrades.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| WatcherError::Storage(format!("Failed to open SQLite: {}", e)))?;

        DatabaseMigrations::run_migrations(&pool).await?;

        let buffer = Self {
            pool,
            capacity: config.capacity,
        };
        buffer.repair_len().await?;

        let stats = buffer.stats().await?;
        info!(
            "✅ Sample buffer ready: {} queued, {} overflowed so far, in-flight batch {:?}",
            stats.len, stats.overflow_count, stats.in_flight_sequence
        );
        Ok(buffer)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn push(&self, sample: &Sample) -> WatcherResult<i64> {
        let ids = self.push_all(std::slice::from_ref(sample)).await?;
        ids.first()
            .copied()
            .ok_or_else(|| WatcherError::Storage("Insert returned no id".to_string()))
    }

    /// Appends samples in order. Never waits for room: if the queue grows
    /// past capacity the oldest samples are evicted and counted.
    pub async fn push_all(&self, samples: &[Sample]) -> WatcherResult<Vec<i64>> {
        if samples.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(samples.len());

        for sample in samples {
            let result = sqlx::query(
                r#"
                INSERT INTO samples (
                    source_id, monotonic_ms, wall_clock_us, metric_name, value, unit, quality
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
            )
            .bind(&sample.source_id)
            .bind(sample.timestamp.monotonic_ms as i64)
            .bind(sample.timestamp.wall_clock.timestamp_micros())
            .bind(&sample.metric_name)
            .bind(sample.value)
            .bind(&sample.unit)
            .bind(sample.quality.as_str())
            .execute(&mut *tx)
            .await?;
            ids.push(result.last_insert_rowid());
        }

        let len = meta(&mut tx, META_LEN).await? + samples.len() as i64;
        let excess = len - self.capacity as i64;

        if excess > 0 {
            sqlx::query("DELETE FROM samples WHERE id IN (SELECT id FROM samples ORDER BY id LIMIT ?)")
                .bind(excess)
                .execute(&mut *tx)
                .await?;
            let overflow = meta(&mut tx, META_OVERFLOW).await? + excess;
            set_meta(&mut tx, META_OVERFLOW, overflow).await?;
            set_meta(&mut tx, META_LEN, self.capacity as i64).await?;
            debug!("🗑️  Buffer full, evicted {} oldest samples ({} total)", excess, overflow);
        } else {
            set_meta(&mut tx, META_LEN, len).await?;
        }

        tx.commit().await?;
        Ok(ids)
    }

    /// Returns the in-flight batch if one exists, else assigns the next
    /// sequence number to the oldest `max_batch_size` samples.
    pub async fn drain(&self, max_batch_size: usize) -> WatcherResult<Option<BufferedBatch>> {
        let mut tx = self.pool.begin().await?;

        let in_flight: Option<i64> = sqlx::query_scalar(
            "SELECT batch_seq FROM samples WHERE batch_seq IS NOT NULL ORDER BY id LIMIT 1",
        )
        .fetch_optional(&mut *tx)
        .await?;

        let sequence = match in_flight {
            Some(seq) => seq,
            None => {
                let seq = meta(&mut tx, META_NEXT_SEQ).await?;
                let assigned = sqlx::query(
                    "UPDATE samples SET batch_seq = ? WHERE id IN (SELECT id FROM samples ORDER BY id LIMIT ?)",
                )
                .bind(seq)
                .bind(max_batch_size.max(1) as i64)
                .execute(&mut *tx)
                .await?
                .rows_affected();

                if assigned == 0 {
                    tx.commit().await?;
                    return Ok(None);
                }
                set_meta(&mut tx, META_NEXT_SEQ, seq + 1).await?;
                seq
            }
        };

        let rows = sqlx::query_as::<_, SampleRow>(&format!(
            "SELECT {} FROM samples WHERE batch_seq = ? ORDER BY id",
            SELECT_COLUMNS
        ))
        .bind(sequence)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(BufferedBatch {
            sequence: sequence as u64,
            samples: rows.into_iter().map(SampleRow::into_buffered).collect(),
        }))
    }

    /// Releases a delivered batch. Acking an unknown or already acked
    /// sequence is a no-op.
    pub async fn ack(&self, sequence: u64) -> WatcherResult<u64> {
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query("DELETE FROM samples WHERE batch_seq = ?")
            .bind(sequence as i64)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if removed > 0 {
            let len = (meta(&mut tx, META_LEN).await? - removed as i64).max(0);
            set_meta(&mut tx, META_LEN, len).await?;
        }
        tx.commit().await?;
        Ok(removed)
    }

    pub async fn len(&self) -> WatcherResult<usize> {
        let mut conn = self.pool.acquire().await?;
        Ok(meta(&mut conn, META_LEN).await?.max(0) as usize)
    }

    pub async fn is_empty(&self) -> WatcherResult<bool> {
        Ok(self.len().await? == 0)
    }

    pub async fn overflow_count(&self) -> WatcherResult<u64> {
        let mut conn = self.pool.acquire().await?;
        Ok(meta(&mut conn, META_OVERFLOW).await?.max(0) as u64)
    }

    pub async fn stats(&self) -> WatcherResult<BufferStats> {
        let mut conn = self.pool.acquire().await?;
        let len = meta(&mut conn, META_LEN).await?.max(0) as usize;
        let overflow_count = meta(&mut conn, META_OVERFLOW).await?.max(0) as u64;
        let next_batch_sequence = meta(&mut conn, META_NEXT_SEQ).await?.max(1) as u64;

        let in_flight: Option<i64> = sqlx::query_scalar(
            "SELECT batch_seq FROM samples WHERE batch_seq IS NOT NULL ORDER BY id LIMIT 1",
        )
        .fetch_optional(&mut *conn)
        .await?;

        let oldest_us: Option<i64> =
            sqlx::query_scalar("SELECT wall_clock_us FROM samples ORDER BY id LIMIT 1")
                .fetch_optional(&mut *conn)
                .await?;

        Ok(BufferStats {
            len,
            capacity: self.capacity,
            overflow_count,
            next_batch_sequence,
            in_flight_sequence: in_flight.map(|s| s as u64),
            oldest_wall_clock: oldest_us.and_then(|us| Utc.timestamp_micros(us).single()),
        })
    }

    /// Watcher id that keys every batch sent from this buffer.
    ///
    /// A non-empty `configured` id is recorded and returned. Otherwise the
    /// stored id is reused, and one is minted only when the buffer has
    /// never had one, so replays after a restart carry the same key.
    pub async fn resolve_watcher_id(&self, configured: &str) -> WatcherResult<String> {
        let mut conn = self.pool.acquire().await?;
        let stored: Option<String> = sqlx::query_scalar("SELECT value FROM identity WHERE key = ?")
            .bind(IDENTITY_WATCHER_ID)
            .fetch_optional(&mut *conn)
            .await?;

        let id = match (configured.trim(), stored) {
            ("", Some(stored)) => return Ok(stored),
            ("", None) => {
                let minted = Uuid::new_v4().to_string();
                info!("🆔 New watcher id {}", minted);
                minted
            }
            (configured, Some(stored)) if configured == stored => return Ok(stored),
            (configured, stored) => {
                if let Some(stored) = stored {
                    warn!("⚠️  Configured watcher id {} replaces stored id {}", configured, stored);
                }
                configured.to_string()
            }
        };

        sqlx::query("INSERT INTO identity (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value")
            .bind(IDENTITY_WATCHER_ID)
            .bind(&id)
            .execute(&mut *conn)
            .await?;
        Ok(id)
    }

    /// Checkpoints the WAL into the main database file and closes the pool.
    pub async fn close(&self) {
        if let Err(e) = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(&self.pool).await {
            warn!("⚠️  WAL checkpoint failed on close: {}", e);
        }
        info!("🔒 Closing sample buffer");
        self.pool.close().await;
    }

    /// Recomputes the cached length from the table after an unclean stop.
    async fn repair_len(&self) -> WatcherResult<()> {
        let mut conn = self.pool.acquire().await?;
        let actual: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM samples")
            .fetch_one(&mut *conn)
            .await?;
        if meta(&mut conn, META_LEN).await? != actual {
            warn!("🔧 Sample buffer length out of sync, repaired to {}", actual);
            set_meta(&mut conn, META_LEN, actual).await?;
        }
        Ok(())
    }
}

async fn meta(conn: &mut SqliteConnection, key: &str) -> Result<i64, sqlx::Error> {
    let value: Option<i64> = sqlx::query_scalar("SELECT value FROM meta WHERE key = ?")
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(value.unwrap_or(0))
}

async fn set_meta(conn: &mut SqliteConnection, key: &str, value: i64) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO meta (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value")
        .bind(key)
        .bind(value)
        .execute(&mut *conn)
        .await?;
    Ok(())
}
