use log::info;
use sqlx::SqlitePool;

use crate::utils::error::{WatcherError, WatcherResult};

pub struct DatabaseMigrations;

impl DatabaseMigrations {
    pub async fn run_migrations(pool: &SqlitePool) -> WatcherResult<()> {
        info!("🔄 Running sample buffer migrations");

        // Create migration tracking table
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS migrations (
                id INTEGER PRIMARY KEY,
                version TEXT NOT NULL UNIQUE,
                applied_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
        "#,
        )
        .execute(pool)
        .await
        .map_err(|e| WatcherError::Storage(format!("Failed to create migrations table: {}", e)))?;

        Self::apply(pool, "v1", "Create samples and meta tables", &[
            r#"
            CREATE TABLE IF NOT EXISTS samples (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                batch_seq INTEGER,
                source_id TEXT NOT NULL,
                monotonic_ms INTEGER NOT NULL,
                wall_clock_us INTEGER NOT NULL,
                metric_name TEXT NOT NULL,
                value REAL NOT NULL,
                unit TEXT NOT NULL,
                quality TEXT NOT NULL DEFAULT 'good'
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            )
            "#,
            "INSERT OR IGNORE INTO meta (key, value) VALUES ('len', 0), ('overflow', 0), ('next_batch_seq', 1)",
        ])
        .await?;

        Self::apply(pool, "v2", "Index in-flight batches", &[
            "CREATE INDEX IF NOT EXISTS idx_samples_batch ON samples(batch_seq)",
        ])
        .await?;

        Self::apply(pool, "v3", "Create identity table", &[
            r#"
            CREATE TABLE IF NOT EXISTS identity (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        ])
        .await?;

        info!("✅ All migrations completed");
        Ok(())
    }

    async fn apply(pool: &SqlitePool, version: &str, description: &str, statements: &[&str]) -> WatcherResult<()> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM migrations WHERE version = ?)")
            .bind(version)
            .fetch_one(pool)
            .await
            .map_err(|e| WatcherError::Storage(format!("Failed to check migration {}: {}", version, e)))?;

        if exists {
            return Ok(());
        }

        info!("📦 Applying migration {}: {}", version, description);
        let mut tx = pool.begin().await?;
        for statement in statements {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| WatcherError::Storage(format!("Migration {} failed: {}", version, e)))?;
        }

        // Record migration
        sqlx::query("INSERT INTO migrations (version) VALUES (?)")
            .bind(version)
            .execute(&mut *tx)
            .await
            .map_err(|e| WatcherError::Storage(format!("Failed to record migration {}: {}", version, e)))?;
        tx.commit().await?;

        Ok(())
    }
}
