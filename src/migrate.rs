use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the ledger tables on an open pool. Idempotent.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // `seq` gives the stable storage order used for paged streaming.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS files (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            site_id TEXT NOT NULL,
            size INTEGER,
            created_at INTEGER,
            created_by_id TEXT,
            updated_at INTEGER,
            updated_by_id TEXT,
            link TEXT NOT NULL,
            target_path TEXT NOT NULL,
            status INTEGER NOT NULL DEFAULT 0,
            registered_at INTEGER NOT NULL,
            status_changed_at INTEGER NOT NULL,
            claimed_by TEXT,
            claimed_until INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sites (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_status ON files(status, seq)")
        .execute(pool)
        .await?;

    Ok(())
}
