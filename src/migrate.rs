use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the redirect table. Idempotent; the content tables belong to the
/// content system and are never created or altered here.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    ensure_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    // from_path uniqueness is what makes re-runs safe: a second insert of the
    // same legacy path is skipped, never overwritten.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS redirects (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            from_path TEXT NOT NULL,
            to_path TEXT NOT NULL,
            status_code INTEGER NOT NULL DEFAULT 301,
            content_id TEXT,
            created_at INTEGER NOT NULL,
            UNIQUE(from_path)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_redirects_to_path ON redirects(to_path)")
        .execute(pool)
        .await?;

    Ok(())
}
