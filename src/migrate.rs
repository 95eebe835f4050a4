use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;

/// `fedr init`: create the database and its tables.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Idempotent schema setup. Safe to run on every start.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    // One row per IndexEntry; the embedding is a little-endian f32 BLOB.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_entries (
            id TEXT PRIMARY KEY,
            source_kind TEXT NOT NULL,
            source_path TEXT NOT NULL,
            uri TEXT NOT NULL,
            title TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            last_indexed_at INTEGER NOT NULL,
            body_text TEXT NOT NULL,
            embedding BLOB NOT NULL,
            dims INTEGER NOT NULL,
            UNIQUE(source_kind, source_path)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_state (
            source_kind TEXT PRIMARY KEY,
            cursor INTEGER,
            last_reconciled_at INTEGER,
            retry_paths TEXT NOT NULL DEFAULT '[]',
            empty_paths TEXT NOT NULL DEFAULT '[]',
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Databases created before empty paths were tracked.
    if !column_exists(pool, "sync_state", "empty_paths").await? {
        sqlx::query("ALTER TABLE sync_state ADD COLUMN empty_paths TEXT NOT NULL DEFAULT '[]'")
            .execute(pool)
            .await?;
    }

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_index_entries_source_kind ON index_entries(source_kind)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn column_exists(pool: &SqlitePool, table: &str, column: &str) -> Result<bool> {
    let rows = sqlx::query(&format!("PRAGMA table_info({})", table))
        .fetch_all(pool)
        .await?;
    Ok(rows
        .iter()
        .any(|row| row.get::<String, _>("name") == column))
}
