//! SQLite-backed index.
//!
//! Embeddings are stored as BLOBs next to their metadata; search is a
//! brute-force cosine scan over the rows of the requested source kinds.
//! Each entry is one row written by one statement, so a concurrent reader
//! never observes a half-written entry.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::path::Path;

use super::{rank, EntryRef, IndexStats, SyncState, SyncStateStore, VectorIndex};
use crate::db;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::RetrievalError;
use crate::migrate;
use crate::models::{EntryMetadata, IndexEntry, ScoredId, SourceKind};

#[derive(Clone)]
pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open the database at `path` and make sure the schema exists.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect_path(path).await?;
        migrate::migrate(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn write_failed(e: sqlx::Error) -> RetrievalError {
    RetrievalError::IndexWriteFailed(e.to_string())
}

fn read_failed(e: sqlx::Error) -> RetrievalError {
    RetrievalError::IndexReadFailed(e.to_string())
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn parse_kind(s: &str) -> Result<SourceKind, RetrievalError> {
    s.parse()
        .map_err(|e: anyhow::Error| RetrievalError::IndexReadFailed(e.to_string()))
}

async fn upsert_one<'e, E>(executor: E, entry: &IndexEntry) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let m = &entry.metadata;
    sqlx::query(
        r#"
        INSERT INTO index_entries
            (id, source_kind, source_path, uri, title, content_hash,
             last_indexed_at, body_text, embedding, dims)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            source_kind = excluded.source_kind,
            source_path = excluded.source_path,
            uri = excluded.uri,
            title = excluded.title,
            content_hash = excluded.content_hash,
            last_indexed_at = excluded.last_indexed_at,
            body_text = excluded.body_text,
            embedding = excluded.embedding,
            dims = excluded.dims
        "#,
    )
    .bind(&entry.id)
    .bind(m.source_kind.as_str())
    .bind(&m.source_path)
    .bind(&m.uri)
    .bind(&m.title)
    .bind(&m.content_hash)
    .bind(to_millis(m.last_indexed_at))
    .bind(&entry.body_text)
    .bind(vec_to_blob(&entry.embedding))
    .bind(entry.embedding.len() as i64)
    .execute(executor)
    .await?;
    Ok(())
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    async fn upsert(&self, entry: IndexEntry) -> Result<(), RetrievalError> {
        upsert_one(&self.pool, &entry).await.map_err(write_failed)
    }

    async fn upsert_batch(&self, entries: Vec<IndexEntry>) -> Result<(), RetrievalError> {
        let mut tx = self.pool.begin().await.map_err(write_failed)?;
        for entry in &entries {
            upsert_one(&mut *tx, entry).await.map_err(write_failed)?;
        }
        tx.commit().await.map_err(write_failed)
    }

    async fn delete(&self, id: &str) -> Result<(), RetrievalError> {
        sqlx::query("DELETE FROM index_entries WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(write_failed)?;
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        kinds: &[SourceKind],
    ) -> Result<Vec<ScoredId>, RetrievalError> {
        if kinds.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; kinds.len()].join(", ");
        let sql = format!(
            "SELECT id, last_indexed_at, embedding FROM index_entries WHERE source_kind IN ({})",
            placeholders
        );
        let mut q = sqlx::query(&sql);
        for kind in kinds {
            q = q.bind(kind.as_str());
        }
        let rows = q.fetch_all(&self.pool).await.map_err(read_failed)?;

        let mut hits: Vec<ScoredId> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                ScoredId {
                    id: row.get("id"),
                    score: cosine_similarity(query, &blob_to_vec(&blob)) as f64,
                    last_indexed_at: from_millis(row.get("last_indexed_at")),
                }
            })
            .collect();
        hits.sort_by(rank);
        hits.truncate(k);
        Ok(hits)
    }

    async fn get(&self, id: &str) -> Result<Option<IndexEntry>, RetrievalError> {
        let row = sqlx::query(
            "SELECT id, source_kind, source_path, uri, title, content_hash, last_indexed_at, \
             body_text, embedding FROM index_entries WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(read_failed)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let kind: String = row.get("source_kind");
        let blob: Vec<u8> = row.get("embedding");
        Ok(Some(IndexEntry {
            id: row.get("id"),
            embedding: blob_to_vec(&blob),
            metadata: EntryMetadata {
                source_kind: parse_kind(&kind)?,
                source_path: row.get("source_path"),
                uri: row.get("uri"),
                title: row.get("title"),
                content_hash: row.get("content_hash"),
                last_indexed_at: from_millis(row.get("last_indexed_at")),
            },
            body_text: row.get("body_text"),
        }))
    }

    async fn stored_hash(&self, id: &str) -> Result<Option<String>, RetrievalError> {
        sqlx::query_scalar("SELECT content_hash FROM index_entries WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(read_failed)
    }

    async fn entries_for(&self, kind: SourceKind) -> Result<Vec<EntryRef>, RetrievalError> {
        let rows = sqlx::query(
            "SELECT id, source_path FROM index_entries WHERE source_kind = ? ORDER BY source_path",
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(read_failed)?;

        Ok(rows
            .iter()
            .map(|row| EntryRef {
                id: row.get("id"),
                source_path: row.get("source_path"),
            })
            .collect())
    }

    async fn stats(&self) -> Result<IndexStats, RetrievalError> {
        let rows = sqlx::query(
            "SELECT source_kind, COUNT(*) AS entries, MAX(last_indexed_at) AS last_indexed_at \
             FROM index_entries GROUP BY source_kind",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(read_failed)?;

        let mut stats = IndexStats::default();
        for row in rows {
            let kind: String = row.get("source_kind");
            let entries: i64 = row.get("entries");
            let last: Option<i64> = row.get("last_indexed_at");
            stats.total += entries as usize;
            let s = stats.per_source.entry(parse_kind(&kind)?).or_default();
            s.entries = entries as usize;
            s.last_indexed_at = last.map(from_millis);
        }
        Ok(stats)
    }
}

#[async_trait]
impl SyncStateStore for SqliteIndex {
    async fn load(&self, kind: SourceKind) -> Result<SyncState, RetrievalError> {
        let row = sqlx::query(
            "SELECT cursor, last_reconciled_at, retry_paths, empty_paths FROM sync_state WHERE source_kind = ?",
        )
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(read_failed)?;

        let Some(row) = row else {
            return Ok(SyncState::default());
        };
        let cursor: Option<i64> = row.get("cursor");
        let reconciled: Option<i64> = row.get("last_reconciled_at");
        let path_list = |column: &str| -> Vec<String> {
            let json: String = row.get(column);
            serde_json::from_str(&json).unwrap_or_else(|e| {
                tracing::warn!(source = %kind, column, error = %e, "discarding unreadable path list");
                Vec::new()
            })
        };

        Ok(SyncState {
            cursor: cursor.map(from_millis),
            last_reconciled_at: reconciled.map(from_millis),
            retry_paths: path_list("retry_paths"),
            empty_paths: path_list("empty_paths"),
        })
    }

    async fn save(&self, kind: SourceKind, state: &SyncState) -> Result<(), RetrievalError> {
        let to_json = |paths: &Vec<String>| {
            serde_json::to_string(paths).map_err(|e| RetrievalError::IndexWriteFailed(e.to_string()))
        };
        let retry_json = to_json(&state.retry_paths)?;
        let empty_json = to_json(&state.empty_paths)?;
        sqlx::query(
            r#"
            INSERT INTO sync_state (source_kind, cursor, last_reconciled_at, retry_paths, empty_paths, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_kind) DO UPDATE SET
                cursor = excluded.cursor,
                last_reconciled_at = excluded.last_reconciled_at,
                retry_paths = excluded.retry_paths,
                empty_paths = excluded.empty_paths,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(kind.as_str())
        .bind(state.cursor.map(to_millis))
        .bind(state.last_reconciled_at.map(to_millis))
        .bind(retry_json)
        .bind(empty_json)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(write_failed)?;
        Ok(())
    }
}
