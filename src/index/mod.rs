//! Vector index and sync-state storage.
//!
//! The index is the single source of truth for what is retrievable. Only
//! the indexer writes to it; the planner only reads. Similarity is cosine
//! over the stored embeddings, for every entry, in every implementation.
//!
//! Two implementations:
//! - [`SqliteIndex`]: persistent, one row per entry in `index_entries`
//! - [`MemoryIndex`]: a locked map, for tests and throwaway runs

mod memory;
mod sqlite;

pub use memory::MemoryIndex;
pub use sqlite::SqliteIndex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::error::RetrievalError;
use crate::models::{IndexEntry, ScoredId, SourceKind};

/// `(id, source_path)` of an indexed entry.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryRef {
    pub id: String,
    pub source_path: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexStats {
    pub total: usize,
    pub per_source: BTreeMap<SourceKind, SourceStats>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceStats {
    pub entries: usize,
    pub last_indexed_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace an entry. The replacement is atomic: readers see
    /// either the old entry or the new one.
    async fn upsert(&self, entry: IndexEntry) -> Result<(), RetrievalError>;

    /// Upsert several entries in one transaction.
    async fn upsert_batch(&self, entries: Vec<IndexEntry>) -> Result<(), RetrievalError> {
        for entry in entries {
            self.upsert(entry).await?;
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), RetrievalError>;

    /// The `k` most similar entries whose kind is in `kinds`, best first.
    /// Equal scores prefer the more recently indexed entry.
    async fn search(
        &self,
        query: &[f32],
        k: usize,
        kinds: &[SourceKind],
    ) -> Result<Vec<ScoredId>, RetrievalError>;

    async fn get(&self, id: &str) -> Result<Option<IndexEntry>, RetrievalError>;

    /// Stored `content_hash` for `id`, if indexed.
    async fn stored_hash(&self, id: &str) -> Result<Option<String>, RetrievalError>;

    async fn entries_for(&self, kind: SourceKind) -> Result<Vec<EntryRef>, RetrievalError>;

    async fn stats(&self) -> Result<IndexStats, RetrievalError>;
}

/// Per-source bookkeeping for incremental sync.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncState {
    /// Greatest `last_modified` already processed.
    pub cursor: Option<DateTime<Utc>>,
    pub last_reconciled_at: Option<DateTime<Utc>>,
    /// Paths that failed on an earlier pass and are fetched again on the next.
    pub retry_paths: Vec<String>,
    /// Listed paths that yielded nothing to index. They are not fetched
    /// again until they change.
    pub empty_paths: Vec<String>,
}

#[async_trait]
pub trait SyncStateStore: Send + Sync {
    async fn load(&self, kind: SourceKind) -> Result<SyncState, RetrievalError>;
    async fn save(&self, kind: SourceKind, state: &SyncState) -> Result<(), RetrievalError>;
}

/// Best-first ordering shared by every index: score descending, then
/// `last_indexed_at` descending, then id ascending so results are stable.
pub fn rank(a: &ScoredId, b: &ScoredId) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then(b.last_indexed_at.cmp(&a.last_indexed_at))
        .then(a.id.cmp(&b.id))
}
