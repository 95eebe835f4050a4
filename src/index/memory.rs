//! In-process index behind a read/write lock.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

use super::{rank, EntryRef, IndexStats, SyncState, SyncStateStore, VectorIndex};
use crate::embedding::cosine_similarity;
use crate::error::RetrievalError;
use crate::models::{IndexEntry, ScoredId, SourceKind};

#[derive(Default)]
pub struct MemoryIndex {
    entries: RwLock<HashMap<String, IndexEntry>>,
    sync_state: RwLock<HashMap<SourceKind, SyncState>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, IndexEntry>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, IndexEntry>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn upsert(&self, entry: IndexEntry) -> Result<(), RetrievalError> {
        self.write().insert(entry.id.clone(), entry);
        Ok(())
    }

    async fn upsert_batch(&self, entries: Vec<IndexEntry>) -> Result<(), RetrievalError> {
        let mut map = self.write();
        for entry in entries {
            map.insert(entry.id.clone(), entry);
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), RetrievalError> {
        self.write().remove(id);
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        kinds: &[SourceKind],
    ) -> Result<Vec<ScoredId>, RetrievalError> {
        let mut hits: Vec<ScoredId> = self
            .read()
            .values()
            .filter(|e| kinds.contains(&e.metadata.source_kind))
            .map(|e| ScoredId {
                id: e.id.clone(),
                score: cosine_similarity(query, &e.embedding) as f64,
                last_indexed_at: e.metadata.last_indexed_at,
            })
            .collect();
        hits.sort_by(rank);
        hits.truncate(k);
        Ok(hits)
    }

    async fn get(&self, id: &str) -> Result<Option<IndexEntry>, RetrievalError> {
        Ok(self.read().get(id).cloned())
    }

    async fn stored_hash(&self, id: &str) -> Result<Option<String>, RetrievalError> {
        Ok(self.read().get(id).map(|e| e.metadata.content_hash.clone()))
    }

    async fn entries_for(&self, kind: SourceKind) -> Result<Vec<EntryRef>, RetrievalError> {
        let mut refs: Vec<EntryRef> = self
            .read()
            .values()
            .filter(|e| e.metadata.source_kind == kind)
            .map(|e| EntryRef {
                id: e.id.clone(),
                source_path: e.metadata.source_path.clone(),
            })
            .collect();
        refs.sort_by(|a, b| a.source_path.cmp(&b.source_path));
        Ok(refs)
    }

    async fn stats(&self) -> Result<IndexStats, RetrievalError> {
        let map = self.read();
        let mut stats = IndexStats {
            total: map.len(),
            ..IndexStats::default()
        };
        for entry in map.values() {
            let s = stats
                .per_source
                .entry(entry.metadata.source_kind)
                .or_default();
            s.entries += 1;
            s.last_indexed_at = s.last_indexed_at.max(Some(entry.metadata.last_indexed_at));
        }
        Ok(stats)
    }
}

#[async_trait]
impl SyncStateStore for MemoryIndex {
    async fn load(&self, kind: SourceKind) -> Result<SyncState, RetrievalError> {
        Ok(self
            .sync_state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .cloned()
            .unwrap_or_default())
    }

    async fn save(&self, kind: SourceKind, state: &SyncState) -> Result<(), RetrievalError> {
        self.sync_state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(kind, state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntryMetadata;
    use chrono::Utc;

    fn entry(id: &str, kind: SourceKind, embedding: Vec<f32>) -> IndexEntry {
        IndexEntry {
            id: id.to_string(),
            embedding,
            metadata: EntryMetadata {
                source_kind: kind,
                source_path: format!("{}.txt", id),
                uri: format!("file:///{}.txt", id),
                title: id.to_string(),
                content_hash: format!("hash-{}", id),
                last_indexed_at: Utc::now(),
            },
            body_text: format!("body of {}", id),
        }
    }

    #[tokio::test]
    async fn search_filters_by_kind_and_bounds_k() {
        let index = MemoryIndex::new();
        index
            .upsert_batch(vec![
                entry("s1", SourceKind::Share, vec![1.0, 0.0]),
                entry("s2", SourceKind::Share, vec![0.7, 0.7]),
                entry("w1", SourceKind::Wiki, vec![1.0, 0.0]),
            ])
            .await
            .unwrap();

        let hits = index.search(&[1.0, 0.0], 1, &[SourceKind::Share]).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "s1");

        let hits = index.search(&[1.0, 0.0], 10, &[SourceKind::Wiki]).await.unwrap();
        assert_eq!(hits.iter().map(|h| h.id.as_str()).collect::<Vec<_>>(), vec!["w1"]);
    }

    #[tokio::test]
    async fn upsert_overwrites_and_delete_removes() {
        let index = MemoryIndex::new();
        index.upsert(entry("a", SourceKind::Share, vec![1.0])).await.unwrap();
        let mut updated = entry("a", SourceKind::Share, vec![1.0]);
        updated.metadata.content_hash = "new".into();
        index.upsert(updated).await.unwrap();

        assert_eq!(index.len(), 1);
        assert_eq!(index.stored_hash("a").await.unwrap().as_deref(), Some("new"));

        index.delete("a").await.unwrap();
        assert!(index.get("a").await.unwrap().is_none());
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn stats_per_source() {
        let index = MemoryIndex::new();
        index
            .upsert_batch(vec![
                entry("s1", SourceKind::Share, vec![1.0]),
                entry("s2", SourceKind::Share, vec![1.0]),
                entry("p1", SourceKind::PublicPortal, vec![1.0]),
            ])
            .await
            .unwrap();
        let stats = index.stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.per_source[&SourceKind::Share].entries, 2);
        assert_eq!(stats.per_source[&SourceKind::PublicPortal].entries, 1);
    }

    #[tokio::test]
    async fn sync_state_round_trip() {
        let index = MemoryIndex::new();
        assert_eq!(index.load(SourceKind::Wiki).await.unwrap(), SyncState::default());
        let state = SyncState {
            cursor: Some(Utc::now()),
            last_reconciled_at: None,
            retry_paths: vec!["a".into()],
            empty_paths: vec!["b".into()],
        };
        index.save(SourceKind::Wiki, &state).await.unwrap();
        assert_eq!(index.load(SourceKind::Wiki).await.unwrap(), state);
    }
}
