//! Incremental, idempotent indexing.
//!
//! One [`Indexer::sync`] pass over a source kind:
//!
//! 1. list the source against the stored cursor (or in full, on a
//!    reconciliation pass)
//! 2. delete entries whose paths the listing no longer reports
//! 3. fetch and normalize changed paths, earlier failures and present
//!    paths missing from the index, with bounded concurrency
//! 4. skip documents whose `content_hash` matches the stored one
//! 5. embed the rest in batches and upsert
//! 6. persist the new cursor and the paths to retry
//!
//! Per-path failures never abort a pass; they are counted and retried on
//! the next one. Passes over the same kind are serialized; passes over
//! different kinds may run in parallel.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

use crate::config::{EmbeddingConfig, SyncConfig};
use crate::connector::{Connector, ConnectorRegistry};
use crate::embedding::Embedder;
use crate::error::{FetchError, RetrievalError};
use crate::index::{SyncState, SyncStateStore, VectorIndex};
use crate::models::{Document, IndexEntry, SkippedPath, SourceKind};
use crate::normalize::{self, document_id};
use crate::session::SessionStore;

/// Knobs for a pass, collected from `[sync]` and `[embedding]`.
#[derive(Debug, Clone)]
pub struct IndexerSettings {
    pub fetch_concurrency: usize,
    pub max_body_chars: usize,
    pub embed_batch_size: usize,
    pub max_input_chars: usize,
    pub reconciliation_interval: chrono::Duration,
}

impl IndexerSettings {
    pub fn from_config(sync: &SyncConfig, embedding: &EmbeddingConfig) -> Self {
        Self {
            fetch_concurrency: sync.fetch_concurrency.max(1),
            max_body_chars: sync.max_body_chars,
            embed_batch_size: embedding.batch_size.max(1),
            max_input_chars: embedding.max_input_chars,
            reconciliation_interval: chrono::Duration::seconds(
                sync.reconciliation_interval_secs as i64,
            ),
        }
    }
}

/// Outcome of one pass, printed by `fedr sync` and returned by `/sync`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub source_kind: Option<SourceKind>,
    /// Full re-fetch instead of a cursor-based listing.
    pub reconciled: bool,
    pub listed: usize,
    pub fetched: usize,
    /// Fetched, but the content hash matched the index.
    pub unchanged: usize,
    pub embedded: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Paths still waiting for a retry after this pass.
    pub retry_pending: usize,
    pub embed_calls: usize,
    /// The session was rejected mid-pass; the rest waits for a login.
    pub auth_required: bool,
    pub duration_ms: u64,
    pub skipped_paths: Vec<SkippedPath>,
}

enum Fetched {
    Document(Document),
    /// Fetched, but nothing retrievable inside.
    Empty,
    Gone,
    Failed(String),
    AuthLost,
}

pub struct Indexer {
    connectors: ConnectorRegistry,
    index: Arc<dyn VectorIndex>,
    state: Arc<dyn SyncStateStore>,
    embedder: Arc<dyn Embedder>,
    sessions: Arc<SessionStore>,
    settings: IndexerSettings,
    passes: BTreeMap<SourceKind, Mutex<()>>,
}

impl Indexer {
    pub fn new(
        connectors: ConnectorRegistry,
        index: Arc<dyn VectorIndex>,
        state: Arc<dyn SyncStateStore>,
        embedder: Arc<dyn Embedder>,
        sessions: Arc<SessionStore>,
        settings: IndexerSettings,
    ) -> Self {
        let passes = SourceKind::ALL.iter().map(|k| (*k, Mutex::new(()))).collect();
        Self {
            connectors,
            index,
            state,
            embedder,
            sessions,
            settings,
            passes,
        }
    }

    /// Run one pass over `kind`.
    ///
    /// Errors only when the pass cannot start: the kind has no connector,
    /// needs a login, or its listing fails.
    pub async fn sync(&self, kind: SourceKind) -> Result<SyncReport, RetrievalError> {
        let connector = self
            .connectors
            .get(kind)
            .ok_or_else(|| RetrievalError::SourceUnreachable {
                source_kind: kind,
                message: "no connector configured".to_string(),
            })?;
        if kind.requires_credential() && self.sessions.get(kind).is_none() {
            return Err(RetrievalError::AuthenticationRequired { source_kind: kind });
        }

        let _pass = match self.passes.get(&kind) {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };
        let started = Instant::now();
        let now = Utc::now();
        let previous = self.state.load(kind).await?;
        let reconcile = previous.cursor.is_none()
            || previous
                .last_reconciled_at
                .map_or(true, |t| now - t >= self.settings.reconciliation_interval);

        let mut report = SyncReport {
            source_kind: Some(kind),
            reconciled: reconcile,
            ..SyncReport::default()
        };

        let listing = connector
            .list_changed_since(if reconcile { None } else { previous.cursor })
            .await
            .map_err(|e| e.into_retrieval(kind))?;

        report.listed = listing.changed.len() + listing.unchanged.len();
        report.skipped = listing.skipped.len();
        for skipped in &listing.skipped {
            tracing::warn!(source = %kind, path = %skipped.source_path, reason = %skipped.reason, "skipped path");
        }
        report.skipped_paths = listing.skipped.clone();

        let present: HashSet<&str> = listing.present_paths().collect();

        // Deletions.
        let mut indexed: HashSet<String> = HashSet::new();
        for entry in self.index.entries_for(kind).await? {
            if present.contains(entry.source_path.as_str())
                || is_shadowed(&entry.source_path, &listing.skipped)
            {
                indexed.insert(entry.source_path);
                continue;
            }
            self.index.delete(&entry.id).await?;
            report.deleted += 1;
            tracing::info!(source = %kind, path = %entry.source_path, "removed deleted document");
        }

        // Changed paths first, then earlier failures still present, then
        // unchanged paths the index has never seen (moved or restored files
        // keep their old modification time).
        let previously_empty: HashSet<&str> =
            previous.empty_paths.iter().map(String::as_str).collect();
        let mut to_fetch: Vec<String> = Vec::new();
        let mut seen = BTreeSet::new();
        for changed in &listing.changed {
            if seen.insert(changed.source_path.as_str()) {
                to_fetch.push(changed.source_path.clone());
            }
        }
        for path in &previous.retry_paths {
            if present.contains(path.as_str()) && seen.insert(path.as_str()) {
                to_fetch.push(path.clone());
            }
        }
        for path in &listing.unchanged {
            if !indexed.contains(path)
                && !previously_empty.contains(path.as_str())
                && seen.insert(path.as_str())
            {
                to_fetch.push(path.clone());
            }
        }

        // Still empty unless fetched again this pass.
        let mut empty: BTreeSet<String> = previous
            .empty_paths
            .iter()
            .filter(|p| present.contains(p.as_str()) && !seen.contains(p.as_str()))
            .cloned()
            .collect();

        let auth_lost = Arc::new(AtomicBool::new(false));
        let max_body_chars = self.settings.max_body_chars;
        let outcomes: Vec<(String, Fetched)> = stream::iter(to_fetch)
            .map(|path| {
                let connector = Arc::clone(&connector);
                let auth_lost = Arc::clone(&auth_lost);
                async move {
                    let outcome =
                        fetch_one(connector.as_ref(), kind, &path, max_body_chars, &auth_lost)
                            .await;
                    (path, outcome)
                }
            })
            .buffer_unordered(self.settings.fetch_concurrency)
            .collect()
            .await;

        let mut retry: BTreeSet<String> = BTreeSet::new();
        let mut pending: Vec<Document> = Vec::new();
        for (path, outcome) in outcomes {
            match outcome {
                Fetched::Document(doc) => {
                    report.fetched += 1;
                    if self.index.stored_hash(&doc.id).await?.as_deref()
                        == Some(doc.content_hash.as_str())
                    {
                        report.unchanged += 1;
                    } else {
                        pending.push(doc);
                    }
                }
                Fetched::Empty => {
                    report.fetched += 1;
                    report.skipped += 1;
                    let id = document_id(kind, &path);
                    if self.index.stored_hash(&id).await?.is_some() {
                        self.index.delete(&id).await?;
                        report.deleted += 1;
                    }
                    empty.insert(path);
                }
                Fetched::Gone => {
                    let id = document_id(kind, &path);
                    if self.index.stored_hash(&id).await?.is_some() {
                        self.index.delete(&id).await?;
                        report.deleted += 1;
                    }
                    empty.insert(path);
                }
                Fetched::Failed(reason) => {
                    tracing::warn!(source = %kind, path = %path, reason = %reason, "fetch failed; will retry");
                    report.failed += 1;
                    retry.insert(path);
                }
                Fetched::AuthLost => {
                    report.auth_required = true;
                }
            }
        }

        for batch in chunked(pending, self.settings.embed_batch_size) {
            let paths: Vec<String> = batch.iter().map(|d| d.source_path.clone()).collect();
            match self.embed_and_store(batch).await {
                Ok(n) => {
                    report.embed_calls += 1;
                    report.embedded += n;
                }
                Err(e) => {
                    tracing::warn!(source = %kind, documents = paths.len(), error = %e, "embedding batch failed; will retry");
                    report.embed_calls += 1;
                    report.failed += paths.len();
                    retry.extend(paths);
                }
            }
        }

        // The cursor only moves when every fetched path has been handled;
        // paths that failed move into the retry list instead.
        let mut next = SyncState {
            cursor: previous.cursor,
            last_reconciled_at: previous.last_reconciled_at,
            retry_paths: retry.into_iter().collect(),
            empty_paths: empty.into_iter().collect(),
        };
        if !report.auth_required {
            let newest = listing
                .changed
                .iter()
                .filter_map(|c| c.last_modified)
                .max();
            next.cursor = max_time(previous.cursor, newest).or(Some(now));
            if reconcile {
                next.last_reconciled_at = Some(now);
            }
        } else {
            tracing::warn!(source = %kind, "session rejected during sync; remaining paths wait for login");
            next.retry_paths.extend(
                previous
                    .retry_paths
                    .iter()
                    .filter(|p| present.contains(p.as_str()))
                    .cloned(),
            );
            next.retry_paths.sort();
            next.retry_paths.dedup();
        }
        report.retry_pending = next.retry_paths.len();
        self.state.save(kind, &next).await?;

        report.duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            source = %kind,
            reconciled = report.reconciled,
            listed = report.listed,
            fetched = report.fetched,
            embedded = report.embedded,
            unchanged = report.unchanged,
            deleted = report.deleted,
            failed = report.failed,
            "sync finished"
        );
        Ok(report)
    }

    async fn embed_and_store(&self, batch: Vec<Document>) -> Result<usize, RetrievalError> {
        let texts: Vec<String> = batch
            .iter()
            .map(|d| embedding_input(d, self.settings.max_input_chars))
            .collect();
        let vectors = self.embedder.embed(&texts).await.map_err(|e| {
            RetrievalError::IndexWriteFailed(format!("embedding failed: {:#}", e))
        })?;
        if vectors.len() != batch.len() {
            return Err(RetrievalError::IndexWriteFailed(format!(
                "embedder returned {} vectors for {} documents",
                vectors.len(),
                batch.len()
            )));
        }

        let indexed_at = Utc::now();
        let entries: Vec<IndexEntry> = batch
            .into_iter()
            .zip(vectors)
            .map(|(doc, vector)| IndexEntry::from_document(doc, vector, indexed_at))
            .collect();
        let n = entries.len();
        self.index.upsert_batch(entries).await?;
        Ok(n)
    }
}

async fn fetch_one(
    connector: &dyn Connector,
    kind: SourceKind,
    path: &str,
    max_body_chars: usize,
    auth_lost: &AtomicBool,
) -> Fetched {
    if auth_lost.load(Ordering::Relaxed) {
        return Fetched::AuthLost;
    }
    let raw = match connector.fetch(path).await {
        Ok(raw) => raw,
        Err(FetchError::AuthenticationRequired) => {
            auth_lost.store(true, Ordering::Relaxed);
            return Fetched::AuthLost;
        }
        Err(FetchError::NotFound(_)) => return Fetched::Gone,
        Err(e) => return Fetched::Failed(e.to_string()),
    };

    let owned_path = path.to_string();
    let normalized = tokio::task::spawn_blocking(move || {
        normalize::normalize(kind, &owned_path, &raw, max_body_chars)
    })
    .await;

    match normalized {
        Ok(Ok(Some(doc))) => Fetched::Document(doc),
        Ok(Ok(None)) => {
            tracing::info!(source = %kind, path = %path, "no text content; skipped");
            Fetched::Empty
        }
        Ok(Err(e)) => Fetched::Failed(e.to_string()),
        Err(e) => Fetched::Failed(format!("normalizer panicked: {}", e)),
    }
}

/// Title plus body, cut to the embedder's input budget.
fn embedding_input(doc: &Document, max_chars: usize) -> String {
    let text = format!("{}\n\n{}", doc.title, doc.body_text);
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text,
    }
}

/// Whether `path` lies under a path the listing could not read. An empty
/// skipped path stands for the whole source.
fn is_shadowed(path: &str, skipped: &[SkippedPath]) -> bool {
    skipped.iter().any(|s| {
        let prefix = s.source_path.trim_end_matches('/');
        prefix.is_empty()
            || path == prefix
            || path
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('/'))
    })
}

fn max_time(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

fn chunked<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let mut batches = Vec::new();
    let mut iter = items.into_iter().peekable();
    while iter.peek().is_some() {
        batches.push(iter.by_ref().take(size).collect());
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::MemoryIndex;
    use crate::models::{ChangedPath, Listing, RawContent};
    use crate::connector::ConnectorHealth;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU64, AtomicUsize};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct FakeSource {
        kind: SourceKind,
        files: StdMutex<BTreeMap<String, (String, DateTime<Utc>)>>,
        broken: StdMutex<HashSet<String>>,
        skipped: StdMutex<Vec<SkippedPath>>,
        reject_credential: AtomicBool,
        fetches: AtomicUsize,
        fetch_delay_ms: AtomicU64,
    }

    impl FakeSource {
        fn new(kind: SourceKind) -> Self {
            Self {
                kind,
                files: StdMutex::default(),
                broken: StdMutex::default(),
                skipped: StdMutex::default(),
                reject_credential: AtomicBool::new(false),
                fetches: AtomicUsize::new(0),
                fetch_delay_ms: AtomicU64::new(0),
            }
        }
        fn put(&self, path: &str, body: &str, hour: u32) {
            let ts = Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap();
            self.files
                .lock()
                .unwrap()
                .insert(path.to_string(), (body.to_string(), ts));
        }
        fn remove(&self, path: &str) {
            self.files.lock().unwrap().remove(path);
        }
    }

    #[async_trait]
    impl Connector for FakeSource {
        fn kind(&self) -> SourceKind {
            self.kind
        }
        fn description(&self) -> String {
            "fake".into()
        }
        async fn list_changed_since(
            &self,
            cursor: Option<DateTime<Utc>>,
        ) -> Result<Listing, FetchError> {
            let mut listing = Listing::default();
            for (path, (_, ts)) in self.files.lock().unwrap().iter() {
                listing.push(
                    ChangedPath {
                        source_path: path.clone(),
                        last_modified: Some(*ts),
                    },
                    cursor,
                );
            }
            listing.skipped = self.skipped.lock().unwrap().clone();
            Ok(listing)
        }
        async fn fetch(&self, source_path: &str) -> Result<RawContent, FetchError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let delay = self.fetch_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if self.reject_credential.load(Ordering::SeqCst) {
                return Err(FetchError::AuthenticationRequired);
            }
            if self.broken.lock().unwrap().contains(source_path) {
                return Err(FetchError::permanent("disk error"));
            }
            let files = self.files.lock().unwrap();
            let (body, _) = files
                .get(source_path)
                .ok_or_else(|| FetchError::NotFound(source_path.to_string()))?;
            Ok(RawContent {
                bytes: body.as_bytes().to_vec(),
                content_type: "text/plain".into(),
                uri: format!("file:///share/{}", source_path),
                title_hint: Some(source_path.to_string()),
            })
        }
        async fn health(&self) -> ConnectorHealth {
            ConnectorHealth::ok("fake")
        }
    }

    #[derive(Default)]
    struct CountingEmbedder {
        calls: AtomicUsize,
        texts: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        fn model_name(&self) -> &str {
            "counting"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.texts.fetch_add(texts.len(), Ordering::SeqCst);
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    struct Harness {
        source: Arc<FakeSource>,
        index: Arc<MemoryIndex>,
        embedder: Arc<CountingEmbedder>,
        sessions: Arc<SessionStore>,
        indexer: Indexer,
    }

    fn harness() -> Harness {
        harness_for(SourceKind::Share)
    }

    fn harness_for(kind: SourceKind) -> Harness {
        let source = Arc::new(FakeSource::new(kind));
        let index = Arc::new(MemoryIndex::new());
        let embedder = Arc::new(CountingEmbedder::default());
        let sessions = Arc::new(SessionStore::new(chrono::Duration::seconds(60), None));
        let mut registry = ConnectorRegistry::new();
        registry.register(source.clone());
        let indexer = Indexer::new(
            registry,
            index.clone(),
            index.clone(),
            embedder.clone(),
            sessions.clone(),
            IndexerSettings {
                fetch_concurrency: 2,
                max_body_chars: 10_000,
                embed_batch_size: 2,
                max_input_chars: 1000,
                reconciliation_interval: chrono::Duration::days(1),
            },
        );
        Harness {
            source,
            index,
            embedder,
            sessions,
            indexer,
        }
    }

    #[tokio::test]
    async fn second_pass_without_changes_embeds_nothing() {
        let h = harness();
        h.source.put("a.txt", "alpha", 1);
        h.source.put("b.txt", "beta", 2);
        h.source.put("c.txt", "gamma", 3);

        let first = h.indexer.sync(SourceKind::Share).await.unwrap();
        assert!(first.reconciled);
        assert_eq!(first.embedded, 3);
        assert_eq!(first.embed_calls, 2);
        assert_eq!(h.index.len(), 3);

        let calls = h.embedder.calls.load(Ordering::SeqCst);
        let second = h.indexer.sync(SourceKind::Share).await.unwrap();
        assert!(!second.reconciled);
        assert_eq!(second.embedded, 0);
        assert_eq!(h.embedder.calls.load(Ordering::SeqCst), calls);
        assert_eq!(h.index.len(), 3);
    }

    #[tokio::test]
    async fn only_modified_paths_are_fetched() {
        let h = harness();
        h.source.put("a.txt", "alpha", 1);
        h.source.put("b.txt", "beta", 2);
        h.source.put("c.txt", "gamma", 3);
        h.indexer.sync(SourceKind::Share).await.unwrap();

        h.source.fetches.store(0, Ordering::SeqCst);
        h.source.put("a.txt", "alpha revised", 5);
        let report = h.indexer.sync(SourceKind::Share).await.unwrap();
        assert_eq!(report.embedded, 1);
        // a.txt plus c.txt, which sits exactly on the cursor; b.txt is older
        assert_eq!(h.source.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(report.unchanged, 1);
    }

    #[tokio::test]
    async fn deleted_paths_are_removed() {
        let h = harness();
        h.source.put("a.txt", "alpha", 1);
        h.source.put("b.txt", "beta", 2);
        h.indexer.sync(SourceKind::Share).await.unwrap();

        h.source.remove("a.txt");
        let report = h.indexer.sync(SourceKind::Share).await.unwrap();
        assert_eq!(report.deleted, 1);
        assert!(h
            .index
            .get(&document_id(SourceKind::Share, "a.txt"))
            .await
            .unwrap()
            .is_none());
        assert_eq!(h.index.len(), 1);
    }

    #[tokio::test]
    async fn moved_file_is_indexed_under_new_path() {
        let h = harness();
        h.source.put("a.txt", "alpha", 1);
        h.source.put("b.txt", "beta", 5);
        h.indexer.sync(SourceKind::Share).await.unwrap();

        // A move keeps the modification time, which is older than the cursor.
        h.source.remove("a.txt");
        h.source.put("archiv/a.txt", "alpha", 1);
        let report = h.indexer.sync(SourceKind::Share).await.unwrap();
        assert!(!report.reconciled);
        assert_eq!(report.deleted, 1);
        assert_eq!(report.embedded, 1);
        assert!(h
            .index
            .get(&document_id(SourceKind::Share, "archiv/a.txt"))
            .await
            .unwrap()
            .is_some());
        assert_eq!(h.index.len(), 2);
    }

    #[tokio::test]
    async fn empty_paths_are_not_refetched_until_changed() {
        let h = harness();
        h.source.put("leer.txt", " \n ", 1);
        h.source.put("b.txt", "beta", 5);
        let first = h.indexer.sync(SourceKind::Share).await.unwrap();
        assert_eq!(first.skipped, 1);
        assert_eq!(
            h.index.load(SourceKind::Share).await.unwrap().empty_paths,
            vec!["leer.txt".to_string()]
        );

        h.source.fetches.store(0, Ordering::SeqCst);
        h.indexer.sync(SourceKind::Share).await.unwrap();
        // b.txt only, since it sits on the cursor
        assert_eq!(h.source.fetches.load(Ordering::SeqCst), 1);

        h.source.put("leer.txt", "jetzt mit Inhalt", 6);
        let report = h.indexer.sync(SourceKind::Share).await.unwrap();
        assert_eq!(report.embedded, 1);
        assert!(h.index.load(SourceKind::Share).await.unwrap().empty_paths.is_empty());
    }

    #[tokio::test]
    async fn concurrent_passes_over_one_kind_serialize() {
        let h = harness();
        h.source.fetch_delay_ms.store(20, Ordering::SeqCst);
        h.source.put("a.txt", "alpha", 1);
        h.source.put("b.txt", "beta", 2);
        h.source.put("c.txt", "gamma", 3);

        let (first, second) = tokio::join!(
            h.indexer.sync(SourceKind::Share),
            h.indexer.sync(SourceKind::Share)
        );
        let (first, second) = (first.unwrap(), second.unwrap());

        // The second pass starts from the first pass's cursor.
        assert!(first.reconciled);
        assert_eq!(first.embedded, 3);
        assert!(!second.reconciled);
        assert_eq!(second.embedded, 0);
        assert_eq!(second.unchanged, 1);
        assert_eq!(h.embedder.texts.load(Ordering::SeqCst), 3);
        assert_eq!(h.index.len(), 3);
        assert_eq!(
            h.index.load(SourceKind::Share).await.unwrap().cursor,
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 3, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn reconciliation_refetches_after_interval() {
        let h = harness();
        h.source.put("a.txt", "alpha", 1);
        h.source.put("b.txt", "beta", 5);
        h.indexer.sync(SourceKind::Share).await.unwrap();

        // Rewritten in place with the old modification time.
        h.source.put("a.txt", "alpha, in place revised", 1);
        let report = h.indexer.sync(SourceKind::Share).await.unwrap();
        assert!(!report.reconciled);
        assert_eq!(report.embedded, 0);

        let mut state = h.index.load(SourceKind::Share).await.unwrap();
        state.last_reconciled_at = Some(Utc::now() - chrono::Duration::days(2));
        h.index.save(SourceKind::Share, &state).await.unwrap();

        let report = h.indexer.sync(SourceKind::Share).await.unwrap();
        assert!(report.reconciled);
        assert_eq!(report.fetched, 2);
        assert_eq!(report.embedded, 1);
        let state = h.index.load(SourceKind::Share).await.unwrap();
        assert!(state.last_reconciled_at.unwrap() > Utc::now() - chrono::Duration::minutes(1));
    }

    #[tokio::test]
    async fn skipped_directory_does_not_cause_deletions() {
        let h = harness();
        h.source.put("locked/a.txt", "alpha", 1);
        h.source.put("open/b.txt", "beta", 2);
        h.indexer.sync(SourceKind::Share).await.unwrap();

        h.source.remove("locked/a.txt");
        h.source.skipped.lock().unwrap().push(SkippedPath {
            source_path: "locked".into(),
            reason: "permission denied".into(),
        });
        let report = h.indexer.sync(SourceKind::Share).await.unwrap();
        assert_eq!(report.deleted, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(h.index.len(), 2);
    }

    #[tokio::test]
    async fn failed_paths_are_retried_next_pass() {
        let h = harness();
        h.source.put("a.txt", "alpha", 1);
        h.source.put("b.txt", "beta", 2);
        h.source.broken.lock().unwrap().insert("b.txt".into());

        let first = h.indexer.sync(SourceKind::Share).await.unwrap();
        assert_eq!(first.embedded, 1);
        assert_eq!(first.failed, 1);
        assert_eq!(first.retry_pending, 1);

        h.source.broken.lock().unwrap().clear();
        let second = h.indexer.sync(SourceKind::Share).await.unwrap();
        assert_eq!(second.embedded, 1);
        assert_eq!(second.retry_pending, 0);
        assert_eq!(h.index.len(), 2);
    }

    #[tokio::test]
    async fn credentialed_kind_needs_a_session() {
        let h = harness_for(SourceKind::Wiki);
        h.source.put("Start", "Willkommen im Wiki", 1);

        let err = h.indexer.sync(SourceKind::Wiki).await.unwrap_err();
        assert!(matches!(err, RetrievalError::AuthenticationRequired { .. }));
        assert_eq!(h.source.fetches.load(Ordering::SeqCst), 0);

        h.sessions
            .login(SourceKind::Wiki, "bearer:token".parse().unwrap())
            .unwrap();
        let report = h.indexer.sync(SourceKind::Wiki).await.unwrap();
        assert_eq!(report.embedded, 1);

        let err = h.indexer.sync(SourceKind::Share).await.unwrap_err();
        assert!(matches!(err, RetrievalError::SourceUnreachable { .. }));
    }

    #[tokio::test]
    async fn rejected_session_keeps_cursor() {
        let h = harness_for(SourceKind::Wiki);
        h.sessions
            .login(SourceKind::Wiki, "bearer:token".parse().unwrap())
            .unwrap();
        h.source.put("Start", "Willkommen", 1);
        h.indexer.sync(SourceKind::Wiki).await.unwrap();
        let before = h.index.load(SourceKind::Wiki).await.unwrap();

        h.source.put("Neu", "Neue Seite", 9);
        h.source.reject_credential.store(true, Ordering::SeqCst);
        let report = h.indexer.sync(SourceKind::Wiki).await.unwrap();
        assert!(report.auth_required);
        assert_eq!(report.embedded, 0);
        assert_eq!(h.index.load(SourceKind::Wiki).await.unwrap().cursor, before.cursor);
    }

    #[test]
    fn shadowing_matches_whole_segments() {
        let skipped = vec![SkippedPath {
            source_path: "Verwaltung/".into(),
            reason: "denied".into(),
        }];
        assert!(is_shadowed("Verwaltung/plan.pdf", &skipped));
        assert!(is_shadowed("Verwaltung", &skipped));
        assert!(!is_shadowed("Verwaltung2/plan.pdf", &skipped));

        let everything = vec![SkippedPath {
            source_path: String::new(),
            reason: "sitemap unavailable".into(),
        }];
        assert!(is_shadowed("anything", &everything));
    }

    #[test]
    fn chunked_keeps_order() {
        let batches = chunked(vec![1, 2, 3, 4, 5], 2);
        assert_eq!(batches, vec![vec![1, 2], vec![3, 4], vec![5]]);
        assert!(chunked(Vec::<u8>::new(), 3).is_empty());
    }
}
