//! Query planning, fan-out and merge.
//!
//! A query runs through four phases:
//!
//! 1. **Planning**: every configured source kind with a usable session is
//!    eligible; the rest are reported as needing a login.
//! 2. **Dispatch**: the query is embedded once and searched against each
//!    eligible kind separately, `k_per_source` hits per kind, concurrently,
//!    each under its own timeout.
//! 3. **Merge**: raw cosine scores are min-max normalized within each kind,
//!    then all hits are ordered by normalized score. Per-kind `k` plus
//!    per-kind normalization keeps a large source from starving small ones.
//! 4. **Attribute**: each surviving hit gets its title, uri, source kind and
//!    a query-aware snippet, read fresh from the index.
//!
//! The outcome is `Answered` when every configured source was consulted,
//! `PartiallyAnswered` when some could not be but at least one was, and
//! `Failed` when none could be.

use futures::future::join_all;
use serde::Serialize;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RetrievalConfig;
use crate::embedding::{embed_query, Embedder};
use crate::error::RetrievalError;
use crate::index::VectorIndex;
use crate::models::{QueryResultItem, ScoredId, SourceKind};
use crate::session::{SessionStatus, SessionStore};
use crate::snippet::make_snippet;

#[derive(Debug, Clone)]
pub struct PlannerSettings {
    pub k_per_source: usize,
    pub max_results: usize,
    pub snippet_chars: usize,
    pub per_source_timeout: Duration,
    pub min_normalized_score: f64,
    pub min_similarity: Option<f64>,
}

impl PlannerSettings {
    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self {
            k_per_source: config.k_per_source,
            max_results: config.max_results,
            snippet_chars: config.snippet_chars,
            per_source_timeout: Duration::from_millis(config.per_source_timeout_ms),
            min_normalized_score: config.min_normalized_score,
            min_similarity: config.min_similarity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Answered,
    PartiallyAnswered,
    Failed,
}

/// Why a source did not contribute to a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnavailableReason {
    /// No session, or the session expired or was rejected.
    NeedsLogin,
    Unreachable,
    Timeout,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnavailableSource {
    pub source_kind: SourceKind,
    pub reason: UnavailableReason,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalResponse {
    pub query: String,
    pub outcome: Outcome,
    pub results: Vec<QueryResultItem>,
    /// Sources whose search completed.
    pub consulted: Vec<SourceKind>,
    pub unavailable: Vec<UnavailableSource>,
    /// Subset of `unavailable` the user can fix by logging in.
    pub reauth_required: Vec<SourceKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RetrievalResponse {
    fn new(
        query: &str,
        results: Vec<QueryResultItem>,
        consulted: Vec<SourceKind>,
        unavailable: Vec<UnavailableSource>,
        error: Option<String>,
    ) -> Self {
        let outcome = if consulted.is_empty() {
            Outcome::Failed
        } else if unavailable.is_empty() {
            Outcome::Answered
        } else {
            Outcome::PartiallyAnswered
        };
        let reauth_required = unavailable
            .iter()
            .filter(|u| u.reason == UnavailableReason::NeedsLogin)
            .map(|u| u.source_kind)
            .collect();
        Self {
            query: query.to_string(),
            outcome,
            results,
            consulted,
            unavailable,
            reauth_required,
            error,
        }
    }
}

pub struct QueryPlanner {
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    sessions: Arc<SessionStore>,
    sources: Vec<SourceKind>,
    settings: PlannerSettings,
}

struct Candidate {
    kind: SourceKind,
    hit: ScoredId,
    normalized: f64,
}

impl QueryPlanner {
    /// `sources` are the configured kinds; unconfigured kinds are never
    /// searched nor reported.
    pub fn new(
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        sessions: Arc<SessionStore>,
        sources: Vec<SourceKind>,
        settings: PlannerSettings,
    ) -> Self {
        Self {
            index,
            embedder,
            sessions,
            sources,
            settings,
        }
    }

    pub async fn retrieve(&self, query: &str, max_results: Option<usize>) -> RetrievalResponse {
        let max_results = max_results.unwrap_or(self.settings.max_results).max(1);

        // Planning
        let mut unavailable = Vec::new();
        let mut eligible = Vec::new();
        for &kind in &self.sources {
            if self.sessions.get(kind).is_some() {
                eligible.push(kind);
            } else {
                let status = self.sessions.status(kind);
                unavailable.push(UnavailableSource {
                    source_kind: kind,
                    reason: UnavailableReason::NeedsLogin,
                    detail: match status {
                        SessionStatus::Expired => "session expired".to_string(),
                        _ => "not logged in".to_string(),
                    },
                });
            }
        }
        if eligible.is_empty() {
            tracing::info!(query = %query, "no eligible sources");
            return RetrievalResponse::new(query, Vec::new(), Vec::new(), unavailable, None);
        }

        // Dispatch
        let vector = match embed_query(self.embedder.as_ref(), query).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "query embedding failed");
                return RetrievalResponse::new(
                    query,
                    Vec::new(),
                    Vec::new(),
                    unavailable,
                    Some(format!("query embedding failed: {:#}", e)),
                );
            }
        };

        let timeout = self.settings.per_source_timeout;
        let k = self.settings.k_per_source;
        let searches = eligible.iter().map(|&kind| {
            let vector = &vector;
            async move {
                let result =
                    tokio::time::timeout(timeout, self.index.search(vector, k, &[kind])).await;
                (kind, result)
            }
        });

        let mut consulted = Vec::new();
        let mut per_source: Vec<(SourceKind, Vec<ScoredId>)> = Vec::new();
        for (kind, result) in join_all(searches).await {
            match result {
                Ok(Ok(hits)) => {
                    consulted.push(kind);
                    per_source.push((kind, hits));
                }
                Ok(Err(e)) => {
                    tracing::warn!(source = %kind, error = %e, "search failed");
                    unavailable.push(UnavailableSource {
                        source_kind: kind,
                        reason: UnavailableReason::Unreachable,
                        detail: e.to_string(),
                    });
                }
                Err(_) => {
                    let err = RetrievalError::QueryTimeout {
                        source_kind: kind,
                        after: timeout,
                    };
                    tracing::warn!(source = %kind, "{}", err);
                    unavailable.push(UnavailableSource {
                        source_kind: kind,
                        reason: UnavailableReason::Timeout,
                        detail: err.to_string(),
                    });
                }
            }
        }

        // Merge
        let mut candidates = Vec::new();
        for (kind, hits) in per_source {
            let hits: Vec<ScoredId> = match self.settings.min_similarity {
                Some(floor) => hits.into_iter().filter(|h| h.score >= floor).collect(),
                None => hits,
            };
            let normalized = normalize_scores(&hits);
            for (hit, normalized) in hits.into_iter().zip(normalized) {
                if normalized >= self.settings.min_normalized_score {
                    candidates.push(Candidate {
                        kind,
                        hit,
                        normalized,
                    });
                }
            }
        }
        candidates.sort_by(merge_order);
        candidates.truncate(max_results);

        // Attribute
        let mut results = Vec::with_capacity(candidates.len());
        for c in candidates {
            let entry = match self.index.get(&c.hit.id).await {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(id = %c.hit.id, error = %e, "could not load result entry");
                    continue;
                }
            };
            results.push(QueryResultItem {
                document_id: entry.id,
                title: entry.metadata.title,
                score: c.normalized,
                similarity: c.hit.score,
                snippet: make_snippet(&entry.body_text, query, self.settings.snippet_chars),
                source_kind: c.kind,
                uri: entry.metadata.uri,
                last_indexed_at: entry.metadata.last_indexed_at,
            });
        }

        let response = RetrievalResponse::new(query, results, consulted, unavailable, None);
        tracing::info!(
            outcome = ?response.outcome,
            results = response.results.len(),
            unavailable = response.unavailable.len(),
            "query answered"
        );
        response
    }
}

/// Min-max normalize into `[0, 1]`. When all scores are equal (including a
/// single hit) every score becomes `1.0`.
pub fn normalize_scores(hits: &[ScoredId]) -> Vec<f64> {
    if hits.is_empty() {
        return Vec::new();
    }

    let s_min = hits.iter().map(|h| h.score).fold(f64::INFINITY, f64::min);
    let s_max = hits.iter().map(|h| h.score).fold(f64::NEG_INFINITY, f64::max);

    hits.iter()
        .map(|h| {
            if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (h.score - s_min) / (s_max - s_min)
            }
        })
        .collect()
}

/// Normalized score desc, raw score desc, freshness desc, id asc.
fn merge_order(a: &Candidate, b: &Candidate) -> Ordering {
    b.normalized
        .partial_cmp(&a.normalized)
        .unwrap_or(Ordering::Equal)
        .then(b.hit.score.partial_cmp(&a.hit.score).unwrap_or(Ordering::Equal))
        .then(b.hit.last_indexed_at.cmp(&a.hit.last_indexed_at))
        .then(a.hit.id.cmp(&b.hit.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{EntryRef, IndexStats, MemoryIndex};
    use crate::models::{EntryMetadata, IndexEntry};
    use async_trait::async_trait;
    use chrono::Utc;

    /// Maps every text to a fixed direction by keyword.
    struct KeywordEmbedder;

    #[async_trait]
    impl Embedder for KeywordEmbedder {
        fn model_name(&self) -> &str {
            "keyword"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    if t.to_lowercase().contains("fertigung") {
                        vec![1.0, 0.0]
                    } else {
                        vec![0.0, 1.0]
                    }
                })
                .collect())
        }
    }

    fn entry(id: &str, kind: SourceKind, embedding: Vec<f32>, body: &str) -> IndexEntry {
        IndexEntry {
            id: id.to_string(),
            embedding,
            metadata: EntryMetadata {
                source_kind: kind,
                source_path: id.to_string(),
                uri: format!("https://example.org/{}", id),
                title: id.to_uppercase(),
                content_hash: "h".into(),
                last_indexed_at: Utc::now(),
            },
            body_text: body.to_string(),
        }
    }

    fn settings() -> PlannerSettings {
        PlannerSettings {
            k_per_source: 10,
            max_results: 10,
            snippet_chars: 120,
            per_source_timeout: Duration::from_millis(500),
            min_normalized_score: 0.0,
            min_similarity: None,
        }
    }

    fn sessions() -> Arc<SessionStore> {
        Arc::new(SessionStore::new(chrono::Duration::seconds(3600), None))
    }

    fn planner(
        index: Arc<dyn VectorIndex>,
        sessions: Arc<SessionStore>,
        sources: Vec<SourceKind>,
    ) -> QueryPlanner {
        QueryPlanner::new(index, Arc::new(KeywordEmbedder), sessions, sources, settings())
    }

    #[test]
    fn min_max_normalization() {
        let hit = |s| ScoredId {
            id: "x".into(),
            score: s,
            last_indexed_at: Utc::now(),
        };
        assert_eq!(normalize_scores(&[hit(0.2), hit(0.6), hit(0.4)]), vec![0.0, 1.0, 0.5]);
        assert_eq!(normalize_scores(&[hit(0.3)]), vec![1.0]);
        assert_eq!(normalize_scores(&[hit(0.3), hit(0.3)]), vec![1.0, 1.0]);
        assert!(normalize_scores(&[]).is_empty());
    }

    #[tokio::test]
    async fn small_source_not_starved() {
        let index = Arc::new(MemoryIndex::new());
        let mut entries = Vec::new();
        for i in 0..1000 {
            // Share documents are all strongly similar.
            let y = (i as f32) / 1000.0;
            entries.push(entry(&format!("share-{:04}", i), SourceKind::Share, vec![1.0, y], "Fertigung"));
        }
        for i in 0..5 {
            // Public documents are only weakly similar.
            let y = 2.0 + i as f32;
            entries.push(entry(&format!("public-{}", i), SourceKind::PublicPortal, vec![1.0, y], "Fertigung"));
        }
        index.upsert_batch(entries).await.unwrap();

        let planner = planner(
            index,
            sessions(),
            vec![SourceKind::Share, SourceKind::PublicPortal],
        );
        let response = planner.retrieve("Fertigungsverfahren", Some(10)).await;
        assert_eq!(response.outcome, Outcome::Answered);
        assert_eq!(response.results.len(), 10);
        assert!(response
            .results
            .iter()
            .any(|r| r.source_kind == SourceKind::PublicPortal));
        assert!(response
            .results
            .iter()
            .all(|r| (0.0..=1.0).contains(&r.score)));
    }

    #[tokio::test]
    async fn expired_wiki_yields_partial_answer() {
        let index = Arc::new(MemoryIndex::new());
        index
            .upsert_batch(vec![
                entry("share-doc", SourceKind::Share, vec![1.0, 0.0], "Fertigungsverfahren im Überblick"),
                entry("wiki-doc", SourceKind::Wiki, vec![1.0, 0.0], "Fertigung im Wiki"),
            ])
            .await
            .unwrap();
        let sessions = sessions();
        sessions
            .login(SourceKind::Wiki, "bearer:t".parse().unwrap())
            .unwrap();
        sessions.invalidate(SourceKind::Wiki);

        let planner = planner(index, sessions, vec![SourceKind::Share, SourceKind::Wiki]);
        let response = planner
            .retrieve("Wo finde ich Informationen über Fertigungsverfahren?", None)
            .await;
        assert_eq!(response.outcome, Outcome::PartiallyAnswered);
        assert_eq!(response.reauth_required, vec![SourceKind::Wiki]);
        assert_eq!(response.unavailable[0].detail, "session expired");
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].source_kind, SourceKind::Share);
        assert_eq!(response.results[0].uri, "https://example.org/share-doc");
        assert!(response.results[0].snippet.contains("Fertigungsverfahren"));
    }

    #[tokio::test]
    async fn no_eligible_source_fails() {
        let index = Arc::new(MemoryIndex::new());
        let planner = planner(index, sessions(), vec![SourceKind::Wiki, SourceKind::SsoPortal]);
        let response = planner.retrieve("anything", None).await;
        assert_eq!(response.outcome, Outcome::Failed);
        assert_eq!(
            response.reauth_required,
            vec![SourceKind::Wiki, SourceKind::SsoPortal]
        );
    }

    #[tokio::test]
    async fn no_hits_is_still_answered() {
        let index = Arc::new(MemoryIndex::new());
        let planner = planner(index, sessions(), vec![SourceKind::Share]);
        let response = planner.retrieve("anything", None).await;
        assert_eq!(response.outcome, Outcome::Answered);
        assert!(response.results.is_empty());
        assert!(response.unavailable.is_empty());
    }

    /// Delegates to a MemoryIndex but stalls searches over one kind.
    struct StallingIndex {
        inner: MemoryIndex,
        stalled: SourceKind,
    }

    #[async_trait]
    impl VectorIndex for StallingIndex {
        async fn upsert(&self, entry: IndexEntry) -> Result<(), RetrievalError> {
            self.inner.upsert(entry).await
        }
        async fn delete(&self, id: &str) -> Result<(), RetrievalError> {
            self.inner.delete(id).await
        }
        async fn search(
            &self,
            query: &[f32],
            k: usize,
            kinds: &[SourceKind],
        ) -> Result<Vec<ScoredId>, RetrievalError> {
            if kinds.contains(&self.stalled) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            self.inner.search(query, k, kinds).await
        }
        async fn get(&self, id: &str) -> Result<Option<IndexEntry>, RetrievalError> {
            self.inner.get(id).await
        }
        async fn stored_hash(&self, id: &str) -> Result<Option<String>, RetrievalError> {
            self.inner.stored_hash(id).await
        }
        async fn entries_for(&self, kind: SourceKind) -> Result<Vec<EntryRef>, RetrievalError> {
            self.inner.entries_for(kind).await
        }
        async fn stats(&self) -> Result<IndexStats, RetrievalError> {
            self.inner.stats().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_source_times_out_into_partial_answer() {
        let index = Arc::new(StallingIndex {
            inner: MemoryIndex::new(),
            stalled: SourceKind::PublicPortal,
        });
        index
            .upsert(entry("share-doc", SourceKind::Share, vec![1.0, 0.0], "Fertigung"))
            .await
            .unwrap();

        let planner = planner(
            index,
            sessions(),
            vec![SourceKind::Share, SourceKind::PublicPortal],
        );
        let response = planner.retrieve("Fertigung", None).await;
        assert_eq!(response.outcome, Outcome::PartiallyAnswered);
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.unavailable[0].reason, UnavailableReason::Timeout);
        assert!(response.reauth_required.is_empty());
    }

    #[tokio::test]
    async fn normalized_floor_drops_weak_hits() {
        let index = Arc::new(MemoryIndex::new());
        index
            .upsert_batch(vec![
                entry("a", SourceKind::Share, vec![1.0, 0.0], "Fertigung"),
                entry("b", SourceKind::Share, vec![0.0, 1.0], "Sonstiges"),
            ])
            .await
            .unwrap();
        let mut s = settings();
        s.min_normalized_score = 0.5;
        let planner = QueryPlanner::new(
            index,
            Arc::new(KeywordEmbedder),
            sessions(),
            vec![SourceKind::Share],
            s,
        );
        let response = planner.retrieve("Fertigung", None).await;
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].document_id, "a");
        assert_eq!(response.results[0].score, 1.0);
    }
}
