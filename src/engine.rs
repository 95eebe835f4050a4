//! The retrieval API.
//!
//! [`Engine`] wires the session store, connectors, index, indexer and
//! planner together and is the one handle the CLI and the HTTP server use.
//! It is cheap to clone.

use anyhow::{Context, Result};
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::completion::{build_prompt, create_completer, Completer};
use crate::config::Config;
use crate::connector::ConnectorRegistry;
use crate::embedding::{create_embedder, Embedder};
use crate::error::RetrievalError;
use crate::index::{IndexStats, SqliteIndex, SyncStateStore, VectorIndex};
use crate::indexer::{Indexer, IndexerSettings, SyncReport};
use crate::models::SourceKind;
use crate::planner::{PlannerSettings, QueryPlanner, RetrievalResponse};
use crate::session::{
    Credential, CredentialSession, SessionError, SessionStatus, SessionStore, SsoChallenge,
};

/// What `trigger_sync` should cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTarget {
    All,
    One(SourceKind),
}

impl FromStr for SyncTarget {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == "all" {
            return Ok(SyncTarget::All);
        }
        Ok(SyncTarget::One(s.parse()?))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    Completed(SyncReport),
    NeedsLogin { source_kind: SourceKind },
    Failed { source_kind: SourceKind, error: String },
}

impl SyncOutcome {
    pub fn source_kind(&self) -> Option<SourceKind> {
        match self {
            SyncOutcome::Completed(report) => report.source_kind,
            SyncOutcome::NeedsLogin { source_kind } | SyncOutcome::Failed { source_kind, .. } => {
                Some(*source_kind)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnswerResponse {
    /// `None` when nothing was retrieved and the model was not asked.
    pub answer: Option<String>,
    pub retrieval: RetrievalResponse,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub index: IndexStats,
    pub embedding_model: String,
    pub completion_model: String,
    pub sources: Vec<SourceKind>,
}

/// Everything an [`Engine`] is built from. [`Engine::open`] fills it from
/// the config; tests assemble their own.
pub struct EngineParts {
    pub sessions: Arc<SessionStore>,
    pub connectors: ConnectorRegistry,
    pub index: Arc<dyn VectorIndex>,
    pub sync_state: Arc<dyn SyncStateStore>,
    pub embedder: Arc<dyn Embedder>,
    pub completer: Arc<dyn Completer>,
}

#[derive(Clone)]
pub struct Engine {
    config: Arc<Config>,
    sessions: Arc<SessionStore>,
    connectors: ConnectorRegistry,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    completer: Arc<dyn Completer>,
    indexer: Arc<Indexer>,
    planner: Arc<QueryPlanner>,
}

impl Engine {
    /// Build the production engine: SQLite index at `db.path`, connectors
    /// for every configured source, embedder and completer per config.
    pub async fn open(config: Config) -> Result<Self> {
        let sessions = Arc::new(SessionStore::from_config(&config.sessions)?);
        let connectors = ConnectorRegistry::from_config(&config, sessions.clone())
            .context("Failed to set up connectors")?;
        let index = Arc::new(SqliteIndex::open(&config.db.path).await?);
        let embedder = create_embedder(&config.embedding)?;
        let completer = create_completer(&config.completion)?;

        Ok(Self::from_parts(
            config,
            EngineParts {
                sessions,
                connectors,
                index: index.clone(),
                sync_state: index,
                embedder,
                completer,
            },
        ))
    }

    pub fn from_parts(config: Config, parts: EngineParts) -> Self {
        let indexer = Indexer::new(
            parts.connectors.clone(),
            parts.index.clone(),
            parts.sync_state,
            parts.embedder.clone(),
            parts.sessions.clone(),
            IndexerSettings::from_config(&config.sync, &config.embedding),
        );
        let planner = QueryPlanner::new(
            parts.index.clone(),
            parts.embedder.clone(),
            parts.sessions.clone(),
            parts.connectors.kinds(),
            PlannerSettings::from_config(&config.retrieval),
        );

        Self {
            config: Arc::new(config),
            sessions: parts.sessions,
            connectors: parts.connectors,
            index: parts.index,
            embedder: parts.embedder,
            completer: parts.completer,
            indexer: Arc::new(indexer),
            planner: Arc::new(planner),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn connectors(&self) -> &ConnectorRegistry {
        &self.connectors
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Federated retrieval over every currently reachable source.
    pub async fn retrieve(&self, query: &str, max_results: Option<usize>) -> RetrievalResponse {
        self.planner.retrieve(query, max_results).await
    }

    /// Retrieve, then hand the passages to the completion model.
    pub async fn answer(&self, query: &str, max_results: Option<usize>) -> Result<AnswerResponse> {
        let retrieval = self.retrieve(query, max_results).await;
        if retrieval.results.is_empty() {
            tracing::info!(outcome = ?retrieval.outcome, "nothing retrieved; skipping completion");
            return Ok(AnswerResponse {
                answer: None,
                retrieval,
            });
        }

        let prompt = build_prompt(query, &retrieval.results, self.config.completion.language);
        let answer = self
            .completer
            .complete(&prompt)
            .await
            .context("Answer generation failed")?;
        Ok(AnswerResponse {
            answer: Some(answer),
            retrieval,
        })
    }

    /// Run indexing passes. `All` runs every configured kind in parallel.
    pub async fn trigger_sync(&self, target: SyncTarget) -> Vec<SyncOutcome> {
        let kinds = match target {
            SyncTarget::All => self.connectors.kinds(),
            SyncTarget::One(kind) => vec![kind],
        };
        join_all(kinds.into_iter().map(|kind| async move {
            match self.indexer.sync(kind).await {
                Ok(report) => SyncOutcome::Completed(report),
                Err(RetrievalError::AuthenticationRequired { source_kind }) => {
                    tracing::info!(source = %source_kind, "sync skipped: login required");
                    SyncOutcome::NeedsLogin { source_kind }
                }
                Err(e) => {
                    tracing::warn!(source = %kind, error = %e, "sync failed");
                    SyncOutcome::Failed {
                        source_kind: kind,
                        error: e.to_string(),
                    }
                }
            }
        }))
        .await
    }

    /// Session status of every configured source.
    pub fn session_status(&self) -> BTreeMap<SourceKind, SessionStatus> {
        self.sessions.status_map(&self.connectors.kinds())
    }

    pub fn login(
        &self,
        kind: SourceKind,
        credential: Credential,
    ) -> Result<CredentialSession, SessionError> {
        self.sessions.login(kind, credential)
    }

    pub fn logout(&self, kind: SourceKind) {
        self.sessions.logout(kind);
    }

    pub fn begin_sso(&self) -> Result<SsoChallenge, SessionError> {
        self.sessions.begin_sso()
    }

    pub fn complete_sso(
        &self,
        state: &str,
        credential: Credential,
    ) -> Result<CredentialSession, SessionError> {
        self.sessions.complete_sso(state, credential)
    }

    pub async fn stats(&self) -> Result<EngineStats, RetrievalError> {
        Ok(EngineStats {
            index: self.index.stats().await?,
            embedding_model: self.embedder.model_name().to_string(),
            completion_model: self.completer.model_name().to_string(),
            sources: self.connectors.kinds(),
        })
    }

    /// Sync all sources now and then every `reconciliation_interval_secs`.
    /// Whether a pass re-fetches everything is decided per source by the
    /// indexer. Runs until the task is dropped.
    pub async fn run_reconciliation_loop(self) {
        let period = Duration::from_secs(self.config.sync.reconciliation_interval_secs.max(60));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            tracing::info!("scheduled sync starting");
            for outcome in self.trigger_sync(SyncTarget::All).await {
                if let SyncOutcome::Completed(report) = outcome {
                    tracing::debug!(source = ?report.source_kind, deleted = report.deleted, "scheduled sync done");
                }
            }
        }
    }
}
