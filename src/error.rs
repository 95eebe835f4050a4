//! Error taxonomy shared by connectors, the indexer, and the query planner.
//!
//! Failures are contained where they happen: a connector or normalizer error
//! affects one path, a query error affects one source. Callers see them as
//! counts and lists in [`SyncReport`](crate::indexer::SyncReport) and
//! [`RetrievalResponse`](crate::planner::RetrievalResponse), never as an
//! aborted pass.

use std::time::Duration;

use thiserror::Error;

use crate::models::SourceKind;

#[derive(Debug, Error)]
pub enum RetrievalError {
    /// Network or transport failure. Retryable.
    #[error("{source_kind} unreachable: {message}")]
    SourceUnreachable {
        source_kind: SourceKind,
        message: String,
    },

    /// Credential missing or expired. Needs a login, not a retry.
    #[error("{source_kind} requires authentication")]
    AuthenticationRequired { source_kind: SourceKind },

    /// Malformed or unsupported content. The document is skipped.
    #[error("content extraction failed for {source_path}: {reason}")]
    ContentExtractionFailed { source_path: String, reason: String },

    /// Writing to the index failed. The batch is retried on the next sync.
    #[error("index write failed: {0}")]
    IndexWriteFailed(String),

    /// Reading from the index failed: a search, a lookup or sync state.
    #[error("index read failed: {0}")]
    IndexReadFailed(String),

    /// A per-source search did not answer in time.
    #[error("{source_kind} timed out after {after:?}")]
    QueryTimeout {
        source_kind: SourceKind,
        after: Duration,
    },
}

/// Failure of a single connector request.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    /// The remote side rejected (or never received) a credential.
    #[error("authentication required")]
    AuthenticationRequired,

    /// The path no longer exists at the source.
    #[error("not found: {0}")]
    NotFound(String),

    /// Transport failure. `transient` failures are retried with backoff.
    #[error("unreachable: {message}")]
    Unreachable { message: String, transient: bool },
}

impl FetchError {
    pub fn transient(message: impl Into<String>) -> Self {
        FetchError::Unreachable {
            message: message.into(),
            transient: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        FetchError::Unreachable {
            message: message.into(),
            transient: false,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Unreachable { transient: true, .. })
    }

    /// Lift into the engine-wide taxonomy for the given source.
    pub fn into_retrieval(self, source_kind: SourceKind) -> RetrievalError {
        match self {
            FetchError::AuthenticationRequired => {
                RetrievalError::AuthenticationRequired { source_kind }
            }
            FetchError::NotFound(path) => RetrievalError::SourceUnreachable {
                source_kind,
                message: format!("not found: {}", path),
            },
            FetchError::Unreachable { message, .. } => RetrievalError::SourceUnreachable {
                source_kind,
                message,
            },
        }
    }
}
