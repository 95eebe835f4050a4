//! Core data models used throughout the retrieval engine.
//!
//! These types represent the source kinds, normalized documents, index
//! entries, and query results that flow through the indexing and retrieval
//! paths.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The four kinds of sources the engine federates over.
///
/// Each kind has exactly one connector implementation, selected at
/// construction time by [`ConnectorRegistry`](crate::connector::ConnectorRegistry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Read-only file share mounted into the local filesystem.
    Share,
    /// Credential-protected wiki.
    Wiki,
    /// Public web portal.
    PublicPortal,
    /// SSO-protected identity-management portal.
    SsoPortal,
}

impl SourceKind {
    /// All source kinds, in display order.
    pub const ALL: [SourceKind; 4] = [
        SourceKind::Share,
        SourceKind::Wiki,
        SourceKind::PublicPortal,
        SourceKind::SsoPortal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Share => "share",
            SourceKind::Wiki => "wiki",
            SourceKind::PublicPortal => "public_portal",
            SourceKind::SsoPortal => "sso_portal",
        }
    }

    /// Whether reaching this source needs a user-supplied credential.
    ///
    /// The share and the public portal are always reachable without one.
    pub fn requires_credential(&self) -> bool {
        matches!(self, SourceKind::Wiki | SourceKind::SsoPortal)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "share" => Ok(SourceKind::Share),
            "wiki" => Ok(SourceKind::Wiki),
            "public_portal" | "public" => Ok(SourceKind::PublicPortal),
            "sso_portal" | "sso" => Ok(SourceKind::SsoPortal),
            other => anyhow::bail!(
                "Unknown source kind: '{}'. Available: share, wiki, public_portal, sso_portal",
                other
            ),
        }
    }
}

/// A path reported by a connector listing.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangedPath {
    /// Source-relative path (file path under the share root, or URL path
    /// under the portal's base URL).
    pub source_path: String,
    /// Last modification time, when the source reports one.
    pub last_modified: Option<DateTime<Utc>>,
}

/// A path a connector could not list and skipped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedPath {
    pub source_path: String,
    pub reason: String,
}

/// Result of [`Connector::list_changed_since`](crate::connector::Connector::list_changed_since).
///
/// `changed` and `unchanged` together cover every path currently present at
/// the source, which is what lets the indexer detect deletions.
#[derive(Debug, Clone, Default)]
pub struct Listing {
    /// Paths changed since the cursor (or every path, for a full listing).
    pub changed: Vec<ChangedPath>,
    /// Paths present at the source but not modified since the cursor.
    pub unchanged: Vec<String>,
    /// Paths that could not be read and were skipped. Deletions under a
    /// skipped path are not inferred.
    pub skipped: Vec<SkippedPath>,
}

impl Listing {
    /// Sort into `changed`/`unchanged` against `cursor`. Paths without a
    /// modification time always count as changed.
    pub fn push(&mut self, path: ChangedPath, cursor: Option<DateTime<Utc>>) {
        match (cursor, path.last_modified) {
            (Some(c), Some(m)) if m < c => self.unchanged.push(path.source_path),
            _ => self.changed.push(path),
        }
    }

    pub fn present_paths(&self) -> impl Iterator<Item = &str> {
        self.changed
            .iter()
            .map(|c| c.source_path.as_str())
            .chain(self.unchanged.iter().map(String::as_str))
    }
}

/// Raw bytes fetched by a connector, before normalization.
#[derive(Debug, Clone)]
pub struct RawContent {
    pub bytes: Vec<u8>,
    /// MIME type, from the HTTP header or the file extension.
    pub content_type: String,
    /// Canonical locator used to rebuild a download or view link.
    pub uri: String,
    /// Title suggested by the source (e.g. the file name).
    pub title_hint: Option<String>,
}

/// Normalized, retrievable document. Carries no embedding; the indexer
/// attaches one when it builds the [`IndexEntry`].
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Stable identifier derived from `(source_kind, source_path)`.
    pub id: String,
    pub source_kind: SourceKind,
    pub source_path: String,
    pub uri: String,
    pub title: String,
    pub body_text: String,
    /// SHA-256 of `body_text`, used for change detection.
    pub content_hash: String,
}

/// Metadata stored next to each embedding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryMetadata {
    pub source_kind: SourceKind,
    pub source_path: String,
    pub uri: String,
    pub title: String,
    pub content_hash: String,
    pub last_indexed_at: DateTime<Utc>,
}

/// The persisted unit inside the vector index.
///
/// Written only by the indexer. The embedding is always derived from the
/// stored `body_text`, so both are replaced together.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub id: String,
    pub embedding: Vec<f32>,
    pub metadata: EntryMetadata,
    pub body_text: String,
}

impl IndexEntry {
    pub fn from_document(doc: Document, embedding: Vec<f32>, indexed_at: DateTime<Utc>) -> Self {
        Self {
            id: doc.id,
            embedding,
            metadata: EntryMetadata {
                source_kind: doc.source_kind,
                source_path: doc.source_path,
                uri: doc.uri,
                title: doc.title,
                content_hash: doc.content_hash,
                last_indexed_at: indexed_at,
            },
            body_text: doc.body_text,
        }
    }
}

/// A similarity hit returned by [`VectorIndex::search`](crate::index::VectorIndex::search).
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredId {
    pub id: String,
    pub score: f64,
    pub last_indexed_at: DateTime<Utc>,
}

/// One attributed passage in a retrieval response.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResultItem {
    /// Document id the passage belongs to.
    pub document_id: String,
    pub title: String,
    /// Score after per-source normalization, in `[0.0, 1.0]`.
    pub score: f64,
    /// Raw cosine similarity before normalization.
    pub similarity: f64,
    pub snippet: String,
    pub source_kind: SourceKind,
    pub uri: String,
    pub last_indexed_at: DateTime<Utc>,
}
