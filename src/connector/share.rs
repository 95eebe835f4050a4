//! Read-only file share connector.
//!
//! Walks a mounted volume with include/exclude globs. Nothing in here opens
//! a file for writing. Entries that cannot be read (permission denied, a
//! share dropping mid-walk) are reported as skipped rather than failing the
//! listing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

use super::{Connector, ConnectorHealth, RateLimiter, RetryPolicy};
use crate::config::{ShareConnectorConfig, SyncConfig};
use crate::error::FetchError;
use crate::extract::content_type_for_path;
use crate::models::{ChangedPath, Listing, RawContent, SkippedPath, SourceKind};

pub struct ShareConnector {
    root: PathBuf,
    scanner: Arc<Scanner>,
    limiter: RateLimiter,
    retry: RetryPolicy,
}

/// The blocking half of the connector: directory walking.
struct Scanner {
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
    follow_symlinks: bool,
}

impl ShareConnector {
    pub fn new(config: &ShareConnectorConfig, sync: &SyncConfig) -> anyhow::Result<Self> {
        let mut default_excludes = vec![
            "**/.git/**".to_string(),
            "**/~$*".to_string(),
            "**/.~lock.*".to_string(),
        ];
        default_excludes.extend(config.exclude_globs.clone());

        Ok(Self {
            root: config.root.clone(),
            scanner: Arc::new(Scanner {
                root: config.root.clone(),
                include: build_globset(&config.include_globs)?,
                exclude: build_globset(&default_excludes)?,
                follow_symlinks: config.follow_symlinks,
            }),
            limiter: RateLimiter::per_second(config.requests_per_second),
            retry: RetryPolicy::from_config(sync),
        })
    }

    fn resolve(&self, source_path: &str) -> Result<PathBuf, FetchError> {
        let rel = Path::new(source_path);
        let escapes = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || source_path.is_empty() {
            return Err(FetchError::permanent(format!(
                "path outside share: {}",
                source_path
            )));
        }
        Ok(self.root.join(rel))
    }
}

impl Scanner {
    fn scan(&self, cursor: Option<DateTime<Utc>>) -> Result<Listing, FetchError> {
        if !self.root.is_dir() {
            // Treat a missing mount as the whole source being down, never as
            // "every file was deleted".
            return Err(FetchError::transient(format!(
                "share root not available: {}",
                self.root.display()
            )));
        }

        let mut listing = Listing::default();
        let walker = WalkDir::new(&self.root)
            .follow_links(self.follow_symlinks)
            .sort_by_file_name();

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let rel = e
                        .path()
                        .map(|p| relative(&self.root, p))
                        .unwrap_or_default();
                    tracing::warn!(source = "share", path = %rel, error = %e, "skipping unreadable entry");
                    listing.skipped.push(SkippedPath {
                        source_path: rel,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let rel = relative(&self.root, entry.path());
            if self.exclude.is_match(&rel) || !self.include.is_match(&rel) {
                continue;
            }

            let modified = entry
                .metadata()
                .map_err(|e| e.to_string())
                .and_then(|m| m.modified().map_err(|e| e.to_string()))
                // Opening without reading is enough to catch permission problems.
                .and_then(|m| {
                    std::fs::File::open(entry.path())
                        .map(|_| m)
                        .map_err(|e| e.to_string())
                });

            match modified {
                Ok(modified) => listing.push(
                    ChangedPath {
                        source_path: rel,
                        last_modified: Some(DateTime::<Utc>::from(modified)),
                    },
                    cursor,
                ),
                Err(reason) => {
                    tracing::warn!(source = "share", path = %rel, %reason, "skipping unreadable file");
                    listing.skipped.push(SkippedPath {
                        source_path: rel,
                        reason,
                    });
                }
            }
        }

        Ok(listing)
    }
}

#[async_trait]
impl Connector for ShareConnector {
    fn kind(&self) -> SourceKind {
        SourceKind::Share
    }

    fn description(&self) -> String {
        format!("read-only share at {}", self.root.display())
    }

    async fn list_changed_since(
        &self,
        cursor: Option<DateTime<Utc>>,
    ) -> Result<Listing, FetchError> {
        let scanner = self.scanner.clone();
        tokio::task::spawn_blocking(move || scanner.scan(cursor))
            .await
            .map_err(|e| FetchError::permanent(format!("share listing task failed: {}", e)))?
    }

    async fn fetch(&self, source_path: &str) -> Result<RawContent, FetchError> {
        let path = self.resolve(source_path)?;
        let bytes = self
            .retry
            .run("share fetch", || async {
                self.limiter.acquire().await;
                tokio::fs::read(&path).await.map_err(|e| classify_io(source_path, e))
            })
            .await?;

        let uri = url::Url::from_file_path(&path)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| format!("file://{}", path.display()));
        let title_hint = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string());

        Ok(RawContent {
            bytes,
            content_type: content_type_for_path(&path).to_string(),
            uri,
            title_hint,
        })
    }

    async fn health(&self) -> ConnectorHealth {
        let meta = match std::fs::metadata(&self.root) {
            Ok(m) if m.is_dir() => m,
            Ok(_) => return ConnectorHealth::failing("share root is not a directory"),
            Err(e) => return ConnectorHealth::failing(format!("share root unavailable: {}", e)),
        };
        // Mode bits of the root only; a read-only mount flag does not show here.
        if meta.permissions().readonly() {
            ConnectorHealth::ok("mounted; root mode bits deny writing")
        } else {
            ConnectorHealth::ok(
                "mounted (warning: root mode bits allow writing, expected read-only; \
                 mount flags not checked)",
            )
        }
    }
}

fn classify_io(source_path: &str, e: std::io::Error) -> FetchError {
    match e.kind() {
        ErrorKind::NotFound => FetchError::NotFound(source_path.to_string()),
        ErrorKind::PermissionDenied | ErrorKind::InvalidInput | ErrorKind::InvalidData => {
            FetchError::permanent(format!("{}: {}", source_path, e))
        }
        _ => FetchError::transient(format!("{}: {}", source_path, e)),
    }
}

fn relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

fn build_globset(patterns: &[String]) -> anyhow::Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
