//! Source connectors.
//!
//! One concrete [`Connector`] per [`SourceKind`], selected once when the
//! [`ConnectorRegistry`] is built from the config. The indexer and the
//! planner only ever talk to `dyn Connector`.
//!
//! | Kind | Type | Medium |
//! |------|------|--------|
//! | `share` | [`ShareConnector`] | read-only mounted volume |
//! | `wiki` | [`WikiConnector`] | HTTP, credential required |
//! | `public_portal` | [`PublicPortalConnector`] | HTTP, no credential |
//! | `sso_portal` | [`SsoPortalConnector`] | HTTP, SSO credential required |
//!
//! Shared plumbing lives here too: [`RetryPolicy`] (bounded exponential
//! backoff on transient failures) and [`RateLimiter`] (minimum spacing
//! between requests to one source).

mod http;
mod public_portal;
mod share;
mod sso_portal;
mod wiki;

pub use http::{parse_sitemap, PortalClient, Sitemap, SitemapEntry};
pub use public_portal::PublicPortalConnector;
pub use share::ShareConnector;
pub use sso_portal::SsoPortalConnector;
pub use wiki::WikiConnector;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::{Config, SyncConfig};
use crate::error::FetchError;
use crate::models::{Listing, RawContent, SourceKind};
use crate::session::SessionStore;

/// A source that can list its changed paths and fetch raw content.
#[async_trait]
pub trait Connector: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// One-line description for `fedr sources`.
    fn description(&self) -> String;

    /// List every path present at the source, split into those modified at
    /// or after `cursor` and those that are not. `None` lists everything as
    /// changed.
    ///
    /// Individual unreadable paths are reported in [`Listing::skipped`].
    /// An `Err` means the listing as a whole could not be produced.
    async fn list_changed_since(
        &self,
        cursor: Option<DateTime<Utc>>,
    ) -> Result<Listing, FetchError>;

    async fn fetch(&self, source_path: &str) -> Result<RawContent, FetchError>;

    async fn health(&self) -> ConnectorHealth;
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectorHealth {
    pub ok: bool,
    pub message: String,
}

impl ConnectorHealth {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

/// Holds at most one connector per source kind.
#[derive(Default, Clone)]
pub struct ConnectorRegistry {
    connectors: BTreeMap<SourceKind, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a connector for every `[connectors.*]` section.
    pub fn from_config(config: &Config, sessions: Arc<SessionStore>) -> anyhow::Result<Self> {
        let mut registry = Self::new();
        let sync = &config.sync;

        if let Some(share) = &config.connectors.share {
            registry.register(Arc::new(ShareConnector::new(share, sync)?));
        }
        if let Some(wiki) = &config.connectors.wiki {
            registry.register(Arc::new(WikiConnector::new(wiki, sync, sessions.clone())?));
        }
        if let Some(public) = &config.connectors.public_portal {
            registry.register(Arc::new(PublicPortalConnector::new(public, sync)?));
        }
        if let Some(sso) = &config.connectors.sso_portal {
            registry.register(Arc::new(SsoPortalConnector::new(sso, sync, sessions)?));
        }

        Ok(registry)
    }

    /// Register a connector, replacing any previous one of the same kind.
    pub fn register(&mut self, connector: Arc<dyn Connector>) {
        self.connectors.insert(connector.kind(), connector);
    }

    pub fn get(&self, kind: SourceKind) -> Option<Arc<dyn Connector>> {
        self.connectors.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<SourceKind> {
        self.connectors.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }
}

// ============ Retry ============

/// Exponential backoff for transient connector failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(sync: &SyncConfig) -> Self {
        Self {
            max_attempts: sync.max_attempts.max(1),
            base_delay: Duration::from_millis(sync.backoff_base_ms),
            max_delay: Duration::from_millis(sync.backoff_max_ms),
        }
    }

    /// Delay before attempt `attempt` (1-based; attempt 1 has none).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u32 << (attempt - 2).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    attempt += 1;
                    let delay = self.delay_for(attempt);
                    tracing::debug!(op = label, attempt, ?delay, error = %e, "retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if e.is_transient() {
                        tracing::warn!(op = label, attempts = attempt, error = %e, "giving up");
                    }
                    return Err(e);
                }
            }
        }
    }
}

// ============ Rate limit ============

/// Spaces calls to [`acquire`](Self::acquire) at least `1 / rate` apart.
pub struct RateLimiter {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn per_second(rate: f64) -> Self {
        let interval = if rate.is_finite() && rate > 0.0 {
            Duration::from_secs_f64(1.0 / rate)
        } else {
            Duration::ZERO
        };
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    pub async fn acquire(&self) {
        let mut next = self.next_slot.lock().await;
        let now = Instant::now();
        if let Some(at) = *next {
            if at > now {
                tokio::time::sleep_until(at).await;
            }
        }
        let start = next.map_or(now, |at| at.max(now));
        *next = Some(start + self.interval);
    }
}
