//! TOML configuration parsing and validation.
//!
//! Every section except `[db]` is optional and falls back to the defaults
//! below. Only source kinds listed under `[connectors.*]` take part in
//! syncing and retrieval.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::SourceKind;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub connectors: ConnectorsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Candidates requested from each source kind independently.
    #[serde(default = "default_k_per_source")]
    pub k_per_source: usize,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_snippet_chars")]
    pub snippet_chars: usize,
    #[serde(default = "default_per_source_timeout_ms")]
    pub per_source_timeout_ms: u64,
    /// Results whose per-source normalized score falls below this are dropped.
    #[serde(default)]
    pub min_normalized_score: f64,
    /// Optional floor on raw cosine similarity, applied before normalization.
    #[serde(default)]
    pub min_similarity: Option<f64>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k_per_source: default_k_per_source(),
            max_results: default_max_results(),
            snippet_chars: default_snippet_chars(),
            per_source_timeout_ms: default_per_source_timeout_ms(),
            min_normalized_score: 0.0,
            min_similarity: None,
        }
    }
}

fn default_k_per_source() -> usize {
    10
}
fn default_max_results() -> usize {
    10
}
fn default_snippet_chars() -> usize {
    240
}
fn default_per_source_timeout_ms() -> u64 {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the Ollama provider (default `http://localhost:11434`).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Body text is cut to this many characters before embedding.
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            max_input_chars: default_max_input_chars(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_input_chars() -> usize {
    8000
}

/// Answer language for the completion prompt.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AnswerLanguage {
    #[default]
    De,
    En,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompletionConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_completion_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub language: AnswerLanguage,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            timeout_secs: default_completion_timeout_secs(),
            language: AnswerLanguage::default(),
        }
    }
}

impl CompletionConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_completion_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionsConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// Identity-provider page the SSO login redirects to.
    #[serde(default)]
    pub sso_login_url: Option<String>,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            sso_login_url: None,
        }
    }
}

fn default_ttl_secs() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Interval between reconciliation passes, which re-fetch every path
    /// regardless of reported modification times.
    #[serde(default = "default_reconciliation_interval_secs")]
    pub reconciliation_interval_secs: u64,
    #[serde(default = "default_max_body_chars")]
    pub max_body_chars: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            fetch_concurrency: default_fetch_concurrency(),
            requests_per_second: default_requests_per_second(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            reconciliation_interval_secs: default_reconciliation_interval_secs(),
            max_body_chars: default_max_body_chars(),
        }
    }
}

fn default_fetch_concurrency() -> usize {
    4
}
fn default_requests_per_second() -> f64 {
    1.0
}
fn default_max_attempts() -> u32 {
    4
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_reconciliation_interval_secs() -> u64 {
    86_400
}
fn default_max_body_chars() -> usize {
    100_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConnectorsConfig {
    pub share: Option<ShareConnectorConfig>,
    pub wiki: Option<PortalConnectorConfig>,
    pub public_portal: Option<PortalConnectorConfig>,
    pub sso_portal: Option<PortalConnectorConfig>,
}

impl ConnectorsConfig {
    /// Source kinds that have a connector section, in display order.
    pub fn configured_kinds(&self) -> Vec<SourceKind> {
        SourceKind::ALL
            .into_iter()
            .filter(|kind| self.is_configured(*kind))
            .collect()
    }

    pub fn is_configured(&self, kind: SourceKind) -> bool {
        match kind {
            SourceKind::Share => self.share.is_some(),
            SourceKind::Wiki => self.wiki.is_some(),
            SourceKind::PublicPortal => self.public_portal.is_some(),
            SourceKind::SsoPortal => self.sso_portal.is_some(),
        }
    }

    pub fn portal(&self, kind: SourceKind) -> Option<&PortalConnectorConfig> {
        match kind {
            SourceKind::Wiki => self.wiki.as_ref(),
            SourceKind::PublicPortal => self.public_portal.as_ref(),
            SourceKind::SsoPortal => self.sso_portal.as_ref(),
            SourceKind::Share => None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ShareConnectorConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    /// Local reads are cheap, so the share gets its own, higher limit.
    #[serde(default = "default_share_requests_per_second")]
    pub requests_per_second: f64,
}

fn default_share_requests_per_second() -> f64 {
    200.0
}

fn default_include_globs() -> Vec<String> {
    ["pdf", "docx", "pptx", "xlsx", "txt", "md", "csv", "html", "htm"]
        .iter()
        .map(|ext| format!("**/*.{}", ext))
        .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct PortalConnectorConfig {
    pub base_url: String,
    /// Read `sitemap.xml` under `base_url` to discover pages.
    #[serde(default = "default_true")]
    pub use_sitemap: bool,
    /// Seed pages, relative to `base_url` or absolute on the same host.
    #[serde(default)]
    pub pages: Vec<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
    /// Overrides `sync.requests_per_second` for this portal.
    #[serde(default)]
    pub requests_per_second: Option<f64>,
    /// URL path prefixes of the portal's login page, e.g.
    /// `/wiki/Special:UserLogin`. Redirects there end the session even when
    /// they stay under `base_url`.
    #[serde(default)]
    pub login_paths: Vec<String>,
}

impl PortalConnectorConfig {
    pub fn rate(&self, sync: &SyncConfig) -> f64 {
        self.requests_per_second.unwrap_or(sync.requests_per_second)
    }
}

fn default_true() -> bool {
    true
}
fn default_request_timeout_secs() -> u64 {
    30
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Retrieval
    if config.retrieval.k_per_source < 1 {
        anyhow::bail!("retrieval.k_per_source must be >= 1");
    }
    if config.retrieval.max_results < 1 {
        anyhow::bail!("retrieval.max_results must be >= 1");
    }
    if config.retrieval.snippet_chars < 16 {
        anyhow::bail!("retrieval.snippet_chars must be >= 16");
    }
    if !(0.0..=1.0).contains(&config.retrieval.min_normalized_score) {
        anyhow::bail!("retrieval.min_normalized_score must be in [0.0, 1.0]");
    }

    // Sync
    if config.sync.requests_per_second <= 0.0 || !config.sync.requests_per_second.is_finite() {
        anyhow::bail!("sync.requests_per_second must be > 0");
    }
    if config.sync.max_attempts < 1 {
        anyhow::bail!("sync.max_attempts must be >= 1");
    }
    if config.sync.fetch_concurrency < 1 {
        anyhow::bail!("sync.fetch_concurrency must be >= 1");
    }

    // Embedding
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }

    match config.completion.provider.as_str() {
        "disabled" => {}
        "ollama" => {
            if config.completion.model.is_none() {
                anyhow::bail!("completion.model must be specified when provider is 'ollama'");
            }
        }
        other => anyhow::bail!(
            "Unknown completion provider: '{}'. Must be disabled or ollama.",
            other
        ),
    }

    // Connectors
    for kind in [
        SourceKind::Wiki,
        SourceKind::PublicPortal,
        SourceKind::SsoPortal,
    ] {
        if let Some(portal) = config.connectors.portal(kind) {
            let url = url::Url::parse(&portal.base_url).with_context(|| {
                format!("connectors.{}.base_url is not a valid URL", kind.as_str())
            })?;
            if url.scheme() != "http" && url.scheme() != "https" {
                anyhow::bail!(
                    "connectors.{}.base_url must be http or https, got '{}'",
                    kind.as_str(),
                    url.scheme()
                );
            }
            if url.host_str().is_none() {
                anyhow::bail!("connectors.{}.base_url has no host", kind.as_str());
            }
            if let Some(path) = portal.login_paths.iter().find(|p| !p.starts_with('/')) {
                anyhow::bail!(
                    "connectors.{}.login_paths entries must start with '/', got '{}'",
                    kind.as_str(),
                    path
                );
            }
        }
    }

    Ok(())
}
