//! HTTP plumbing shared by the three portal connectors.
//!
//! A [`PortalClient`] owns one `reqwest::Client`, one rate limiter and one
//! retry policy per portal. Listing reads `sitemap.xml` (following a
//! `<sitemapindex>` one level down) plus configured seed pages, keeping only
//! URLs under the portal's base URL.
//!
//! Response classification:
//!
//! | Response | Result |
//! |----------|--------|
//! | 2xx | content |
//! | 401 / 403 | session invalidated, `AuthenticationRequired` |
//! | redirect out of the base URL or to a login path (credentialed portals) | session invalidated, `AuthenticationRequired` |
//! | 404 / 410 | `NotFound` |
//! | 429 / 5xx / network | transient, retried with backoff |
//! | other 4xx | permanent failure |

use chrono::{DateTime, NaiveDate, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_LANGUAGE, CONTENT_TYPE, COOKIE, LOCATION};
use reqwest::StatusCode;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::{ConnectorHealth, RateLimiter, RetryPolicy};
use crate::config::{PortalConnectorConfig, SyncConfig};
use crate::error::FetchError;
use crate::models::{ChangedPath, Listing, RawContent, SkippedPath, SourceKind};
use crate::session::{Credential, SessionStore};

const USER_AGENT: &str = concat!("fedr/", env!("CARGO_PKG_VERSION"));
const ACCEPT_LANGUAGE_VALUE: &str = "de-DE,de;q=0.8,en;q=0.6";
/// Source path used for the base URL itself.
const ROOT_PATH: &str = ".";
const MAX_REDIRECTS: usize = 10;

pub struct PortalClient {
    kind: SourceKind,
    base_url: Url,
    client: reqwest::Client,
    limiter: RateLimiter,
    retry: RetryPolicy,
    /// Present for portals that need a credential.
    sessions: Option<Arc<SessionStore>>,
    use_sitemap: bool,
    pages: Vec<String>,
}

impl PortalClient {
    pub fn new(
        kind: SourceKind,
        config: &PortalConnectorConfig,
        sync: &SyncConfig,
        sessions: Option<Arc<SessionStore>>,
    ) -> anyhow::Result<Self> {
        let mut base_url = Url::parse(&config.base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static(ACCEPT_LANGUAGE_VALUE),
        );

        // A credentialed portal that redirects out of its own scope, or to
        // its login page, has stopped accepting the credential. Such
        // redirects are not followed so `get_once` sees the 3xx.
        let redirect = if sessions.is_some() {
            let scope = base_url.clone();
            let login_paths = config.login_paths.clone();
            reqwest::redirect::Policy::custom(move |attempt| {
                let target = attempt.url();
                let is_login = login_paths.iter().any(|p| target.path().starts_with(p.as_str()));
                if is_login || !in_scope(&scope, target) {
                    attempt.stop()
                } else if attempt.previous().len() >= MAX_REDIRECTS {
                    attempt.error("too many redirects")
                } else {
                    attempt.follow()
                }
            })
        } else {
            reqwest::redirect::Policy::limited(MAX_REDIRECTS)
        };

        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .redirect(redirect)
            .build()?;

        Ok(Self {
            kind,
            base_url,
            client,
            limiter: RateLimiter::per_second(config.rate(sync)),
            retry: RetryPolicy::from_config(sync),
            sessions,
            use_sitemap: config.use_sitemap,
            pages: config.pages.clone(),
        })
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// The session credential, checked before every request.
    fn credential(&self) -> Result<Option<Credential>, FetchError> {
        match &self.sessions {
            None => Ok(None),
            Some(store) => store
                .get(self.kind)
                .map(|s| s.credential)
                .ok_or(FetchError::AuthenticationRequired),
        }
    }

    fn auth_failed(&self, reason: &str) -> FetchError {
        if let Some(store) = &self.sessions {
            tracing::warn!(source = %self.kind, %reason, "credential rejected by portal");
            store.invalidate(self.kind);
            FetchError::AuthenticationRequired
        } else {
            FetchError::permanent(format!("access denied: {}", reason))
        }
    }

    async fn get_once(&self, url: &Url) -> Result<(Vec<u8>, String), FetchError> {
        let credential = self.credential()?;
        self.limiter.acquire().await;

        let mut request = self.client.get(url.clone());
        request = match credential {
            Some(Credential::Bearer(token)) => request.bearer_auth(token),
            Some(Credential::Cookie(cookie)) => request.header(COOKIE, cookie),
            Some(Credential::Basic { username, password }) => {
                request.basic_auth(username, Some(password))
            }
            None => request,
        };

        let response = request
            .send()
            .await
            .map_err(|e| FetchError::transient(format!("{}: {}", url, e)))?;
        let status = response.status();

        if status.is_redirection() {
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            if self.sessions.is_some() {
                return Err(self.auth_failed(&format!("redirected to {}", location)));
            }
            return Err(FetchError::permanent(format!(
                "{}: unexpected redirect to {}",
                url, location
            )));
        }

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(self.auth_failed(&status.to_string()))
            }
            StatusCode::NOT_FOUND | StatusCode::GONE => Err(FetchError::NotFound(url.to_string())),
            s if s == StatusCode::TOO_MANY_REQUESTS || s.is_server_error() => {
                Err(FetchError::transient(format!("{}: HTTP {}", url, s)))
            }
            s if !s.is_success() => Err(FetchError::permanent(format!("{}: HTTP {}", url, s))),
            _ => {
                let content_type = response
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("text/html")
                    .to_string();
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| FetchError::transient(format!("{}: {}", url, e)))?;
                Ok((bytes.to_vec(), content_type))
            }
        }
    }

    /// GET with rate limiting and retry on transient failures.
    pub async fn get(&self, url: &Url) -> Result<(Vec<u8>, String), FetchError> {
        self.retry.run(self.kind.as_str(), || self.get_once(url)).await
    }

    /// `source_path` for an in-scope URL, `None` for anything outside the
    /// portal's base URL.
    pub fn source_path_for(&self, url: &Url) -> Option<String> {
        if !same_origin(&self.base_url, url) {
            return None;
        }
        let rest = url.path().strip_prefix(self.base_url.path())?;
        let mut path = if rest.is_empty() {
            ROOT_PATH.to_string()
        } else {
            rest.to_string()
        };
        if let Some(q) = url.query() {
            path.push('?');
            path.push_str(q);
        }
        Some(path)
    }

    pub fn url_for(&self, source_path: &str) -> Result<Url, FetchError> {
        let url = self
            .base_url
            .join(source_path)
            .map_err(|e| FetchError::permanent(format!("bad path {}: {}", source_path, e)))?;
        if self.source_path_for(&url).is_none() {
            return Err(FetchError::permanent(format!(
                "path outside portal: {}",
                source_path
            )));
        }
        Ok(url)
    }

    pub async fn list(&self, cursor: Option<DateTime<Utc>>) -> Result<Listing, FetchError> {
        let mut found: BTreeMap<String, Option<DateTime<Utc>>> = BTreeMap::new();
        let mut skipped = Vec::new();

        for page in &self.pages {
            match self.base_url.join(page) {
                Ok(url) => match self.source_path_for(&url) {
                    Some(path) => {
                        found.entry(path).or_insert(None);
                    }
                    None => tracing::warn!(source = %self.kind, %page, "seed page outside portal, ignored"),
                },
                Err(e) => tracing::warn!(source = %self.kind, %page, error = %e, "invalid seed page"),
            }
        }

        if self.use_sitemap {
            self.collect_sitemap(&mut found, &mut skipped).await?;
        }

        let mut listing = Listing {
            skipped,
            ..Listing::default()
        };
        for (source_path, last_modified) in found {
            listing.push(
                ChangedPath {
                    source_path,
                    last_modified,
                },
                cursor,
            );
        }
        Ok(listing)
    }

    async fn collect_sitemap(
        &self,
        found: &mut BTreeMap<String, Option<DateTime<Utc>>>,
        skipped: &mut Vec<SkippedPath>,
    ) -> Result<(), FetchError> {
        let sitemap_url = self
            .base_url
            .join("sitemap.xml")
            .map_err(|e| FetchError::permanent(e.to_string()))?;

        let root = match self.get(&sitemap_url).await {
            Ok((bytes, _)) => parse_sitemap(&bytes)?,
            Err(FetchError::NotFound(_)) => {
                tracing::info!(source = %self.kind, "no sitemap.xml, using seed pages only");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let entries = match root {
            Sitemap::UrlSet(entries) => entries,
            Sitemap::Index(children) => {
                let mut entries = Vec::new();
                for child in children {
                    let Some(child_url) = Url::parse(&child)
                        .ok()
                        .filter(|u| u.host_str() == self.base_url.host_str())
                    else {
                        continue;
                    };
                    match self.get(&child_url).await.and_then(|(b, _)| parse_sitemap(&b)) {
                        Ok(Sitemap::UrlSet(mut more)) => entries.append(&mut more),
                        Ok(Sitemap::Index(_)) => {
                            tracing::debug!(source = %self.kind, url = %child_url, "nested sitemap index ignored");
                        }
                        Err(FetchError::AuthenticationRequired) => {
                            return Err(FetchError::AuthenticationRequired)
                        }
                        Err(e) => {
                            // Which pages the child listed is unknown, so no
                            // deletion can be inferred anywhere in this portal.
                            tracing::warn!(source = %self.kind, url = %child_url, error = %e, "child sitemap skipped");
                            skipped.push(SkippedPath {
                                source_path: String::new(),
                                reason: format!("sitemap {}: {}", child_url, e),
                            });
                        }
                    }
                }
                entries
            }
        };

        for entry in entries {
            let Some(path) = Url::parse(&entry.loc)
                .ok()
                .and_then(|u| self.source_path_for(&u))
            else {
                continue;
            };
            let slot = found.entry(path).or_insert(None);
            if entry.lastmod.is_some() {
                *slot = entry.lastmod;
            }
        }
        Ok(())
    }

    pub async fn fetch(&self, source_path: &str) -> Result<RawContent, FetchError> {
        let url = self.url_for(source_path)?;
        let (bytes, content_type) = self.get(&url).await.map_err(|e| match e {
            FetchError::NotFound(_) => FetchError::NotFound(source_path.to_string()),
            other => other,
        })?;
        Ok(RawContent {
            bytes,
            content_type,
            uri: url.to_string(),
            title_hint: None,
        })
    }

    pub async fn health(&self) -> ConnectorHealth {
        if let Err(e) = self.credential() {
            return ConnectorHealth::failing(format!("{} ({})", e, self.base_url));
        }
        match self.get_once(&self.base_url).await {
            Ok(_) => ConnectorHealth::ok(format!("reachable ({})", self.base_url)),
            Err(e) => ConnectorHealth::failing(format!("{} ({})", e, self.base_url)),
        }
    }
}

fn same_origin(base: &Url, url: &Url) -> bool {
    url.scheme() == base.scheme()
        && url.host_str() == base.host_str()
        && url.port_or_known_default() == base.port_or_known_default()
}

/// Same origin as `base` and under its path.
fn in_scope(base: &Url, url: &Url) -> bool {
    same_origin(base, url) && url.path().starts_with(base.path())
}

/// A parsed `sitemap.xml`.
#[derive(Debug, PartialEq)]
pub enum Sitemap {
    UrlSet(Vec<SitemapEntry>),
    /// Locations of child sitemaps.
    Index(Vec<String>),
}

#[derive(Debug, PartialEq)]
pub struct SitemapEntry {
    pub loc: String,
    pub lastmod: Option<DateTime<Utc>>,
}

pub fn parse_sitemap(xml: &[u8]) -> Result<Sitemap, FetchError> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut is_index = false;
    let mut entries = Vec::new();
    let mut children = Vec::new();
    let mut loc: Option<String> = None;
    let mut lastmod: Option<DateTime<Utc>> = None;
    let mut field: Option<&'static str> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"sitemapindex" => is_index = true,
                b"url" | b"sitemap" => {
                    loc = None;
                    lastmod = None;
                }
                b"loc" => field = Some("loc"),
                b"lastmod" => field = Some("lastmod"),
                _ => field = None,
            },
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| FetchError::permanent(format!("sitemap: {}", e)))?;
                match field {
                    Some("loc") => loc = Some(text.trim().to_string()),
                    Some("lastmod") => lastmod = parse_lastmod(text.trim()),
                    _ => {}
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"url" => {
                    if let Some(loc) = loc.take() {
                        entries.push(SitemapEntry {
                            loc,
                            lastmod: lastmod.take(),
                        });
                    }
                }
                b"sitemap" => {
                    if let Some(loc) = loc.take() {
                        children.push(loc);
                    }
                }
                _ => field = None,
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(FetchError::permanent(format!("sitemap: {}", e))),
            _ => {}
        }
        buf.clear();
    }

    if is_index {
        Ok(Sitemap::Index(children))
    } else {
        Ok(Sitemap::UrlSet(entries))
    }
}

/// W3C datetime as used in sitemaps: full RFC 3339 or a bare date.
fn parse_lastmod(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn client(base: &str) -> PortalClient {
        let config = PortalConnectorConfig {
            base_url: base.to_string(),
            use_sitemap: true,
            pages: vec![],
            timeout_secs: 5,
            requests_per_second: Some(1000.0),
            login_paths: vec![],
        };
        PortalClient::new(
            SourceKind::PublicPortal,
            &config,
            &SyncConfig::default(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn parses_urlset_with_lastmod() {
        let xml = br#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url><loc>https://portal.example.org/a</loc><lastmod>2024-03-01</lastmod></url>
  <url><loc>https://portal.example.org/b?x=1&amp;y=2</loc></url>
</urlset>"#;
        let Sitemap::UrlSet(entries) = parse_sitemap(xml).unwrap() else {
            panic!("expected urlset");
        };
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[0].lastmod,
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(entries[1].loc, "https://portal.example.org/b?x=1&y=2");
        assert_eq!(entries[1].lastmod, None);
    }

    #[test]
    fn parses_sitemap_index() {
        let xml = br#"<sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <sitemap><loc>https://portal.example.org/s1.xml</loc><lastmod>2024-01-01T10:00:00+01:00</lastmod></sitemap>
</sitemapindex>"#;
        assert_eq!(
            parse_sitemap(xml).unwrap(),
            Sitemap::Index(vec!["https://portal.example.org/s1.xml".to_string()])
        );
    }

    #[test]
    fn lastmod_formats() {
        assert_eq!(
            parse_lastmod("2024-01-01T10:00:00+01:00"),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap())
        );
        assert!(parse_lastmod("yesterday").is_none());
    }

    #[test]
    fn source_paths_are_relative_to_base() {
        let c = client("https://portal.example.org/wissen");
        let url = |s: &str| Url::parse(s).unwrap();
        assert_eq!(
            c.source_path_for(&url("https://portal.example.org/wissen/fertigung/laser")),
            Some("fertigung/laser".to_string())
        );
        assert_eq!(
            c.source_path_for(&url("https://portal.example.org/wissen/")),
            Some(".".to_string())
        );
        assert_eq!(
            c.source_path_for(&url("https://portal.example.org/wissen/suche?q=a")),
            Some("suche?q=a".to_string())
        );
        assert_eq!(
            c.source_path_for(&url("https://other.example.org/wissen/x")),
            None
        );
        assert_eq!(
            c.source_path_for(&url("https://portal.example.org/impressum")),
            None
        );
    }

    #[test]
    fn url_for_round_trips_source_path() {
        let c = client("https://portal.example.org/wissen/");
        let url = c.url_for("fertigung/laser").unwrap();
        assert_eq!(url.as_str(), "https://portal.example.org/wissen/fertigung/laser");
        assert_eq!(c.url_for(".").unwrap().as_str(), "https://portal.example.org/wissen/");
        assert!(c.url_for("../impressum").is_err());
        assert!(c.url_for("https://evil.example.com/").is_err());
    }

    #[test]
    fn redirect_scope_is_base_path() {
        let base = Url::parse("https://wiki.example.org/wiki/").unwrap();
        let url = |s: &str| Url::parse(s).unwrap();
        assert!(in_scope(&base, &url("https://wiki.example.org/wiki/Laborplan")));
        assert!(!in_scope(&base, &url("https://wiki.example.org/login?next=/wiki/")));
        assert!(!in_scope(&base, &url("https://sso.example.org/wiki/Laborplan")));
        assert!(!in_scope(&base, &url("http://wiki.example.org/wiki/Laborplan")));
    }
}
