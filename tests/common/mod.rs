//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use federated_retrieval::completion::DisabledCompleter;
use federated_retrieval::config::Config;
use federated_retrieval::connector::ConnectorRegistry;
use federated_retrieval::embedding::Embedder;
use federated_retrieval::engine::{Engine, EngineParts};
use federated_retrieval::index::SqliteIndex;
use federated_retrieval::session::SessionStore;

pub const DIMS: usize = 256;

/// Hashes lowercased words into buckets. Texts sharing words end up close,
/// which is all the ranking tests need. Counts every text it embeds.
#[derive(Default)]
pub struct BagOfWordsEmbedder {
    pub texts: AtomicUsize,
}

impl BagOfWordsEmbedder {
    pub fn embedded(&self) -> usize {
        self.texts.load(Ordering::SeqCst)
    }
}

pub fn bag_of_words(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; DIMS];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > 2)
    {
        let word = word.to_lowercase();
        let mut h: u32 = 2166136261;
        for b in word.bytes() {
            h ^= b as u32;
            h = h.wrapping_mul(16777619);
        }
        v[(h as usize) % DIMS] += 1.0;
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    v
}

#[async_trait]
impl Embedder for BagOfWordsEmbedder {
    fn model_name(&self) -> &str {
        "bag-of-words"
    }
    fn dims(&self) -> usize {
        DIMS
    }
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        self.texts.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| bag_of_words(t)).collect())
    }
}

/// Config with a SQLite file under `root/data` plus extra TOML sections.
pub fn config(root: &Path, extra: &str) -> Config {
    let toml = format!(
        r#"[db]
path = "{}"

[retrieval]
per_source_timeout_ms = 5000

[sync]
backoff_base_ms = 10
backoff_max_ms = 50
max_attempts = 2

{}
"#,
        root.join("data/fedr.sqlite").display(),
        extra
    );
    let config: Config = toml::from_str(&toml).unwrap();
    federated_retrieval::config::validate(&config).unwrap();
    config
}

/// Engine with the real connectors and index but a local embedder.
pub async fn engine(config: Config, embedder: Arc<BagOfWordsEmbedder>) -> Engine {
    let sessions = Arc::new(SessionStore::from_config(&config.sessions).unwrap());
    let connectors = ConnectorRegistry::from_config(&config, sessions.clone()).unwrap();
    let index = Arc::new(SqliteIndex::open(&config.db.path).await.unwrap());
    Engine::from_parts(
        config,
        EngineParts {
            sessions,
            connectors,
            index: index.clone(),
            sync_state: index,
            embedder,
            completer: Arc::new(DisabledCompleter),
        },
    )
}

/// Minimal valid PDF whose single page shows `phrase`. Offsets in the xref
/// table are computed so pdf-extract can parse it.
pub fn minimal_pdf_with_phrase(phrase: &str) -> Vec<u8> {
    let content = format!("BT /F1 12 Tf 100 700 Td ({}) Tj ET", phrase);
    let mut out = Vec::new();
    out.extend_from_slice(b"%PDF-1.4\n");
    let o1 = out.len();
    out.extend_from_slice(b"1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n");
    let o2 = out.len();
    out.extend_from_slice(b"2 0 obj << /Type /Pages /Kids [3 0 R] /Count 1 >> endobj\n");
    let o3 = out.len();
    out.extend_from_slice(b"3 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents 4 0 R /Resources << /Font << /F1 5 0 R >> >> >> endobj\n");
    let o4 = out.len();
    out.extend_from_slice(
        format!(
            "4 0 obj << /Length {} >> stream\n{}\nendstream endobj\n",
            content.len(),
            content
        )
        .as_bytes(),
    );
    let o5 = out.len();
    out.extend_from_slice(
        b"5 0 obj << /Type /Font /Subtype /Type1 /BaseFont /Helvetica >> endobj\n",
    );
    let xref_start = out.len();
    out.extend_from_slice(b"xref\n0 6\n");
    out.extend_from_slice(format!("{:010} 65535 f \n", 0).as_bytes());
    for offset in [o1, o2, o3, o4, o5] {
        out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
    }
    out.extend_from_slice(b"trailer << /Size 6 /Root 1 0 R >>\nstartxref\n");
    out.extend_from_slice(format!("{}\n", xref_start).as_bytes());
    out.extend_from_slice(b"%%EOF\n");
    out
}

/// A small share: one PDF and a few text files on unrelated topics.
pub fn write_share(root: &Path) {
    fs::create_dir_all(root.join("protokolle")).unwrap();
    fs::write(
        root.join("report.pdf"),
        minimal_pdf_with_phrase("Der Laborplan liegt im Sekretariat"),
    )
    .unwrap();
    fs::write(
        root.join("protokolle/kantine.txt"),
        "Die Kantine hat montags bis freitags geöffnet.\n\nMittagessen gibt es ab elf Uhr.",
    )
    .unwrap();
    fs::write(
        root.join("protokolle/parkplatz.md"),
        "# Parkplatz\n\nDer Parkplatz hinter dem Gebäude ist für Besucher reserviert.",
    )
    .unwrap();
}

// ============ Fake portals ============

pub const WIKI_TOKEN: &str = "wiki-token";
pub const SSO_COOKIE: &str = "idm_session=ok";
/// Wiki cookie that gets redirected to the site-wide `/login` page.
pub const STALE_WIKI_COOKIE: &str = "sid=stale";
/// Wiki cookie that gets redirected to the login page under `/wiki/`.
pub const STALE_WIKI_COOKIE_IN_SCOPE: &str = "sid=expired";
const LOGIN_TEXT: &str = "Bitte melden Sie sich an. Benutzername und Passwort eingeben.";

/// One HTTP server playing the wiki (`/wiki/`, bearer token; a session
/// cookie gets redirected to a login page), the public portal (`/public/`,
/// open) and the SSO portal (`/idm/`, cookie, redirects to a foreign login
/// host otherwise).
pub struct FakePortals {
    pub base: String,
    /// When set, the wiki answers 401 to every request.
    pub reject_wiki: AtomicBool,
    pub requests: AtomicUsize,
}

const PAGES: &[(&str, &str, &str, &str)] = &[
    (
        "wiki",
        "laborplan",
        "Laborplan",
        "Der aktuelle Laborplan für das Chemielabor steht im Wiki unter Organisation.",
    ),
    (
        "wiki",
        "urlaub",
        "Urlaub",
        "Urlaubsanträge werden über das Personalportal gestellt und vom Teamleiter genehmigt.",
    ),
    (
        "public",
        "oeffnungszeiten",
        "Öffnungszeiten",
        "Die Bibliothek ist montags bis freitags von acht bis achtzehn Uhr geöffnet.",
    ),
    (
        "idm",
        "passwort",
        "Passwort ändern",
        "Das Passwort für Ihr Benutzerkonto ändern Sie im Identitätsportal unter Sicherheit.",
    ),
];

fn html_page(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html><html lang=\"de\"><head><meta charset=\"utf-8\"><title>{title}</title></head>\
         <body><main><h1>{title}</h1><p>{body}</p><p>{body}</p></main></body></html>"
    )
}

fn sitemap(base: &str, portal: &str) -> String {
    let mut xml = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <urlset xmlns=\"http://www.sitemaps.org/schemas/sitemap/0.9\">",
    );
    for (p, page, _, _) in PAGES.iter().filter(|(p, ..)| *p == portal) {
        xml.push_str(&format!(
            "<url><loc>{}/{}/{}</loc><lastmod>2026-01-10</lastmod></url>",
            base, p, page
        ));
    }
    xml.push_str("</urlset>");
    xml
}

async fn serve_portal(
    State(fake): State<Arc<FakePortals>>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    fake.requests.fetch_add(1, Ordering::SeqCst);
    let path = uri.path().trim_start_matches('/');
    let (portal, rest) = path.split_once('/').unwrap_or((path, ""));

    let header_is = |name: header::HeaderName, expected: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map_or(false, |v| v == expected)
    };
    match portal {
        "login" => return login_page(),
        "wiki" if rest == "Spezial:Anmelden" => return login_page(),
        "wiki" if header_is(header::COOKIE, STALE_WIKI_COOKIE) => {
            return (StatusCode::FOUND, [(header::LOCATION, "/login?next=/wiki/")]).into_response();
        }
        "wiki" if header_is(header::COOKIE, STALE_WIKI_COOKIE_IN_SCOPE) => {
            return (StatusCode::FOUND, [(header::LOCATION, "/wiki/Spezial:Anmelden")])
                .into_response();
        }
        "wiki" => {
            if fake.reject_wiki.load(Ordering::SeqCst)
                || !header_is(header::AUTHORIZATION, &format!("Bearer {}", WIKI_TOKEN))
            {
                return StatusCode::UNAUTHORIZED.into_response();
            }
        }
        "idm" => {
            if !header_is(header::COOKIE, SSO_COOKIE) {
                return (
                    StatusCode::FOUND,
                    [(header::LOCATION, "http://localhost:9/login")],
                )
                    .into_response();
            }
        }
        "public" => {}
        _ => return StatusCode::NOT_FOUND.into_response(),
    }

    if rest == "sitemap.xml" {
        return (
            [(header::CONTENT_TYPE, "application/xml")],
            sitemap(&fake.base, portal),
        )
            .into_response();
    }
    if rest.is_empty() {
        return ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], html_page(portal, portal))
            .into_response();
    }
    match PAGES.iter().find(|(p, page, ..)| *p == portal && *page == rest) {
        Some((_, _, title, body)) => (
            [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
            Body::from(html_page(title, body)),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn login_page() -> Response {
    (
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        html_page("Anmeldung", LOGIN_TEXT),
    )
        .into_response()
}

pub async fn spawn_fake_portals() -> Arc<FakePortals> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let fake = Arc::new(FakePortals {
        base: format!("http://{}", addr),
        reject_wiki: AtomicBool::new(false),
        requests: AtomicUsize::new(0),
    });
    let app = Router::new()
        .fallback(serve_portal)
        .with_state(fake.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    fake
}

/// `[sessions]` and `[connectors.*]` sections for the three portals.
pub fn portal_sections(fake: &FakePortals) -> String {
    format!(
        r#"[sessions]
sso_login_url = "http://localhost:9/login"

[connectors.wiki]
base_url = "{base}/wiki/"
requests_per_second = 1000.0
login_paths = ["/wiki/Spezial:Anmelden"]

[connectors.public_portal]
base_url = "{base}/public/"
requests_per_second = 1000.0

[connectors.sso_portal]
base_url = "{base}/idm/"
requests_per_second = 1000.0
"#,
        base = fake.base
    )
}
