//! HTTP retrieval API.
//!
//! Exposes the [`Engine`] as JSON over HTTP for the answer-generation
//! front end.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Liveness and version |
//! | `GET`  | `/sources` | Configured sources with health and session state |
//! | `POST` | `/retrieve` | Federated retrieval |
//! | `POST` | `/answer` | Retrieval plus generated answer |
//! | `POST` | `/sync` | Start an indexing pass in the background (202) |
//! | `GET`  | `/sessions` | Session status per configured source |
//! | `POST` | `/sessions/{kind}/login` | Hand a credential to the session store |
//! | `POST` | `/sessions/{kind}/logout` | Drop the session |
//! | `POST` | `/sso/begin` | Start the SSO portal login |
//! | `POST` | `/sso/complete` | Finish the SSO portal login |
//! | `GET`  | `/stats` | Index statistics |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `auth_required` (401), `not_found` (404),
//! `internal` (500).

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tower_http::cors::{Any, CorsLayer};

use crate::engine::{AnswerResponse, Engine, EngineStats, SyncTarget};
use crate::models::SourceKind;
use crate::planner::RetrievalResponse;
use crate::session::{Credential, CredentialSession, SessionError, SessionStatus, SsoChallenge};
use crate::sources::{list_sources, SourceInfo};

/// Bind to `[server].bind`, start the background sync loop, and serve until
/// the process ends.
pub async fn run_server(engine: Engine) -> anyhow::Result<()> {
    let bind_addr = engine.config().server.bind.clone();

    tokio::spawn(engine.clone().run_reconciliation_loop());

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "retrieval API listening");
    axum::serve(listener, router(engine)).await?;

    Ok(())
}

pub fn router(engine: Engine) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/sources", get(handle_sources))
        .route("/retrieve", post(handle_retrieve))
        .route("/answer", post(handle_answer))
        .route("/sync", post(handle_sync))
        .route("/sessions", get(handle_sessions))
        .route("/sessions/{kind}/login", post(handle_login))
        .route("/sessions/{kind}/logout", post(handle_logout))
        .route("/sso/begin", post(handle_sso_begin))
        .route("/sso/complete", post(handle_sso_complete))
        .route("/stats", get(handle_stats))
        .layer(cors)
        .with_state(engine)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn auth_required(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        code: "auth_required",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: message.into(),
    }
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::InvalidSsoState => auth_required(err.to_string()),
            SessionError::NoCredentialRequired(_) | SessionError::SsoNotConfigured => {
                bad_request(err.to_string())
            }
        }
    }
}

/// Parse a `{kind}` path segment and make sure it is configured.
fn configured_kind(engine: &Engine, raw: &str) -> Result<SourceKind, AppError> {
    let kind: SourceKind = raw.parse().map_err(|e: anyhow::Error| bad_request(e.to_string()))?;
    if engine.connectors().get(kind).is_none() {
        return Err(not_found(format!("source '{}' is not configured", kind)));
    }
    Ok(kind)
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /sources ============

#[derive(Serialize)]
struct SourcesResponse {
    sources: Vec<SourceInfo>,
}

async fn handle_sources(State(engine): State<Engine>) -> Json<SourcesResponse> {
    Json(SourcesResponse {
        sources: list_sources(&engine).await,
    })
}

// ============ POST /retrieve, /answer ============

#[derive(Deserialize)]
struct QueryRequest {
    query: String,
    #[serde(default)]
    max_results: Option<usize>,
}

impl QueryRequest {
    fn validate(&self) -> Result<(), AppError> {
        if self.query.trim().is_empty() {
            return Err(bad_request("query must not be empty"));
        }
        if self.max_results == Some(0) {
            return Err(bad_request("max_results must be >= 1"));
        }
        Ok(())
    }
}

async fn handle_retrieve(
    State(engine): State<Engine>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<RetrievalResponse>, AppError> {
    req.validate()?;
    Ok(Json(engine.retrieve(req.query.trim(), req.max_results).await))
}

async fn handle_answer(
    State(engine): State<Engine>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<AnswerResponse>, AppError> {
    req.validate()?;
    if !engine.config().completion.is_enabled() {
        return Err(bad_request("completion provider is disabled"));
    }
    engine
        .answer(req.query.trim(), req.max_results)
        .await
        .map(Json)
        .map_err(|e| internal(format!("{:#}", e)))
}

// ============ POST /sync ============

#[derive(Deserialize, Default)]
struct SyncRequest {
    #[serde(default)]
    source: Option<String>,
}

#[derive(Serialize)]
struct SyncAccepted {
    accepted: Vec<SourceKind>,
}

async fn handle_sync(
    State(engine): State<Engine>,
    body: Option<Json<SyncRequest>>,
) -> Result<(StatusCode, Json<SyncAccepted>), AppError> {
    let req = body.map(|Json(b)| b).unwrap_or_default();
    let target = match req.source.as_deref() {
        None | Some("all") => SyncTarget::All,
        Some(raw) => {
            let kind = configured_kind(&engine, raw)?;
            if kind.requires_credential() && engine.sessions().get(kind).is_none() {
                return Err(auth_required(format!("{} requires login before syncing", kind)));
            }
            SyncTarget::One(kind)
        }
    };

    let accepted = match target {
        SyncTarget::All => engine.connectors().kinds(),
        SyncTarget::One(kind) => vec![kind],
    };

    tokio::spawn(async move {
        for outcome in engine.trigger_sync(target).await {
            tracing::debug!(source = ?outcome.source_kind(), "background sync finished");
        }
    });

    Ok((StatusCode::ACCEPTED, Json(SyncAccepted { accepted })))
}

// ============ Sessions ============

#[derive(Serialize)]
struct SessionsResponse {
    sessions: BTreeMap<SourceKind, SessionStatus>,
}

async fn handle_sessions(State(engine): State<Engine>) -> Json<SessionsResponse> {
    Json(SessionsResponse {
        sessions: engine.session_status(),
    })
}

#[derive(Deserialize)]
struct LoginRequest {
    /// `bearer:<token>`, `cookie:<value>` or `basic:<user>:<password>`.
    credential: String,
}

#[derive(Serialize)]
struct SessionView {
    source_kind: SourceKind,
    status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
}

impl From<CredentialSession> for SessionView {
    fn from(s: CredentialSession) -> Self {
        Self {
            source_kind: s.source_kind,
            status: s.status,
            expires_at: s.expires_at,
        }
    }
}

fn parse_credential(raw: &str) -> Result<Credential, AppError> {
    raw.parse()
        .map_err(|e: anyhow::Error| bad_request(e.to_string()))
}

async fn handle_login(
    State(engine): State<Engine>,
    Path(kind): Path<String>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<SessionView>, AppError> {
    let kind = configured_kind(&engine, &kind)?;
    let credential = parse_credential(&req.credential)?;
    let session = engine.login(kind, credential)?;
    Ok(Json(session.into()))
}

async fn handle_logout(
    State(engine): State<Engine>,
    Path(kind): Path<String>,
) -> Result<Json<SessionView>, AppError> {
    let kind = configured_kind(&engine, &kind)?;
    engine.logout(kind);
    Ok(Json(SessionView {
        source_kind: kind,
        status: engine.sessions().status(kind),
        expires_at: None,
    }))
}

async fn handle_sso_begin(State(engine): State<Engine>) -> Result<Json<SsoChallenge>, AppError> {
    configured_kind(&engine, SourceKind::SsoPortal.as_str())?;
    Ok(Json(engine.begin_sso()?))
}

#[derive(Deserialize)]
struct SsoCompleteRequest {
    state: String,
    credential: String,
}

async fn handle_sso_complete(
    State(engine): State<Engine>,
    Json(req): Json<SsoCompleteRequest>,
) -> Result<Json<SessionView>, AppError> {
    configured_kind(&engine, SourceKind::SsoPortal.as_str())?;
    let credential = parse_credential(&req.credential)?;
    let session = engine.complete_sso(&req.state, credential)?;
    Ok(Json(session.into()))
}

// ============ GET /stats ============

async fn handle_stats(State(engine): State<Engine>) -> Result<Json<EngineStats>, AppError> {
    engine
        .stats()
        .await
        .map(Json)
        .map_err(|e| internal(e.to_string()))
}
