//! In-memory credential sessions, one slot per source kind.
//!
//! Sessions live for the lifetime of the process and are never written to
//! disk. The share and the public portal need no credential and always
//! report [`SessionStatus::Authenticated`]. Every slot has its own mutex so
//! a login on the wiki never waits on the SSO portal.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use uuid::Uuid;

use crate::models::SourceKind;

/// How long a pending SSO state token stays valid.
const SSO_STATE_TTL_SECS: i64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Unauthenticated,
    Authenticated,
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Unauthenticated => "unauthenticated",
            SessionStatus::Authenticated => "authenticated",
            SessionStatus::Expired => "expired",
        }
    }
}

/// Opaque credential handed over by a login flow.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Bearer(String),
    /// Raw `Cookie` header value.
    Cookie(String),
    Basic { username: String, password: String },
}

// Secrets stay out of logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Bearer(_) => f.write_str("Bearer(***)"),
            Credential::Cookie(_) => f.write_str("Cookie(***)"),
            Credential::Basic { username, .. } => write!(f, "Basic({}:***)", username),
        }
    }
}

impl FromStr for Credential {
    type Err = anyhow::Error;

    /// Parses `bearer:<token>`, `cookie:<value>` or `basic:<user>:<password>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("credential must look like <scheme>:<value>"))?;
        if rest.is_empty() {
            anyhow::bail!("credential value must not be empty");
        }
        match scheme {
            "bearer" => Ok(Credential::Bearer(rest.to_string())),
            "cookie" => Ok(Credential::Cookie(rest.to_string())),
            "basic" => {
                let (username, password) = rest
                    .split_once(':')
                    .ok_or_else(|| anyhow::anyhow!("basic credential must be basic:<user>:<password>"))?;
                Ok(Credential::Basic {
                    username: username.to_string(),
                    password: password.to_string(),
                })
            }
            other => anyhow::bail!(
                "Unknown credential scheme: '{}'. Use bearer, cookie, or basic.",
                other
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CredentialSession {
    pub source_kind: SourceKind,
    pub status: SessionStatus,
    pub credential: Option<Credential>,
    pub acquired_at: DateTime<Utc>,
    /// `None` means the session never expires.
    pub expires_at: Option<DateTime<Utc>>,
}

impl CredentialSession {
    pub fn authenticated(
        source_kind: SourceKind,
        credential: Credential,
        acquired_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            source_kind,
            status: SessionStatus::Authenticated,
            credential: Some(credential),
            acquired_at,
            expires_at,
        }
    }

    fn open(source_kind: SourceKind) -> Self {
        Self {
            source_kind,
            status: SessionStatus::Authenticated,
            credential: None,
            acquired_at: Utc::now(),
            expires_at: None,
        }
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::Authenticated && self.expires_at.map_or(true, |exp| now <= exp)
    }
}

/// Returned by [`SessionStore::begin_sso`]; the caller sends the user to
/// `redirect_url` and later completes with the same `state`.
#[derive(Debug, Clone, Serialize)]
pub struct SsoChallenge {
    pub state: String,
    pub redirect_url: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq)]
pub enum SessionError {
    #[error("{0} does not need a login")]
    NoCredentialRequired(SourceKind),
    #[error("sso login is not configured (set sessions.sso_login_url)")]
    SsoNotConfigured,
    #[error("sso state is unknown or expired")]
    InvalidSsoState,
}

#[derive(Debug, Clone)]
struct PendingSso {
    state: String,
    expires_at: DateTime<Utc>,
}

pub struct SessionStore {
    slots: HashMap<SourceKind, Mutex<Option<CredentialSession>>>,
    pending_sso: Mutex<Option<PendingSso>>,
    ttl: Duration,
    sso_login_url: Option<url::Url>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SessionStore {
    pub fn new(ttl: Duration, sso_login_url: Option<url::Url>) -> Self {
        let slots = SourceKind::ALL
            .into_iter()
            .filter(|k| k.requires_credential())
            .map(|k| (k, Mutex::new(None)))
            .collect();
        Self {
            slots,
            pending_sso: Mutex::new(None),
            ttl,
            sso_login_url,
        }
    }

    pub fn from_config(config: &crate::config::SessionsConfig) -> anyhow::Result<Self> {
        let sso_login_url = config
            .sso_login_url
            .as_deref()
            .map(url::Url::parse)
            .transpose()
            .map_err(|e| anyhow::anyhow!("sessions.sso_login_url is not a valid URL: {}", e))?;
        Ok(Self::new(
            Duration::seconds(config.ttl_secs as i64),
            sso_login_url,
        ))
    }

    /// A usable session, or `None` when absent or past its expiry.
    ///
    /// Expired sessions are left in place so [`status`](Self::status) can
    /// keep reporting them.
    pub fn get(&self, kind: SourceKind) -> Option<CredentialSession> {
        let Some(slot) = self.slots.get(&kind) else {
            return Some(CredentialSession::open(kind));
        };
        let guard = lock(slot);
        guard
            .as_ref()
            .filter(|s| s.is_valid_at(Utc::now()))
            .cloned()
    }

    pub fn put(&self, session: CredentialSession) -> Result<(), SessionError> {
        let slot = self
            .slots
            .get(&session.source_kind)
            .ok_or(SessionError::NoCredentialRequired(session.source_kind))?;
        *lock(slot) = Some(session);
        Ok(())
    }

    /// Store `credential` as a fresh session expiring after the configured ttl.
    pub fn login(
        &self,
        kind: SourceKind,
        credential: Credential,
    ) -> Result<CredentialSession, SessionError> {
        let now = Utc::now();
        let session = CredentialSession::authenticated(kind, credential, now, Some(now + self.ttl));
        self.put(session.clone())?;
        tracing::info!(source = %kind, expires_at = ?session.expires_at, "session established");
        Ok(session)
    }

    /// Mark the session expired after the remote side rejected it.
    pub fn invalidate(&self, kind: SourceKind) {
        if let Some(slot) = self.slots.get(&kind) {
            if let Some(session) = lock(slot).as_mut() {
                if session.status != SessionStatus::Expired {
                    tracing::warn!(source = %kind, "session invalidated");
                }
                session.status = SessionStatus::Expired;
            }
        }
    }

    /// Destroy the session; the kind reports `unauthenticated` afterwards.
    pub fn logout(&self, kind: SourceKind) {
        if let Some(slot) = self.slots.get(&kind) {
            if lock(slot).take().is_some() {
                tracing::info!(source = %kind, "session closed");
            }
        }
    }

    pub fn status(&self, kind: SourceKind) -> SessionStatus {
        let Some(slot) = self.slots.get(&kind) else {
            return SessionStatus::Authenticated;
        };
        match lock(slot).as_ref() {
            None => SessionStatus::Unauthenticated,
            Some(s) if s.is_valid_at(Utc::now()) => SessionStatus::Authenticated,
            Some(_) => SessionStatus::Expired,
        }
    }

    pub fn status_map(&self, kinds: &[SourceKind]) -> BTreeMap<SourceKind, SessionStatus> {
        kinds.iter().map(|k| (*k, self.status(*k))).collect()
    }

    /// Start the redirect-based login for the SSO portal.
    pub fn begin_sso(&self) -> Result<SsoChallenge, SessionError> {
        let mut redirect = self
            .sso_login_url
            .clone()
            .ok_or(SessionError::SsoNotConfigured)?;
        let state = Uuid::new_v4().to_string();
        redirect.query_pairs_mut().append_pair("state", &state);
        let expires_at = Utc::now() + Duration::seconds(SSO_STATE_TTL_SECS);

        *lock(&self.pending_sso) = Some(PendingSso {
            state: state.clone(),
            expires_at,
        });

        Ok(SsoChallenge {
            state,
            redirect_url: redirect.to_string(),
            expires_at,
        })
    }

    /// Finish the SSO login. The state token is single-use.
    pub fn complete_sso(
        &self,
        state: &str,
        credential: Credential,
    ) -> Result<CredentialSession, SessionError> {
        let pending = {
            let mut guard = lock(&self.pending_sso);
            match guard.as_ref() {
                Some(p) if p.state == state => guard.take(),
                _ => None,
            }
        };
        match pending {
            Some(p) if Utc::now() <= p.expires_at => self.login(SourceKind::SsoPortal, credential),
            _ => Err(SessionError::InvalidSsoState),
        }
    }
}
