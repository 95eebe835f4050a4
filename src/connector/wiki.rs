//! Credential-protected wiki.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::{Connector, ConnectorHealth, PortalClient};
use crate::config::{PortalConnectorConfig, SyncConfig};
use crate::error::FetchError;
use crate::models::{Listing, RawContent, SourceKind};
use crate::session::SessionStore;

/// Every request carries the wiki session's credential. A rejected
/// credential, whether a 401/403 or a redirect to the login page, expires
/// the session and surfaces as [`FetchError::AuthenticationRequired`].
pub struct WikiConnector {
    client: PortalClient,
}

impl WikiConnector {
    pub fn new(
        config: &PortalConnectorConfig,
        sync: &SyncConfig,
        sessions: Arc<SessionStore>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            client: PortalClient::new(SourceKind::Wiki, config, sync, Some(sessions))?,
        })
    }
}

#[async_trait]
impl Connector for WikiConnector {
    fn kind(&self) -> SourceKind {
        SourceKind::Wiki
    }

    fn description(&self) -> String {
        format!("wiki at {}", self.client.base_url())
    }

    async fn list_changed_since(
        &self,
        cursor: Option<DateTime<Utc>>,
    ) -> Result<Listing, FetchError> {
        self.client.list(cursor).await
    }

    async fn fetch(&self, source_path: &str) -> Result<RawContent, FetchError> {
        self.client.fetch(source_path).await
    }

    async fn health(&self) -> ConnectorHealth {
        self.client.health().await
    }
}
