//! SSO-protected identity-management portal.
//!
//! Behaves like the wiki. An expired SSO session usually shows up as a
//! redirect to the identity provider rather than a 401; like every redirect
//! out of a credentialed portal's base URL it is not followed and counts as
//! an authentication failure.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::{Connector, ConnectorHealth, PortalClient};
use crate::config::{PortalConnectorConfig, SyncConfig};
use crate::error::FetchError;
use crate::models::{Listing, RawContent, SourceKind};
use crate::session::SessionStore;

pub struct SsoPortalConnector {
    client: PortalClient,
}

impl SsoPortalConnector {
    pub fn new(
        config: &PortalConnectorConfig,
        sync: &SyncConfig,
        sessions: Arc<SessionStore>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            client: PortalClient::new(SourceKind::SsoPortal, config, sync, Some(sessions))?,
        })
    }
}

#[async_trait]
impl Connector for SsoPortalConnector {
    fn kind(&self) -> SourceKind {
        SourceKind::SsoPortal
    }

    fn description(&self) -> String {
        format!("sso portal at {}", self.client.base_url())
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
