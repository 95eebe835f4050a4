//! Public web portal. No session, same politeness rules as the others.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Connector, ConnectorHealth, PortalClient};
use crate::config::{PortalConnectorConfig, SyncConfig};
use crate::error::FetchError;
use crate::models::{Listing, RawContent, SourceKind};

pub struct PublicPortalConnector {
    client: PortalClient,
}

impl PublicPortalConnector {
    pub fn new(config: &PortalConnectorConfig, sync: &SyncConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: PortalClient::new(SourceKind::PublicPortal, config, sync, None)?,
        })
    }
}

#[async_trait]
impl Connector for PublicPortalConnector {
    fn kind(&self) -> SourceKind {
        SourceKind::PublicPortal
    }

    fn description(&self) -> String {
        format!("public portal at {}", self.client.base_url())
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
