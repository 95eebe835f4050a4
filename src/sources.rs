//! Source overview for `fedr sources` and `GET /sources`.

use futures::future::join_all;
use serde::Serialize;

use crate::engine::Engine;
use crate::models::SourceKind;
use crate::session::SessionStatus;

#[derive(Debug, Clone, Serialize)]
pub struct SourceInfo {
    pub source_kind: SourceKind,
    pub configured: bool,
    pub description: Option<String>,
    pub healthy: bool,
    pub health: String,
    pub session: Option<SessionStatus>,
}

/// One row per source kind, configured or not. Health checks run
/// concurrently.
pub async fn list_sources(engine: &Engine) -> Vec<SourceInfo> {
    let rows = SourceKind::ALL.iter().map(|&kind| async move {
        match engine.connectors().get(kind) {
            Some(connector) => {
                let health = connector.health().await;
                SourceInfo {
                    source_kind: kind,
                    configured: true,
                    description: Some(connector.description()),
                    healthy: health.ok,
                    health: health.message,
                    session: Some(engine.sessions().status(kind)),
                }
            }
            None => SourceInfo {
                source_kind: kind,
                configured: false,
                description: None,
                healthy: false,
                health: "not configured".to_string(),
                session: None,
            },
        }
    });
    join_all(rows).await
}

pub fn print_sources(sources: &[SourceInfo]) {
    println!(
        "{:<15} {:<16} {:<8} {:<16} DETAIL",
        "SOURCE", "STATUS", "HEALTHY", "SESSION"
    );
    for s in sources {
        let status = if s.configured { "OK" } else { "NOT CONFIGURED" };
        let session = s.session.map(|st| st.as_str()).unwrap_or("-");
        let detail = match &s.description {
            Some(d) => format!("{} ({})", d, s.health),
            None => s.health.clone(),
        };
        println!(
            "{:<15} {:<16} {:<8} {:<16} {}",
            s.source_kind.as_str(),
            status,
            s.healthy,
            session,
            detail
        );
    }
}
