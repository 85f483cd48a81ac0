//! Server discovery and candidate ranking
//!
//! Sources yield candidate servers; ranking puts the most recently used
//! server first so reconnecting after a restart lands on the same mixer.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A mixer server that could be connected to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCandidate {
    /// Human-readable name shown when picking a server
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Server software version, when the source reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl ServerCandidate {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            version: None,
        }
    }

    /// WebSocket URL for this candidate
    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}/ws", self.host, self.port)
    }
}

/// A source of server candidates
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn discover(&self) -> Result<Vec<ServerCandidate>>;
}

/// Fixed candidate list from the config file
pub struct StaticDiscovery {
    candidates: Vec<ServerCandidate>,
}

impl StaticDiscovery {
    pub fn new(candidates: Vec<ServerCandidate>) -> Self {
        Self { candidates }
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn discover(&self) -> Result<Vec<ServerCandidate>> {
        debug!(count = self.candidates.len(), "Static candidates");
        Ok(self.candidates.clone())
    }
}

/// Order candidates for presentation: the last-used server first, the rest
/// sorted by name
pub fn rank_candidates(
    mut candidates: Vec<ServerCandidate>,
    last_used_url: Option<&str>,
) -> Vec<ServerCandidate> {
    candidates.sort_by(|a, b| a.name.cmp(&b.name));
    if let Some(url) = last_used_url {
        if let Some(pos) = candidates.iter().position(|c| c.ws_url() == url) {
            let preferred = candidates.remove(pos);
            candidates.insert(0, preferred);
        }
    }
    candidates
}
