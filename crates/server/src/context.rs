//! Process-wide gateway context.
//!
//! Everything the runtime shares lives here and is injected explicitly;
//! tests build a fresh context with fakes instead of touching globals.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use metamcp_agent::{ChatClient, OpenAiChatClient};
use metamcp_core::{Repository, TokenCounter};
use metamcp_discovery::{DiscoveryIndex, Embedder, HashEmbedder, IndexStats};

use crate::overrides::OverrideCache;
use crate::pool::{McpServerPool, NamespacePool, PoolStatus, RmcpConnector, UpstreamConnector};
use crate::sessions::{LiveSessionRegistry, SessionStats};
use crate::smart_discovery::SmartDiscoveryState;

/// Shared services for one gateway process.
pub struct GatewayContext {
    pub repo: Arc<dyn Repository>,
    pub tokens: Arc<TokenCounter>,
    pub index: Arc<DiscoveryIndex>,
    pub sessions: Arc<LiveSessionRegistry>,
    pub server_pool: Arc<McpServerPool>,
    pub namespace_pool: Arc<NamespacePool>,
    pub overrides: Arc<OverrideCache>,
    pub discovery_state: Arc<SmartDiscoveryState>,
    pub chat: Option<Arc<dyn ChatClient>>,
}

/// Combined status payload for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub pool: PoolStatus,
    pub sessions: SessionStats,
    pub index: IndexStats,
}

impl GatewayContext {
    /// Wire a context from explicit collaborators.
    pub fn new(
        repo: Arc<dyn Repository>,
        embedder: Arc<dyn Embedder>,
        connector: Arc<dyn UpstreamConnector>,
        chat: Option<Arc<dyn ChatClient>>,
        discovery_state: SmartDiscoveryState,
    ) -> Arc<Self> {
        let server_pool = Arc::new(McpServerPool::new(connector));
        let namespace_pool = Arc::new(NamespacePool::new(repo.clone(), server_pool.clone()));
        Arc::new(Self {
            overrides: Arc::new(OverrideCache::new(repo.clone())),
            repo,
            tokens: Arc::new(TokenCounter::new()),
            index: Arc::new(DiscoveryIndex::new(embedder)),
            sessions: Arc::new(LiveSessionRegistry::new()),
            server_pool,
            namespace_pool,
            discovery_state: Arc::new(discovery_state),
            chat,
        })
    }

    /// Production wiring: real upstream connector, hashing embedder, and an
    /// OpenAI-compatible chat client when an API key is configured.
    pub fn from_env(repo: Arc<dyn Repository>) -> Arc<Self> {
        let chat: Option<Arc<dyn ChatClient>> = metamcp_state::chat_api_key().map(|key| {
            Arc::new(OpenAiChatClient::new(key, metamcp_state::chat_base_url()))
                as Arc<dyn ChatClient>
        });
        Self::new(
            repo,
            Arc::new(HashEmbedder::new()),
            Arc::new(RmcpConnector),
            chat,
            SmartDiscoveryState::from_env(),
        )
    }

    /// Invalidate the per-namespace caches derived from config, so the next
    /// request observes fresh state. Active transport sessions keep their
    /// snapshot; only the caches go.
    pub fn invalidate_open_sessions(&self, namespaces: &[Uuid]) {
        for namespace_uuid in namespaces {
            self.overrides.invalidate(*namespace_uuid);
            self.discovery_state.invalidate_status(*namespace_uuid);
        }
        debug!(
            target: "metamcp::context",
            count = namespaces.len(),
            "derived session caches invalidated"
        );
    }

    pub fn status(&self) -> GatewayStatus {
        GatewayStatus {
            pool: self.namespace_pool.status(),
            sessions: self.sessions.stats(),
            index: self.index.stats(),
        }
    }
}
