//! Seed configuration for the standalone binary.
//!
//! A real deployment reads namespaces and servers from the control plane's
//! store. The standalone binary instead seeds its in-memory repository from a
//! JSON file:
//!
//! ```json
//! {
//!   "servers": [
//!     {
//!       "name": "files",
//!       "transport": {
//!         "type": "stdio",
//!         "command": "npx",
//!         "args": ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]
//!       }
//!     }
//!   ],
//!   "namespaces": [
//!     {
//!       "name": "dev",
//!       "smart_discovery_enabled": true,
//!       "servers": ["files"]
//!     }
//!   ]
//! }
//! ```

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use uuid::Uuid;

use metamcp_core::{
    McpServer, MembershipStatus, Namespace, Repository, TransportConfig,
};

#[derive(Debug, Deserialize)]
pub struct ServerSeed {
    pub name: String,
    pub transport: TransportConfig,
}

#[derive(Debug, Deserialize)]
pub struct NamespaceSeed {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub smart_discovery_enabled: bool,
    #[serde(default)]
    pub smart_discovery_description: Option<String>,
    #[serde(default)]
    pub pinned_tools: Vec<String>,
    /// Server names from the `servers` section.
    pub servers: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct SeedConfig {
    #[serde(default)]
    pub servers: Vec<ServerSeed>,
    #[serde(default)]
    pub namespaces: Vec<NamespaceSeed>,
}

impl SeedConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse config {}", path.display()))
    }

    /// Populate a repository from this seed.
    pub async fn apply(&self, repo: &Arc<dyn Repository>) -> Result<()> {
        let mut server_uuids = std::collections::HashMap::new();
        for seed in &self.servers {
            let server = McpServer {
                uuid: Uuid::new_v4(),
                name: seed.name.clone(),
                transport: seed.transport.clone(),
                user_id: None,
            };
            server_uuids.insert(seed.name.clone(), server.uuid);
            repo.upsert_server(server)
                .await
                .map_err(|e| anyhow!("seed server '{}': {e}", seed.name))?;
        }

        for seed in &self.namespaces {
            let namespace = Namespace {
                uuid: Uuid::new_v4(),
                name: seed.name.clone(),
                description: seed.description.clone(),
                user_id: None,
                smart_discovery_enabled: seed.smart_discovery_enabled,
                smart_discovery_description: seed.smart_discovery_description.clone(),
                pinned_tools: seed.pinned_tools.clone(),
                ask_agent_uuid: None,
            };
            let namespace_uuid = namespace.uuid;
            repo.upsert_namespace(namespace)
                .await
                .map_err(|e| anyhow!("seed namespace '{}': {e}", seed.name))?;

            for server_name in &seed.servers {
                let server_uuid = server_uuids.get(server_name).ok_or_else(|| {
                    anyhow!(
                        "namespace '{}' references unknown server '{}'",
                        seed.name,
                        server_name
                    )
                })?;
                repo.add_server_to_namespace(
                    namespace_uuid,
                    *server_uuid,
                    MembershipStatus::Active,
                )
                .await
                .map_err(|e| anyhow!("seed membership '{}': {e}", server_name))?;
            }
        }
        Ok(())
    }
}
