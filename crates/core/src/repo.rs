//! Persistence port and in-memory implementation.
//!
//! The relational store lives outside this repository; the gateway consumes
//! it through [`Repository`]. [`MemoryRepository`] backs tests and the
//! standalone binary with the same contract, including the bulk-upsert
//! semantics `refresh_tools` relies on and the per-namespace override-name
//! uniqueness invariant.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::model::{
    AgentDocument, McpServer, MembershipStatus, Namespace, NamespaceAgent,
    NamespaceServerMembership, NamespaceToolMembership, PackageInstallRecord, ToolOverrides,
    ToolRecord,
};

/// Payload for a tool bulk upsert, as reported by an upstream listing.
#[derive(Debug, Clone)]
pub struct ToolUpsert {
    pub name: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub input_schema: serde_json::Value,
}

/// CRUD port over the entities the gateway reads and the tool rows it syncs.
///
/// Bulk upserts are transactional in effect: either every row lands or the
/// call errors without partial writes.
#[async_trait]
pub trait Repository: Send + Sync {
    // Namespaces
    async fn list_namespaces(&self) -> Result<Vec<Namespace>>;
    async fn get_namespace(&self, namespace_uuid: Uuid) -> Result<Namespace>;
    async fn upsert_namespace(&self, namespace: Namespace) -> Result<()>;
    async fn delete_namespace(&self, namespace_uuid: Uuid) -> Result<()>;

    // Servers and server memberships
    async fn get_server(&self, server_uuid: Uuid) -> Result<McpServer>;
    async fn upsert_server(&self, server: McpServer) -> Result<()>;
    async fn delete_server(&self, server_uuid: Uuid) -> Result<()>;
    /// Servers belonging to a namespace, with their membership status.
    async fn list_namespace_servers(
        &self,
        namespace_uuid: Uuid,
    ) -> Result<Vec<(McpServer, MembershipStatus)>>;
    /// Adds a server to a namespace. Public namespaces accept only public
    /// servers.
    async fn add_server_to_namespace(
        &self,
        namespace_uuid: Uuid,
        server_uuid: Uuid,
        status: MembershipStatus,
    ) -> Result<()>;
    async fn set_server_status(
        &self,
        namespace_uuid: Uuid,
        server_uuid: Uuid,
        status: MembershipStatus,
    ) -> Result<()>;

    // Tools
    /// Upserts tool rows keyed by `(server_uuid, name)`. Returns the stored
    /// rows (in input order) and how many were newly created.
    async fn bulk_upsert_tools(
        &self,
        server_uuid: Uuid,
        tools: Vec<ToolUpsert>,
    ) -> Result<(Vec<ToolRecord>, usize)>;
    async fn list_server_tools(&self, server_uuid: Uuid) -> Result<Vec<ToolRecord>>;

    // Tool memberships
    /// Upserts ACTIVE memberships keyed by `(namespace, tool)`. Returns how
    /// many were newly created. Existing rows keep their status and
    /// overrides.
    async fn bulk_upsert_tool_memberships(
        &self,
        namespace_uuid: Uuid,
        entries: Vec<(Uuid, Uuid)>,
    ) -> Result<usize>;
    async fn list_tool_memberships(
        &self,
        namespace_uuid: Uuid,
    ) -> Result<Vec<NamespaceToolMembership>>;
    async fn set_tool_status(
        &self,
        namespace_uuid: Uuid,
        tool_uuid: Uuid,
        status: MembershipStatus,
    ) -> Result<()>;
    /// Replaces a membership's overrides. Fails with a validation error when
    /// the override name collides with another membership in the namespace.
    async fn update_tool_overrides(
        &self,
        namespace_uuid: Uuid,
        tool_uuid: Uuid,
        overrides: ToolOverrides,
    ) -> Result<()>;

    // Agents and documents
    async fn get_agent(&self, agent_uuid: Uuid) -> Result<NamespaceAgent>;
    async fn list_agents(&self, namespace_uuid: Uuid) -> Result<Vec<NamespaceAgent>>;
    async fn upsert_agent(&self, agent: NamespaceAgent) -> Result<()>;
    async fn delete_agent(&self, agent_uuid: Uuid) -> Result<()>;
    async fn set_active_ask_agent(
        &self,
        namespace_uuid: Uuid,
        agent_uuid: Option<Uuid>,
    ) -> Result<()>;
    async fn list_agent_documents(&self, agent_uuid: Uuid) -> Result<Vec<AgentDocument>>;
    async fn insert_agent_document(&self, document: AgentDocument) -> Result<()>;
    async fn delete_agent_document(&self, document_uuid: Uuid) -> Result<()>;

    // Audit
    async fn append_install_record(&self, record: PackageInstallRecord) -> Result<()>;
}

#[derive(Default)]
struct Tables {
    namespaces: HashMap<Uuid, Namespace>,
    servers: HashMap<Uuid, McpServer>,
    server_memberships: Vec<NamespaceServerMembership>,
    tools: HashMap<Uuid, ToolRecord>,
    tool_memberships: Vec<NamespaceToolMembership>,
    agents: HashMap<Uuid, NamespaceAgent>,
    documents: HashMap<Uuid, AgentDocument>,
    install_history: Vec<PackageInstallRecord>,
}

/// In-memory [`Repository`] used by tests and the standalone binary.
#[derive(Default)]
pub struct MemoryRepository {
    tables: RwLock<Tables>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn list_namespaces(&self) -> Result<Vec<Namespace>> {
        let mut namespaces: Vec<_> = self.tables.read().namespaces.values().cloned().collect();
        namespaces.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(namespaces)
    }

    async fn get_namespace(&self, namespace_uuid: Uuid) -> Result<Namespace> {
        self.tables
            .read()
            .namespaces
            .get(&namespace_uuid)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("namespace {namespace_uuid}")))
    }

    async fn upsert_namespace(&self, namespace: Namespace) -> Result<()> {
        self.tables
            .write()
            .namespaces
            .insert(namespace.uuid, namespace);
        Ok(())
    }

    async fn delete_namespace(&self, namespace_uuid: Uuid) -> Result<()> {
        let mut tables = self.tables.write();
        tables.namespaces.remove(&namespace_uuid);
        tables
            .server_memberships
            .retain(|m| m.namespace_uuid != namespace_uuid);
        tables
            .tool_memberships
            .retain(|m| m.namespace_uuid != namespace_uuid);
        Ok(())
    }

    async fn get_server(&self, server_uuid: Uuid) -> Result<McpServer> {
        self.tables
            .read()
            .servers
            .get(&server_uuid)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("server {server_uuid}")))
    }

    async fn upsert_server(&self, server: McpServer) -> Result<()> {
        let mut tables = self.tables.write();
        let clash = tables.servers.values().any(|existing| {
            existing.uuid != server.uuid
                && existing.user_id == server.user_id
                && existing.name == server.name
        });
        if clash {
            return Err(GatewayError::Validation(format!(
                "server name '{}' already taken for this owner",
                server.name
            )));
        }
        tables.servers.insert(server.uuid, server);
        Ok(())
    }

    async fn delete_server(&self, server_uuid: Uuid) -> Result<()> {
        let mut tables = self.tables.write();
        tables.servers.remove(&server_uuid);
        tables
            .server_memberships
            .retain(|m| m.server_uuid != server_uuid);
        tables
            .tool_memberships
            .retain(|m| m.server_uuid != server_uuid);
        tables.tools.retain(|_, t| t.server_uuid != server_uuid);
        Ok(())
    }

    async fn list_namespace_servers(
        &self,
        namespace_uuid: Uuid,
    ) -> Result<Vec<(McpServer, MembershipStatus)>> {
        let tables = self.tables.read();
        let mut out = Vec::new();
        for membership in &tables.server_memberships {
            if membership.namespace_uuid != namespace_uuid {
                continue;
            }
            let server = tables.servers.get(&membership.server_uuid).ok_or_else(|| {
                GatewayError::NotFound(format!("server {}", membership.server_uuid))
            })?;
            out.push((server.clone(), membership.status));
        }
        out.sort_by(|a, b| a.0.name.cmp(&b.0.name));
        Ok(out)
    }

    async fn add_server_to_namespace(
        &self,
        namespace_uuid: Uuid,
        server_uuid: Uuid,
        status: MembershipStatus,
    ) -> Result<()> {
        let mut tables = self.tables.write();
        let namespace = tables
            .namespaces
            .get(&namespace_uuid)
            .ok_or_else(|| GatewayError::NotFound(format!("namespace {namespace_uuid}")))?;
        let server = tables
            .servers
            .get(&server_uuid)
            .ok_or_else(|| GatewayError::NotFound(format!("server {server_uuid}")))?;
        if namespace.user_id.is_none() && !server.is_public() {
            return Err(GatewayError::Validation(format!(
                "public namespace '{}' cannot contain private server '{}'",
                namespace.name, server.name
            )));
        }
        if let Some(existing) = tables
            .server_memberships
            .iter_mut()
            .find(|m| m.namespace_uuid == namespace_uuid && m.server_uuid == server_uuid)
        {
            existing.status = status;
        } else {
            tables.server_memberships.push(NamespaceServerMembership {
                namespace_uuid,
                server_uuid,
                status,
            });
        }
        Ok(())
    }

    async fn set_server_status(
        &self,
        namespace_uuid: Uuid,
        server_uuid: Uuid,
        status: MembershipStatus,
    ) -> Result<()> {
        let mut tables = self.tables.write();
        let membership = tables
            .server_memberships
            .iter_mut()
            .find(|m| m.namespace_uuid == namespace_uuid && m.server_uuid == server_uuid)
            .ok_or_else(|| {
                GatewayError::NotFound(format!(
                    "server {server_uuid} is not a member of namespace {namespace_uuid}"
                ))
            })?;
        membership.status = status;
        Ok(())
    }

    async fn bulk_upsert_tools(
        &self,
        server_uuid: Uuid,
        tools: Vec<ToolUpsert>,
    ) -> Result<(Vec<ToolRecord>, usize)> {
        let mut tables = self.tables.write();
        if !tables.servers.contains_key(&server_uuid) {
            return Err(GatewayError::NotFound(format!("server {server_uuid}")));
        }
        let mut stored = Vec::with_capacity(tools.len());
        let mut created = 0;
        for upsert in tools {
            let existing_uuid = tables
                .tools
                .values()
                .find(|t| t.server_uuid == server_uuid && t.name == upsert.name)
                .map(|t| t.uuid);
            let uuid = match existing_uuid {
                Some(uuid) => uuid,
                None => {
                    created += 1;
                    Uuid::new_v4()
                }
            };
            let record = ToolRecord {
                uuid,
                server_uuid,
                name: upsert.name,
                title: upsert.title,
                description: upsert.description,
                input_schema: upsert.input_schema,
            };
            tables.tools.insert(uuid, record.clone());
            stored.push(record);
        }
        Ok((stored, created))
    }

    async fn list_server_tools(&self, server_uuid: Uuid) -> Result<Vec<ToolRecord>> {
        let mut tools: Vec<_> = self
            .tables
            .read()
            .tools
            .values()
            .filter(|t| t.server_uuid == server_uuid)
            .cloned()
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tools)
    }

    async fn bulk_upsert_tool_memberships(
        &self,
        namespace_uuid: Uuid,
        entries: Vec<(Uuid, Uuid)>,
    ) -> Result<usize> {
        let mut tables = self.tables.write();
        let mut created = 0;
        for (tool_uuid, server_uuid) in entries {
            let exists = tables
                .tool_memberships
                .iter()
                .any(|m| m.namespace_uuid == namespace_uuid && m.tool_uuid == tool_uuid);
            if !exists {
                tables.tool_memberships.push(NamespaceToolMembership {
                    namespace_uuid,
                    tool_uuid,
                    server_uuid,
                    status: MembershipStatus::Active,
                    overrides: ToolOverrides::default(),
                });
                created += 1;
            }
        }
        Ok(created)
    }

    async fn list_tool_memberships(
        &self,
        namespace_uuid: Uuid,
    ) -> Result<Vec<NamespaceToolMembership>> {
        Ok(self
            .tables
            .read()
            .tool_memberships
            .iter()
            .filter(|m| m.namespace_uuid == namespace_uuid)
            .cloned()
            .collect())
    }

    async fn set_tool_status(
        &self,
        namespace_uuid: Uuid,
        tool_uuid: Uuid,
        status: MembershipStatus,
    ) -> Result<()> {
        let mut tables = self.tables.write();
        let membership = tables
            .tool_memberships
            .iter_mut()
            .find(|m| m.namespace_uuid == namespace_uuid && m.tool_uuid == tool_uuid)
            .ok_or_else(|| {
                GatewayError::NotFound(format!(
                    "tool {tool_uuid} is not a member of namespace {namespace_uuid}"
                ))
            })?;
        membership.status = status;
        Ok(())
    }

    async fn update_tool_overrides(
        &self,
        namespace_uuid: Uuid,
        tool_uuid: Uuid,
        overrides: ToolOverrides,
    ) -> Result<()> {
        let mut tables = self.tables.write();
        if let Some(name) = overrides.name.as_deref() {
            let clash = tables.tool_memberships.iter().any(|m| {
                m.namespace_uuid == namespace_uuid
                    && m.tool_uuid != tool_uuid
                    && m.overrides.name.as_deref() == Some(name)
            });
            if clash {
                return Err(GatewayError::Validation(format!(
                    "override name '{name}' already used in this namespace"
                )));
            }
        }
        let membership = tables
            .tool_memberships
            .iter_mut()
            .find(|m| m.namespace_uuid == namespace_uuid && m.tool_uuid == tool_uuid)
            .ok_or_else(|| {
                GatewayError::NotFound(format!(
                    "tool {tool_uuid} is not a member of namespace {namespace_uuid}"
                ))
            })?;
        membership.overrides = overrides;
        Ok(())
    }

    async fn get_agent(&self, agent_uuid: Uuid) -> Result<NamespaceAgent> {
        self.tables
            .read()
            .agents
            .get(&agent_uuid)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("agent {agent_uuid}")))
    }

    async fn list_agents(&self, namespace_uuid: Uuid) -> Result<Vec<NamespaceAgent>> {
        let mut agents: Vec<_> = self
            .tables
            .read()
            .agents
            .values()
            .filter(|a| a.namespace_uuid == namespace_uuid)
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(agents)
    }

    async fn upsert_agent(&self, agent: NamespaceAgent) -> Result<()> {
        self.tables.write().agents.insert(agent.uuid, agent);
        Ok(())
    }

    async fn delete_agent(&self, agent_uuid: Uuid) -> Result<()> {
        let mut tables = self.tables.write();
        tables.agents.remove(&agent_uuid);
        tables.documents.retain(|_, d| d.agent_uuid != agent_uuid);
        for namespace in tables.namespaces.values_mut() {
            if namespace.ask_agent_uuid == Some(agent_uuid) {
                namespace.ask_agent_uuid = None;
            }
        }
        Ok(())
    }

    async fn set_active_ask_agent(
        &self,
        namespace_uuid: Uuid,
        agent_uuid: Option<Uuid>,
    ) -> Result<()> {
        let mut tables = self.tables.write();
        if let Some(agent_uuid) = agent_uuid {
            let belongs = tables
                .agents
                .get(&agent_uuid)
                .is_some_and(|a| a.namespace_uuid == namespace_uuid);
            if !belongs {
                return Err(GatewayError::Validation(format!(
                    "agent {agent_uuid} does not belong to namespace {namespace_uuid}"
                )));
            }
        }
        let namespace = tables
            .namespaces
            .get_mut(&namespace_uuid)
            .ok_or_else(|| GatewayError::NotFound(format!("namespace {namespace_uuid}")))?;
        namespace.ask_agent_uuid = agent_uuid;
        Ok(())
    }

    async fn list_agent_documents(&self, agent_uuid: Uuid) -> Result<Vec<AgentDocument>> {
        let mut documents: Vec<_> = self
            .tables
            .read()
            .documents
            .values()
            .filter(|d| d.agent_uuid == agent_uuid)
            .cloned()
            .collect();
        documents.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(documents)
    }

    async fn insert_agent_document(&self, document: AgentDocument) -> Result<()> {
        let mut tables = self.tables.write();
        if !tables.agents.contains_key(&document.agent_uuid) {
            return Err(GatewayError::NotFound(format!(
                "agent {}",
                document.agent_uuid
            )));
        }
        tables.documents.insert(document.uuid, document);
        Ok(())
    }

    async fn delete_agent_document(&self, document_uuid: Uuid) -> Result<()> {
        self.tables.write().documents.remove(&document_uuid);
        Ok(())
    }

    async fn append_install_record(&self, record: PackageInstallRecord) -> Result<()> {
        self.tables.write().install_history.push(record);
        Ok(())
    }
}
