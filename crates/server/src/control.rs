//! Control-plane entry points.
//!
//! The authenticated RPC layer that edits namespaces lives outside this
//! repository; these are the operations it calls into the core. Every
//! mutation is followed by the cache and pool invalidations the change
//! requires, so the next attach or listing observes fresh config while
//! in-flight calls finish against their old snapshot.

use std::sync::Arc;

use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use metamcp_core::{
    AgentDocument, GatewayError, McpServer, MembershipStatus, Namespace, NamespaceAgent, Result,
    ToolOverrides, AGENT_TOKEN_BUDGET,
};

use crate::aggregator::{self, RefreshSummary, RefreshToolEntry};
use crate::context::GatewayContext;

/// Facade over the mutations the control plane performs.
pub struct ControlPlane {
    ctx: Arc<GatewayContext>,
}

impl ControlPlane {
    pub fn new(ctx: Arc<GatewayContext>) -> Self {
        Self { ctx }
    }

    async fn invalidate_namespace(&self, namespace_uuid: Uuid) {
        self.ctx.namespace_pool.invalidate_idle(namespace_uuid).await;
        self.ctx.invalidate_open_sessions(&[namespace_uuid]);
    }

    async fn namespaces_containing_server(&self, server_uuid: Uuid) -> Result<Vec<Uuid>> {
        let mut affected = Vec::new();
        for namespace in self.ctx.repo.list_namespaces().await? {
            let members = self.ctx.repo.list_namespace_servers(namespace.uuid).await?;
            if members.iter().any(|(server, _)| server.uuid == server_uuid) {
                affected.push(namespace.uuid);
            }
        }
        Ok(affected)
    }

    // Namespaces

    pub async fn list_namespaces(&self) -> Result<Vec<Namespace>> {
        self.ctx.repo.list_namespaces().await
    }

    pub async fn get_namespace(&self, namespace_uuid: Uuid) -> Result<Namespace> {
        self.ctx.repo.get_namespace(namespace_uuid).await
    }

    /// Create a namespace and warm its idle slot in the background.
    pub async fn create_namespace(&self, namespace: Namespace) -> Result<()> {
        let namespace_uuid = namespace.uuid;
        self.ctx.repo.upsert_namespace(namespace).await?;
        self.ctx.namespace_pool.ensure_idle_background(namespace_uuid);
        Ok(())
    }

    pub async fn update_namespace(&self, namespace: Namespace) -> Result<()> {
        let namespace_uuid = namespace.uuid;
        self.ctx.repo.upsert_namespace(namespace).await?;
        self.invalidate_namespace(namespace_uuid).await;
        Ok(())
    }

    pub async fn delete_namespace(&self, namespace_uuid: Uuid) -> Result<()> {
        self.ctx.repo.delete_namespace(namespace_uuid).await?;
        self.ctx.namespace_pool.cleanup_namespace(namespace_uuid).await;
        self.ctx.index.clear_namespace(namespace_uuid);
        self.ctx.invalidate_open_sessions(&[namespace_uuid]);
        info!(
            target: "metamcp::control",
            namespace = %namespace_uuid,
            "namespace deleted"
        );
        Ok(())
    }

    // Servers and memberships

    pub async fn upsert_server(&self, server: McpServer) -> Result<()> {
        let affected = self.namespaces_containing_server(server.uuid).await?;
        self.ctx.repo.upsert_server(server).await?;
        for namespace_uuid in affected {
            self.invalidate_namespace(namespace_uuid).await;
        }
        Ok(())
    }

    pub async fn delete_server(&self, server_uuid: Uuid) -> Result<()> {
        let affected = self.namespaces_containing_server(server_uuid).await?;
        self.ctx.repo.delete_server(server_uuid).await?;
        for namespace_uuid in affected {
            self.invalidate_namespace(namespace_uuid).await;
        }
        Ok(())
    }

    pub async fn add_server_to_namespace(
        &self,
        namespace_uuid: Uuid,
        server_uuid: Uuid,
        status: MembershipStatus,
    ) -> Result<()> {
        self.ctx
            .repo
            .add_server_to_namespace(namespace_uuid, server_uuid, status)
            .await?;
        self.invalidate_namespace(namespace_uuid).await;
        Ok(())
    }

    pub async fn set_server_status(
        &self,
        namespace_uuid: Uuid,
        server_uuid: Uuid,
        status: MembershipStatus,
    ) -> Result<()> {
        self.ctx
            .repo
            .set_server_status(namespace_uuid, server_uuid, status)
            .await?;
        self.invalidate_namespace(namespace_uuid).await;
        Ok(())
    }

    // Tools

    pub async fn set_tool_status(
        &self,
        namespace_uuid: Uuid,
        tool_uuid: Uuid,
        status: MembershipStatus,
    ) -> Result<()> {
        self.ctx
            .repo
            .set_tool_status(namespace_uuid, tool_uuid, status)
            .await?;
        self.invalidate_namespace(namespace_uuid).await;
        Ok(())
    }

    pub async fn update_tool_overrides(
        &self,
        namespace_uuid: Uuid,
        tool_uuid: Uuid,
        overrides: ToolOverrides,
    ) -> Result<()> {
        self.ctx
            .repo
            .update_tool_overrides(namespace_uuid, tool_uuid, overrides)
            .await?;
        self.invalidate_namespace(namespace_uuid).await;
        Ok(())
    }

    /// Persist the tools a downstream listing reported, then invalidate the
    /// namespace's idle session, derived sessions, and override cache.
    pub async fn refresh_tools(
        &self,
        namespace_uuid: Uuid,
        entries: Vec<RefreshToolEntry>,
    ) -> Result<RefreshSummary> {
        let overrides = self.ctx.overrides.get(namespace_uuid).await?;
        let summary = aggregator::refresh_tools(
            &self.ctx.repo,
            overrides.reverse_map(),
            namespace_uuid,
            entries,
        )
        .await?;
        self.invalidate_namespace(namespace_uuid).await;
        Ok(summary)
    }

    // Agents

    pub async fn list_agents(&self, namespace_uuid: Uuid) -> Result<Vec<NamespaceAgent>> {
        self.ctx.repo.list_agents(namespace_uuid).await
    }

    pub async fn upsert_agent(&self, agent: NamespaceAgent) -> Result<()> {
        self.ctx.repo.upsert_agent(agent).await
    }

    pub async fn delete_agent(&self, agent_uuid: Uuid) -> Result<()> {
        self.ctx.repo.delete_agent(agent_uuid).await
    }

    pub async fn set_active_ask_agent(
        &self,
        namespace_uuid: Uuid,
        agent_uuid: Option<Uuid>,
    ) -> Result<()> {
        self.ctx
            .repo
            .set_active_ask_agent(namespace_uuid, agent_uuid)
            .await?;
        self.ctx.invalidate_open_sessions(&[namespace_uuid]);
        Ok(())
    }

    // Agent documents

    pub async fn list_documents(&self, agent_uuid: Uuid) -> Result<Vec<AgentDocument>> {
        self.ctx.repo.list_agent_documents(agent_uuid).await
    }

    /// Upload a reference document, enforcing the per-agent token budget.
    /// On overflow nothing is written and the document set is unchanged.
    pub async fn upload_document(
        &self,
        agent_uuid: Uuid,
        filename: String,
        mime: String,
        content: String,
    ) -> Result<AgentDocument> {
        let agent = self.ctx.repo.get_agent(agent_uuid).await?;
        let token_count = self.ctx.tokens.count(&agent.model, &content)?;
        let existing: usize = self
            .ctx
            .repo
            .list_agent_documents(agent_uuid)
            .await?
            .iter()
            .map(|d| d.token_count)
            .sum();
        if existing + token_count > AGENT_TOKEN_BUDGET {
            return Err(GatewayError::BudgetExceeded(format!(
                "document '{filename}' ({token_count} tokens) would push agent '{}' past \
                 the {AGENT_TOKEN_BUDGET}-token document budget ({existing} already used)",
                agent.name
            )));
        }

        let document = AgentDocument {
            uuid: Uuid::new_v4(),
            agent_uuid,
            filename,
            mime,
            content,
            token_count,
            created_at: OffsetDateTime::now_utc(),
        };
        self.ctx.repo.insert_agent_document(document.clone()).await?;
        Ok(document)
    }

    pub async fn delete_document(&self, document_uuid: Uuid) -> Result<()> {
        self.ctx.repo.delete_agent_document(document_uuid).await
    }
}
