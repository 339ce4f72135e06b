//! Per-namespace tool-name overrides.
//!
//! A namespace may rename the tools it exposes. On `tools/list` the override
//! replaces the display name, title, description, and annotations; on
//! `tools/call` an incoming override name maps back to the canonical full
//! name before dispatch. The cache is rebuilt lazily from membership rows and
//! invalidated by namespace on any override, membership, or namespace change.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use rmcp::model::{CallToolResult, ToolAnnotations};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use metamcp_core::{full_tool_name, Repository, Result};

use crate::aggregator::AggregatedTool;
use crate::middleware::{
    CallNext, CallRequest, CallToolLayer, ListNext, ListToolsLayer, RequestContext,
};

/// Overrides for one tool, keyed off its canonical full name.
#[derive(Debug, Clone, Default)]
pub struct OverrideEntry {
    pub name: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub annotations: Option<Value>,
}

/// All overrides of one namespace.
#[derive(Debug, Default)]
pub struct NamespaceOverrides {
    by_full_name: HashMap<String, OverrideEntry>,
    reverse: HashMap<String, String>,
}

impl NamespaceOverrides {
    pub fn lookup(&self, full_name: &str) -> Option<&OverrideEntry> {
        self.by_full_name.get(full_name)
    }

    /// Canonical full name for an incoming override name, if any.
    pub fn resolve(&self, incoming: &str) -> Option<&String> {
        self.reverse.get(incoming)
    }

    /// `override_name -> canonical full name`, used by `refresh_tools` to
    /// skip override names in downstream listings.
    pub fn reverse_map(&self) -> &HashMap<String, String> {
        &self.reverse
    }

    pub fn is_empty(&self) -> bool {
        self.by_full_name.is_empty()
    }
}

/// Lazy per-namespace override cache.
pub struct OverrideCache {
    repo: Arc<dyn Repository>,
    entries: RwLock<HashMap<Uuid, Arc<NamespaceOverrides>>>,
}

impl OverrideCache {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self {
            repo,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, namespace_uuid: Uuid) -> Result<Arc<NamespaceOverrides>> {
        if let Some(cached) = self.entries.read().get(&namespace_uuid) {
            return Ok(cached.clone());
        }
        let built = Arc::new(self.build(namespace_uuid).await?);
        self.entries.write().insert(namespace_uuid, built.clone());
        Ok(built)
    }

    async fn build(&self, namespace_uuid: Uuid) -> Result<NamespaceOverrides> {
        let memberships = self.repo.list_tool_memberships(namespace_uuid).await?;
        if memberships.iter().all(|m| m.overrides.is_empty()) {
            return Ok(NamespaceOverrides::default());
        }

        // Join memberships to tool and server names to form full names.
        let servers = self.repo.list_namespace_servers(namespace_uuid).await?;
        let mut tool_names: HashMap<Uuid, String> = HashMap::new();
        for (server, _) in &servers {
            for tool in self.repo.list_server_tools(server.uuid).await? {
                tool_names.insert(tool.uuid, full_tool_name(&server.name, &tool.name));
            }
        }

        let mut overrides = NamespaceOverrides::default();
        for membership in memberships {
            if membership.overrides.is_empty() {
                continue;
            }
            let Some(full_name) = tool_names.get(&membership.tool_uuid) else {
                warn!(
                    target: "metamcp::overrides",
                    tool = %membership.tool_uuid,
                    "override row references an unknown tool, skipping"
                );
                continue;
            };
            if let Some(name) = &membership.overrides.name {
                overrides.reverse.insert(name.clone(), full_name.clone());
            }
            overrides.by_full_name.insert(
                full_name.clone(),
                OverrideEntry {
                    name: membership.overrides.name,
                    title: membership.overrides.title,
                    description: membership.overrides.description,
                    annotations: membership.overrides.annotations,
                },
            );
        }
        debug!(
            target: "metamcp::overrides",
            namespace = %namespace_uuid,
            overridden = overrides.by_full_name.len(),
            "override cache built"
        );
        Ok(overrides)
    }

    pub fn invalidate(&self, namespace_uuid: Uuid) {
        self.entries.write().remove(&namespace_uuid);
    }

    pub fn invalidate_all(&self) {
        self.entries.write().clear();
    }
}

/// The override middleware, innermost in both chains.
pub struct ToolOverridesLayer {
    cache: Arc<OverrideCache>,
}

impl ToolOverridesLayer {
    pub fn new(cache: Arc<OverrideCache>) -> Self {
        Self { cache }
    }
}

fn apply_override(tool: &mut AggregatedTool, entry: &OverrideEntry) {
    if let Some(name) = &entry.name {
        tool.display.name = name.clone().into();
    }
    if let Some(title) = &entry.title {
        tool.display.title = Some(title.clone());
    }
    if let Some(description) = &entry.description {
        tool.display.description = Some(description.clone().into());
    }
    if let Some(annotations) = &entry.annotations {
        match serde_json::from_value::<ToolAnnotations>(annotations.clone()) {
            Ok(parsed) => tool.display.annotations = Some(parsed),
            Err(err) => warn!(
                target: "metamcp::overrides",
                tool = %tool.full_name,
                error = %err,
                "override annotations are not valid tool annotations, ignoring"
            ),
        }
    }
}

#[async_trait]
impl ListToolsLayer for ToolOverridesLayer {
    async fn handle(
        &self,
        ctx: &RequestContext,
        next: ListNext<'_>,
    ) -> Result<Vec<AggregatedTool>> {
        let mut tools = next.run(ctx).await?;
        let overrides = self.cache.get(ctx.namespace_uuid).await?;
        if overrides.is_empty() {
            return Ok(tools);
        }
        for tool in &mut tools {
            if let Some(entry) = overrides.lookup(&tool.full_name) {
                apply_override(tool, entry);
            }
        }
        Ok(tools)
    }
}

#[async_trait]
impl CallToolLayer for ToolOverridesLayer {
    async fn handle(
        &self,
        ctx: &RequestContext,
        mut request: CallRequest,
        next: CallNext<'_>,
    ) -> Result<CallToolResult> {
        let overrides = self.cache.get(ctx.namespace_uuid).await?;
        if let Some(canonical) = overrides.resolve(&request.name) {
            debug!(
                target: "metamcp::overrides",
                incoming = %request.name,
                canonical = %canonical,
                "mapping override name back to canonical"
            );
            request.name = canonical.clone();
        }
        next.run(ctx, request).await
    }
}
