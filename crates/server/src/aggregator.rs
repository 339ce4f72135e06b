//! Namespace aggregation: merged tool registry, dispatch, and tool refresh.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use rmcp::model::{CallToolResult, JsonObject, Tool};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use metamcp_agent::ToolExecutor;
use metamcp_core::{
    full_tool_name, is_synthetic_tool, split_tool_name, GatewayError, MembershipStatus,
    Repository, Result, ToolUpsert,
};

use crate::middleware::{CallRequest, CallToolHandler, ListToolsHandler, RequestContext};
use crate::pool::namespace_pool::NamespaceSession;

/// One tool in the merged registry.
///
/// `full_name` is canonical (`serverName__toolName`) and stays fixed through
/// the middleware chain; `display` is what the downstream ultimately sees and
/// is what override and discovery layers rewrite or filter.
#[derive(Clone)]
pub struct AggregatedTool {
    pub server_uuid: Uuid,
    pub server_name: String,
    pub original_name: String,
    /// Title as reported by the upstream, before any override.
    pub original_title: Option<String>,
    /// Description as reported by the upstream, before any override.
    pub original_description: Option<String>,
    pub full_name: String,
    pub display: Tool,
}

impl AggregatedTool {
    fn from_upstream(server_uuid: Uuid, server_name: &str, tool: Tool) -> Self {
        let original_name = tool.name.to_string();
        let original_title = tool.title.clone();
        let original_description = tool.description.as_ref().map(|d| d.to_string());
        let full_name = full_tool_name(server_name, &original_name);
        let mut display = tool;
        display.name = full_name.clone().into();
        Self {
            server_uuid,
            server_name: server_name.to_string(),
            original_name,
            original_title,
            original_description,
            full_name,
            display,
        }
    }
}

/// Merge the tool lists of every member, building full names.
///
/// The result is cached on the session; a session sees one stable registry
/// for its whole lifetime. A member whose listing fails is skipped with a
/// warning so one broken upstream does not blank the namespace.
pub async fn merged_registry(session: &NamespaceSession) -> Result<Arc<Vec<AggregatedTool>>> {
    if let Some(cached) = session.cached_registry().await {
        return Ok(cached);
    }

    let mut tools = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for member in session.members() {
        let listed = match member.client.list_tools().await {
            Ok(listed) => listed,
            Err(err) => {
                warn!(
                    target: "metamcp::aggregator",
                    server = %member.server.name,
                    error = %err,
                    "member listing failed, skipping"
                );
                continue;
            }
        };
        for tool in listed {
            let aggregated =
                AggregatedTool::from_upstream(member.server.uuid, &member.server.name, tool);
            if !seen.insert(aggregated.full_name.clone()) {
                warn!(
                    target: "metamcp::aggregator",
                    tool = %aggregated.full_name,
                    "duplicate full tool name, keeping the first"
                );
                continue;
            }
            tools.push(aggregated);
        }
    }

    let registry = Arc::new(tools);
    session.store_registry(registry.clone()).await;
    Ok(registry)
}

/// Route a call to the member server encoded in the full name.
///
/// Splits on the first `__`. When the first segment matches no member but a
/// prefix including one more `__` does (the member is itself a gateway), the
/// call routes there with the rest of the name forwarded verbatim. Exactly
/// one extra level is collapsed; anything deeper is NotFound.
pub async fn dispatch(
    session: &NamespaceSession,
    full_name: &str,
    arguments: Option<JsonObject>,
) -> Result<CallToolResult> {
    let Some((server_part, tool_part)) = split_tool_name(full_name) else {
        return Err(GatewayError::Validation(format!(
            "malformed tool name '{full_name}': expected serverName__toolName"
        )));
    };

    if let Some(member) = session.find_member(server_part) {
        debug!(
            target: "metamcp::aggregator",
            server = %member.server.name,
            tool = tool_part,
            "dispatching call"
        );
        return member.client.call_tool(tool_part, arguments).await;
    }

    if let Some((next_segment, rest)) = split_tool_name(tool_part) {
        let nested = full_tool_name(server_part, next_segment);
        if let Some(member) = session.find_member(&nested) {
            debug!(
                target: "metamcp::aggregator",
                server = %member.server.name,
                tool = rest,
                "dispatching call to nested gateway member"
            );
            return member.client.call_tool(rest, arguments).await;
        }
    }

    Err(GatewayError::NotFound(format!(
        "no member server matches tool '{full_name}'"
    )))
}

/// Base `tools/list` handler: the merged registry minus INACTIVE tool
/// memberships.
pub struct AggregatorListHandler {
    session: Arc<NamespaceSession>,
    repo: Arc<dyn Repository>,
}

impl AggregatorListHandler {
    pub fn new(session: Arc<NamespaceSession>, repo: Arc<dyn Repository>) -> Self {
        Self { session, repo }
    }

    async fn inactive_tools(&self, namespace_uuid: Uuid) -> Result<HashSet<(Uuid, String)>> {
        let memberships = self.repo.list_tool_memberships(namespace_uuid).await?;
        let inactive_uuids: HashSet<Uuid> = memberships
            .iter()
            .filter(|m| m.status == MembershipStatus::Inactive)
            .map(|m| m.tool_uuid)
            .collect();
        if inactive_uuids.is_empty() {
            return Ok(HashSet::new());
        }

        let mut inactive = HashSet::new();
        for member in self.session.members() {
            for tool in self.repo.list_server_tools(member.server.uuid).await? {
                if inactive_uuids.contains(&tool.uuid) {
                    inactive.insert((member.server.uuid, tool.name));
                }
            }
        }
        Ok(inactive)
    }
}

#[async_trait]
impl ListToolsHandler for AggregatorListHandler {
    async fn list_tools(&self, ctx: &RequestContext) -> Result<Vec<AggregatedTool>> {
        let registry = merged_registry(&self.session).await?;
        let inactive = self.inactive_tools(ctx.namespace_uuid).await?;
        Ok(registry
            .iter()
            .filter(|tool| !inactive.contains(&(tool.server_uuid, tool.original_name.clone())))
            .cloned()
            .collect())
    }
}

/// Base `tools/call` handler: plain dispatch.
pub struct AggregatorCallHandler {
    session: Arc<NamespaceSession>,
}

impl AggregatorCallHandler {
    pub fn new(session: Arc<NamespaceSession>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl CallToolHandler for AggregatorCallHandler {
    async fn call_tool(
        &self,
        _ctx: &RequestContext,
        request: CallRequest,
    ) -> Result<CallToolResult> {
        dispatch(&self.session, &request.name, request.arguments).await
    }
}

/// [`ToolExecutor`] over one composed session, for the ask agent.
pub struct SessionExecutor {
    session: Arc<NamespaceSession>,
}

impl SessionExecutor {
    pub fn new(session: Arc<NamespaceSession>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl ToolExecutor for SessionExecutor {
    async fn execute(&self, full_name: &str, arguments: Value) -> Result<Value> {
        if is_synthetic_tool(full_name) {
            return Err(GatewayError::PolicyDenied(format!(
                "refusing recursive call to '{full_name}'"
            )));
        }
        let arguments = match arguments {
            Value::Object(map) => Some(map),
            Value::Null => None,
            other => {
                return Err(GatewayError::Validation(format!(
                    "tool arguments must be an object, got {other}"
                )))
            }
        };
        let result = dispatch(&self.session, full_name, arguments).await?;
        if result.is_error == Some(true) {
            let detail = serde_json::to_string(&result.content)
                .unwrap_or_else(|_| "tool returned an error".into());
            return Err(GatewayError::UpstreamFatal(detail));
        }
        if let Some(structured) = result.structured_content {
            return Ok(structured);
        }
        serde_json::to_value(&result.content).map_err(GatewayError::internal)
    }
}

/// One tool as reported by a downstream listing, after override rewriting.
#[derive(Debug, Clone)]
pub struct RefreshToolEntry {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshSummary {
    pub tools_created: usize,
    pub mappings_created: usize,
}

/// Persist the tools a downstream actually saw.
///
/// Override names are skipped (they are presentation, not identity). Each
/// remaining full name is resolved to a member server, including the
/// one-level nested-gateway fallback, grouped, and bulk-upserted together
/// with an ACTIVE membership. Idempotent: a second run with the same payload
/// creates nothing.
pub async fn refresh_tools(
    repo: &Arc<dyn Repository>,
    reverse_overrides: &HashMap<String, String>,
    namespace_uuid: Uuid,
    entries: Vec<RefreshToolEntry>,
) -> Result<RefreshSummary> {
    let servers = repo.list_namespace_servers(namespace_uuid).await?;
    let by_name: HashMap<&str, Uuid> = servers
        .iter()
        .map(|(server, _)| (server.name.as_str(), server.uuid))
        .collect();

    let mut grouped: HashMap<Uuid, Vec<ToolUpsert>> = HashMap::new();
    for entry in entries {
        if reverse_overrides.contains_key(&entry.name) {
            continue;
        }
        let Some((server_part, tool_part)) = split_tool_name(&entry.name) else {
            warn!(
                target: "metamcp::aggregator",
                tool = %entry.name,
                "refresh entry has no server prefix, skipping"
            );
            continue;
        };

        let resolved = by_name.get(server_part).copied().map(|uuid| (uuid, tool_part));
        let resolved = resolved.or_else(|| {
            split_tool_name(tool_part).and_then(|(next_segment, rest)| {
                by_name
                    .get(full_tool_name(server_part, next_segment).as_str())
                    .copied()
                    .map(|uuid| (uuid, rest))
            })
        });
        let Some((server_uuid, tool_name)) = resolved else {
            warn!(
                target: "metamcp::aggregator",
                tool = %entry.name,
                "refresh entry matches no member server, skipping"
            );
            continue;
        };

        grouped.entry(server_uuid).or_default().push(ToolUpsert {
            name: tool_name.to_string(),
            title: None,
            description: entry.description,
            input_schema: entry.input_schema,
        });
    }

    let mut summary = RefreshSummary::default();
    for (server_uuid, upserts) in grouped {
        let (records, created) = repo.bulk_upsert_tools(server_uuid, upserts).await?;
        summary.tools_created += created;
        summary.mappings_created += repo
            .bulk_upsert_tool_memberships(
                namespace_uuid,
                records.iter().map(|r| (r.uuid, server_uuid)).collect(),
            )
            .await?;
    }

    info!(
        target: "metamcp::aggregator",
        namespace = %namespace_uuid,
        tools_created = summary.tools_created,
        mappings_created = summary.mappings_created,
        "tools refreshed"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::namespace_pool::MemberServer;
    use crate::pool::server_pool::UpstreamClient;
    use metamcp_core::{McpServer, MemoryRepository, Namespace, TransportConfig};
    use parking_lot::Mutex;
    use rmcp::model::Content;
    use serde_json::json;
    use std::collections::HashMap as StdHashMap;

    pub(crate) struct ScriptedUpstream {
        tools: Vec<Tool>,
        pub calls: Mutex<Vec<(String, Option<JsonObject>)>>,
    }

    impl ScriptedUpstream {
        pub fn new(tool_names: &[(&str, &str)]) -> Arc<Self> {
            let tools = tool_names
                .iter()
                .map(|(name, description)| Tool {
                    name: name.to_string().into(),
                    title: None,
                    description: Some(description.to_string().into()),
                    input_schema: Arc::new(
                        json!({"type": "object"}).as_object().cloned().unwrap(),
                    ),
                    output_schema: None,
                    annotations: None,
                    icons: None,
                })
                .collect();
            Arc::new(Self {
                tools,
                calls: Mutex::new(vec![]),
            })
        }
    }

    #[async_trait]
    impl UpstreamClient for ScriptedUpstream {
        async fn list_tools(&self) -> Result<Vec<Tool>> {
            Ok(self.tools.clone())
        }

        async fn call_tool(
            &self,
            name: &str,
            arguments: Option<JsonObject>,
        ) -> Result<CallToolResult> {
            self.calls.lock().push((name.to_string(), arguments));
            Ok(CallToolResult {
                content: vec![Content::text(format!("ran {name}"))],
                structured_content: None,
                is_error: Some(false),
                meta: None,
            })
        }

        async fn close(&self) {}
    }

    fn namespace() -> Namespace {
        Namespace {
            uuid: Uuid::new_v4(),
            name: "dev".into(),
            description: None,
            user_id: None,
            smart_discovery_enabled: false,
            smart_discovery_description: None,
            pinned_tools: vec![],
            ask_agent_uuid: None,
        }
    }

    fn server(name: &str) -> McpServer {
        McpServer {
            uuid: Uuid::new_v4(),
            name: name.into(),
            transport: TransportConfig::Stdio {
                command: "echo".into(),
                args: vec![],
                env: StdHashMap::new(),
                inherit_env: false,
            },
            user_id: None,
        }
    }

    fn session_with(
        members: Vec<(McpServer, Arc<ScriptedUpstream>)>,
    ) -> Arc<NamespaceSession> {
        Arc::new(NamespaceSession::new(
            namespace(),
            members
                .into_iter()
                .map(|(server, client)| MemberServer {
                    server,
                    client: client as Arc<dyn UpstreamClient>,
                })
                .collect(),
        ))
    }

    #[tokio::test]
    async fn merged_list_covers_every_active_member() {
        let alpha = ScriptedUpstream::new(&[("read", "Read a file"), ("write", "Write a file")]);
        let beta = ScriptedUpstream::new(&[("query", "Run a SQL query")]);
        let session = session_with(vec![
            (server("alpha"), alpha),
            (server("beta"), beta),
        ]);

        let registry = merged_registry(&session).await.unwrap();
        let names: Vec<&str> = registry.iter().map(|t| t.full_name.as_str()).collect();
        assert_eq!(names, vec!["alpha__read", "alpha__write", "beta__query"]);
        assert_eq!(registry[0].display.name, "alpha__read");
        assert_eq!(registry[0].original_name, "read");
    }

    #[tokio::test]
    async fn dispatch_reaches_the_right_member_with_the_original_name() {
        let alpha = ScriptedUpstream::new(&[("read", "")]);
        let beta = ScriptedUpstream::new(&[("query", "")]);
        let session = session_with(vec![
            (server("alpha"), alpha.clone()),
            (server("beta"), beta.clone()),
        ]);

        let args = json!({"sql": "SELECT 1"}).as_object().cloned();
        dispatch(&session, "beta__query", args.clone()).await.unwrap();

        assert!(alpha.calls.lock().is_empty());
        let calls = beta.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "query");
        assert_eq!(calls[0].1, args);
    }

    #[tokio::test]
    async fn malformed_names_fail_validation() {
        let session = session_with(vec![(server("alpha"), ScriptedUpstream::new(&[]))]);
        let err = dispatch(&session, "no-separator", None).await.unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }

    #[tokio::test]
    async fn nested_gateway_names_collapse_one_level() {
        let nested = ScriptedUpstream::new(&[]);
        let session = session_with(vec![(server("meta__files"), nested.clone())]);

        dispatch(&session, "meta__files__read", None).await.unwrap();
        let calls = nested.calls.lock();
        assert_eq!(calls[0].0, "read");
    }

    #[tokio::test]
    async fn deeper_nesting_is_rejected() {
        let session = session_with(vec![(server("alpha"), ScriptedUpstream::new(&[]))]);
        let err = dispatch(&session, "a__b__c__d", None).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[tokio::test]
    async fn refresh_tools_is_idempotent_and_skips_override_names() {
        let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
        let namespace = namespace();
        repo.upsert_namespace(namespace.clone()).await.unwrap();
        let alpha = server("alpha");
        repo.upsert_server(alpha.clone()).await.unwrap();
        repo.add_server_to_namespace(namespace.uuid, alpha.uuid, MembershipStatus::Active)
            .await
            .unwrap();

        let reverse: HashMap<String, String> =
            HashMap::from([("fs_read".to_string(), "alpha__read".to_string())]);
        let entries = vec![
            RefreshToolEntry {
                name: "fs_read".into(),
                description: None,
                input_schema: json!({"type": "object"}),
            },
            RefreshToolEntry {
                name: "alpha__write".into(),
                description: Some("Write a file".into()),
                input_schema: json!({"type": "object"}),
            },
            RefreshToolEntry {
                name: "stranger__tool".into(),
                description: None,
                input_schema: json!({"type": "object"}),
            },
        ];

        let first = refresh_tools(&repo, &reverse, namespace.uuid, entries.clone())
            .await
            .unwrap();
        assert_eq!(first.tools_created, 1, "only alpha__write persists");
        assert_eq!(first.mappings_created, 1);

        let second = refresh_tools(&repo, &reverse, namespace.uuid, entries)
            .await
            .unwrap();
        assert_eq!(second.tools_created, 0);
        assert_eq!(second.mappings_created, 0);

        let tools = repo.list_server_tools(alpha.uuid).await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "write");
    }

    #[tokio::test]
    async fn session_executor_refuses_synthetic_names() {
        let session = session_with(vec![(server("alpha"), ScriptedUpstream::new(&[]))]);
        let executor = SessionExecutor::new(session);
        let err = executor
            .execute("metamcp__find", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::PolicyDenied(_)));
    }

    #[tokio::test]
    async fn session_executor_returns_content_as_json() {
        let alpha = ScriptedUpstream::new(&[("read", "")]);
        let session = session_with(vec![(server("alpha"), alpha)]);
        let executor = SessionExecutor::new(session);

        let value = executor
            .execute("alpha__read", json!({"path": "/tmp/x"}))
            .await
            .unwrap();
        let rendered = value.to_string();
        assert!(rendered.contains("ran read"));
    }
}
