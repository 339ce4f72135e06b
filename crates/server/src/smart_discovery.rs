//! Smart discovery: hide the real registry behind `metamcp__find` and
//! `metamcp__ask`.
//!
//! When enabled for a namespace, `tools/list` returns only the synthetic
//! tools, the namespace's pinned tools, and whatever this session has already
//! discovered. `metamcp__find` runs a semantic search and *replaces* the
//! session's discovered set; `metamcp__ask` delegates to the ask agent.
//! Indexing happens in the background off every listing and is never awaited.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rmcp::model::{CallToolResult, Content, Tool};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use metamcp_agent::{AskAgentRunner, AskContext, AskParams, ExposureSink};
use metamcp_core::{
    is_synthetic_tool, GatewayError, Repository, Result, ASK_TOOL_NAME, FIND_TOOL_NAME,
};
use metamcp_discovery::{DiscoveryIndex, ToolSummary, DEFAULT_SEARCH_THRESHOLD};

use crate::aggregator::AggregatedTool;
use crate::middleware::{
    CallNext, CallRequest, CallToolLayer, ListNext, ListToolsLayer, RequestContext,
};

const DEFAULT_FIND_LIMIT: u64 = 5;
const MAX_FIND_LIMIT: u64 = 20;

struct StatusEntry {
    enabled: bool,
    fetched: Instant,
}

/// Shared smart-discovery state: the enablement cache and the per-session
/// exposed sets.
pub struct SmartDiscoveryState {
    status: Mutex<HashMap<Uuid, StatusEntry>>,
    status_ttl: Duration,
    exposed: Mutex<HashMap<(String, Uuid), Vec<String>>>,
    high_water: usize,
    gc_interval: Duration,
    last_gc: Mutex<Instant>,
}

impl SmartDiscoveryState {
    pub fn new(status_ttl: Duration, high_water: usize, gc_interval: Duration) -> Self {
        Self {
            status: Mutex::new(HashMap::new()),
            status_ttl,
            exposed: Mutex::new(HashMap::new()),
            high_water,
            gc_interval,
            last_gc: Mutex::new(Instant::now()),
        }
    }

    pub fn from_env() -> Self {
        Self::new(
            metamcp_state::discovery_status_ttl(),
            metamcp_state::session_high_water_mark(),
            metamcp_state::session_gc_interval(),
        )
    }

    /// Whether smart discovery is on for this namespace, cached for the TTL.
    /// Repository failures degrade to "off" so listing still works.
    pub async fn enabled(&self, repo: &Arc<dyn Repository>, namespace_uuid: Uuid) -> bool {
        if let Some(entry) = self.status.lock().get(&namespace_uuid) {
            if entry.fetched.elapsed() < self.status_ttl {
                return entry.enabled;
            }
        }
        let enabled = match repo.get_namespace(namespace_uuid).await {
            Ok(namespace) => namespace.smart_discovery_enabled,
            Err(err) => {
                warn!(
                    target: "metamcp::discovery",
                    namespace = %namespace_uuid,
                    error = %err,
                    "could not load smart-discovery status, treating as disabled"
                );
                false
            }
        };
        self.status.lock().insert(
            namespace_uuid,
            StatusEntry {
                enabled,
                fetched: Instant::now(),
            },
        );
        enabled
    }

    pub fn invalidate_status(&self, namespace_uuid: Uuid) {
        self.status.lock().remove(&namespace_uuid);
    }

    /// Replace (not extend) a session's discovered set.
    pub fn set_exposed(&self, session_id: &str, namespace_uuid: Uuid, tools: Vec<String>) {
        self.exposed
            .lock()
            .insert((session_id.to_string(), namespace_uuid), tools);
        self.maybe_gc();
    }

    pub fn get_exposed(&self, session_id: &str, namespace_uuid: Uuid) -> Vec<String> {
        self.exposed
            .lock()
            .get(&(session_id.to_string(), namespace_uuid))
            .cloned()
            .unwrap_or_default()
    }

    /// Drop all state for one downstream session.
    pub fn remove_session(&self, session_id: &str) {
        self.exposed.lock().retain(|(sid, _), _| sid != session_id);
    }

    pub fn tracked_sessions(&self) -> usize {
        self.exposed.lock().len()
    }

    /// Coarse backstop for transports that never signal disconnect: past the
    /// high-water mark, and at most once per interval, the whole table goes.
    fn maybe_gc(&self) {
        let mut exposed = self.exposed.lock();
        if exposed.len() <= self.high_water {
            return;
        }
        let mut last_gc = self.last_gc.lock();
        if last_gc.elapsed() < self.gc_interval {
            return;
        }
        info!(
            target: "metamcp::discovery",
            dropped = exposed.len(),
            "exposure table passed the high-water mark, clearing"
        );
        exposed.clear();
        *last_gc = Instant::now();
    }
}

impl ExposureSink for SmartDiscoveryState {
    fn replace_exposed(&self, session_id: &str, namespace_uuid: Uuid, tools: &[String]) {
        self.set_exposed(session_id, namespace_uuid, tools.to_vec());
    }
}

fn object_schema(value: Value) -> Arc<serde_json::Map<String, Value>> {
    Arc::new(value.as_object().cloned().unwrap_or_default())
}

fn synthetic_tool(full_name: &'static str, description: &str, schema: Value) -> AggregatedTool {
    AggregatedTool {
        server_uuid: Uuid::nil(),
        server_name: "metamcp".into(),
        original_name: full_name.trim_start_matches("metamcp__").to_string(),
        original_title: None,
        original_description: Some(description.to_string()),
        full_name: full_name.to_string(),
        display: Tool {
            name: full_name.into(),
            title: None,
            description: Some(description.to_string().into()),
            input_schema: object_schema(schema),
            output_schema: None,
            annotations: None,
            icons: None,
        },
    }
}

fn find_tool(namespace_description: Option<&str>) -> AggregatedTool {
    let description = match namespace_description {
        Some(hint) => format!(
            "Search this namespace's tools by natural-language query. {hint}"
        ),
        None => "Search this namespace's tools by natural-language query. Matching tools \
                 become directly callable for this session."
            .to_string(),
    };
    synthetic_tool(
        FIND_TOOL_NAME,
        &description,
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "What you want to do, in plain language"
                },
                "limit": {
                    "type": "number",
                    "default": DEFAULT_FIND_LIMIT,
                    "maximum": MAX_FIND_LIMIT,
                    "description": "Maximum number of tools to return"
                }
            },
            "required": ["query"],
            "additionalProperties": false
        }),
    )
}

fn ask_tool() -> AggregatedTool {
    synthetic_tool(
        ASK_TOOL_NAME,
        "Ask the namespace agent a question. The agent may call tools on your behalf \
         and expose the useful ones back to this session.",
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The question or task for the agent"
                },
                "maxToolCalls": {
                    "type": "number",
                    "description": "Upper bound on tool calls the agent may make"
                },
                "exposeLimit": {
                    "type": "number",
                    "description": "Upper bound on tools exposed back to this session"
                }
            },
            "required": ["query"],
            "additionalProperties": false
        }),
    )
}

/// The smart-discovery middleware, outermost in both chains.
pub struct SmartDiscoveryLayer {
    repo: Arc<dyn Repository>,
    index: Arc<DiscoveryIndex>,
    state: Arc<SmartDiscoveryState>,
    runner: Arc<AskAgentRunner>,
}

impl SmartDiscoveryLayer {
    pub fn new(
        repo: Arc<dyn Repository>,
        index: Arc<DiscoveryIndex>,
        state: Arc<SmartDiscoveryState>,
        runner: Arc<AskAgentRunner>,
    ) -> Self {
        Self {
            repo,
            index,
            state,
            runner,
        }
    }

    fn spawn_indexing(&self, namespace_uuid: Uuid, tools: &[AggregatedTool]) {
        let summaries: Vec<ToolSummary> = tools
            .iter()
            .filter(|tool| !is_synthetic_tool(&tool.full_name))
            .map(|tool| ToolSummary {
                full_name: tool.full_name.clone(),
                server_name: tool.server_name.clone(),
                original_name: tool.original_name.clone(),
                title: tool.original_title.clone(),
                description: tool.original_description.clone(),
                input_schema: Value::Object((*tool.display.input_schema).clone()),
            })
            .collect();
        let index = self.index.clone();
        tokio::spawn(async move {
            if let Err(err) = index.index_tools(namespace_uuid, summaries).await {
                error!(
                    target: "metamcp::discovery",
                    namespace = %namespace_uuid,
                    error = %err,
                    "background indexing failed"
                );
            }
        });
    }

    async fn handle_find(
        &self,
        ctx: &RequestContext,
        arguments: Option<serde_json::Map<String, Value>>,
    ) -> Result<CallToolResult> {
        let arguments = arguments.unwrap_or_default();
        let query = arguments
            .get("query")
            .and_then(|v| v.as_str())
            .filter(|q| !q.is_empty())
            .ok_or_else(|| {
                GatewayError::Validation("metamcp__find requires a string 'query'".into())
            })?;
        let limit = arguments
            .get("limit")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_FIND_LIMIT)
            .clamp(1, MAX_FIND_LIMIT) as usize;

        let hits = self
            .index
            .search(ctx.namespace_uuid, query, limit, DEFAULT_SEARCH_THRESHOLD)
            .await?;
        let names: Vec<String> = hits.iter().map(|h| h.full_name.clone()).collect();
        self.state
            .set_exposed(&ctx.session_id, ctx.namespace_uuid, names);

        let tools: Vec<Value> = hits
            .iter()
            .map(|hit| {
                json!({
                    "name": hit.full_name,
                    "description": hit.description,
                    "arguments": hit.input_schema,
                    "relevanceScore": round2(hit.score),
                })
            })
            .collect();
        let payload = json!({
            "message": format!(
                "Found {} matching tools. They are now directly callable in this session.",
                hits.len()
            ),
            "query": query,
            "tools": tools,
            "usage": {
                "indexedTools": self.index.namespace_size(ctx.namespace_uuid),
                "returned": hits.len(),
            },
        });
        Ok(json_result(payload))
    }

    async fn handle_ask(
        &self,
        ctx: &RequestContext,
        arguments: Option<serde_json::Map<String, Value>>,
    ) -> Result<CallToolResult> {
        let arguments = arguments.unwrap_or_default();
        let query = arguments
            .get("query")
            .and_then(|v| v.as_str())
            .filter(|q| !q.is_empty())
            .ok_or_else(|| {
                GatewayError::Validation("metamcp__ask requires a string 'query'".into())
            })?;
        let max_tool_calls = arguments
            .get("maxToolCalls")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32);
        let expose_limit = arguments
            .get("exposeLimit")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32);

        let namespace = self.repo.get_namespace(ctx.namespace_uuid).await?;
        let Some(agent_uuid) = namespace.ask_agent_uuid else {
            return Ok(error_result(
                "No ask agent is configured for this namespace.",
            ));
        };
        let agent = self.repo.get_agent(agent_uuid).await?;

        let outcome = self
            .runner
            .run(
                &AskContext {
                    namespace_uuid: ctx.namespace_uuid,
                    session_id: ctx.session_id.clone(),
                    namespace_name: namespace.name.clone(),
                    namespace_description: namespace
                        .smart_discovery_description
                        .or(namespace.description),
                },
                &agent,
                AskParams {
                    query: query.to_string(),
                    max_tool_calls,
                    expose_limit,
                },
            )
            .await?;

        let payload = serde_json::to_value(&outcome).map_err(GatewayError::internal)?;
        Ok(json_result(payload))
    }
}

fn round2(score: f32) -> f64 {
    (f64::from(score) * 100.0).round() / 100.0
}

fn json_result(payload: Value) -> CallToolResult {
    CallToolResult {
        content: vec![Content::text(payload.to_string())],
        structured_content: Some(payload),
        is_error: Some(false),
        meta: None,
    }
}

fn error_result(message: &str) -> CallToolResult {
    CallToolResult {
        content: vec![Content::text(message.to_string())],
        structured_content: None,
        is_error: Some(true),
        meta: None,
    }
}

#[async_trait]
impl ListToolsLayer for SmartDiscoveryLayer {
    async fn handle(
        &self,
        ctx: &RequestContext,
        next: ListNext<'_>,
    ) -> Result<Vec<AggregatedTool>> {
        let tools = next.run(ctx).await?;
        if !self.state.enabled(&self.repo, ctx.namespace_uuid).await {
            return Ok(tools);
        }

        self.spawn_indexing(ctx.namespace_uuid, &tools);

        let namespace = self.repo.get_namespace(ctx.namespace_uuid).await?;
        let discovered = self.state.get_exposed(&ctx.session_id, ctx.namespace_uuid);

        let mut result = vec![
            ask_tool(),
            find_tool(namespace.smart_discovery_description.as_deref()),
        ];
        let mut included: HashSet<String> =
            result.iter().map(|t| t.full_name.clone()).collect();
        for name in namespace.pinned_tools.iter().chain(discovered.iter()) {
            if !included.insert(name.clone()) {
                continue;
            }
            if let Some(tool) = tools.iter().find(|t| t.full_name == *name) {
                result.push(tool.clone());
            }
        }
        debug!(
            target: "metamcp::discovery",
            namespace = %ctx.namespace_uuid,
            session = %ctx.session_id,
            exposed = result.len(),
            of = tools.len(),
            "smart discovery filtered the listing"
        );
        Ok(result)
    }
}

#[async_trait]
impl CallToolLayer for SmartDiscoveryLayer {
    async fn handle(
        &self,
        ctx: &RequestContext,
        request: CallRequest,
        next: CallNext<'_>,
    ) -> Result<CallToolResult> {
        if !is_synthetic_tool(&request.name) {
            return next.run(ctx, request).await;
        }
        if !self.state.enabled(&self.repo, ctx.namespace_uuid).await {
            return Ok(error_result(&format!(
                "Smart discovery is not enabled for this namespace; '{}' is unavailable.",
                request.name
            )));
        }
        match request.name.as_str() {
            FIND_TOOL_NAME => self.handle_find(ctx, request.arguments).await,
            ASK_TOOL_NAME => self.handle_ask(ctx, request.arguments).await,
            _ => unreachable!("is_synthetic_tool covers both names"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(ttl_ms: u64, high_water: usize, gc_interval_ms: u64) -> SmartDiscoveryState {
        SmartDiscoveryState::new(
            Duration::from_millis(ttl_ms),
            high_water,
            Duration::from_millis(gc_interval_ms),
        )
    }

    #[test]
    fn exposure_is_replace_not_union() {
        let state = state(5_000, 1_000, 3_600_000);
        let namespace = Uuid::new_v4();
        state.set_exposed("s1", namespace, vec!["alpha__read".into(), "alpha__write".into()]);
        state.set_exposed("s1", namespace, vec!["beta__query".into()]);
        assert_eq!(state.get_exposed("s1", namespace), vec!["beta__query".to_string()]);
    }

    #[test]
    fn sessions_are_isolated_and_removable() {
        let state = state(5_000, 1_000, 3_600_000);
        let namespace = Uuid::new_v4();
        state.set_exposed("s1", namespace, vec!["alpha__read".into()]);
        state.set_exposed("s2", namespace, vec!["beta__query".into()]);
        assert_eq!(state.tracked_sessions(), 2);

        state.remove_session("s1");
        assert!(state.get_exposed("s1", namespace).is_empty());
        assert_eq!(state.get_exposed("s2", namespace), vec!["beta__query".to_string()]);
    }

    #[test]
    fn coarse_gc_clears_everything_past_the_high_water_mark() {
        let state = state(5_000, 2, 0);
        let namespace = Uuid::new_v4();
        state.set_exposed("s1", namespace, vec![]);
        state.set_exposed("s2", namespace, vec![]);
        assert_eq!(state.tracked_sessions(), 2, "at the mark, nothing dropped");

        state.set_exposed("s3", namespace, vec![]);
        assert_eq!(state.tracked_sessions(), 0, "past the mark, table cleared");
    }

    #[test]
    fn gc_respects_the_interval() {
        let state = state(5_000, 1, 3_600_000);
        let namespace = Uuid::new_v4();
        // last_gc starts at construction; the interval has not elapsed.
        state.set_exposed("s1", namespace, vec![]);
        state.set_exposed("s2", namespace, vec![]);
        assert_eq!(state.tracked_sessions(), 2);
    }

    #[tokio::test]
    async fn status_cache_degrades_to_disabled_on_missing_namespace() {
        let repo: Arc<dyn Repository> = Arc::new(metamcp_core::MemoryRepository::new());
        let state = state(5_000, 1_000, 3_600_000);
        assert!(!state.enabled(&repo, Uuid::new_v4()).await);
    }

    #[test]
    fn synthetic_tools_have_the_contract_schemas() {
        let find = find_tool(None);
        assert_eq!(find.full_name, FIND_TOOL_NAME);
        let schema = &find.display.input_schema;
        assert_eq!(schema["required"], json!(["query"]));
        assert_eq!(schema["properties"]["limit"]["default"], json!(5));
        assert_eq!(schema["properties"]["limit"]["maximum"], json!(20));

        let ask = ask_tool();
        assert_eq!(ask.full_name, ASK_TOOL_NAME);
        assert_eq!(ask.display.input_schema["required"], json!(["query"]));
    }

    #[test]
    fn scores_round_to_two_decimals() {
        assert_eq!(round2(0.3333), 0.33);
        assert_eq!(round2(0.999), 1.0);
    }
}
