//! The plan → execute → report loop.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use metamcp_core::{
    is_synthetic_tool, GatewayError, NamespaceAgent, Result, TokenCounter, AGENT_TOKEN_BUDGET,
};
use metamcp_discovery::{DiscoveryIndex, SearchHit, DEFAULT_SEARCH_THRESHOLD};

use crate::llm::{ChatClient, ChatRequest};
use crate::policy::ToolPolicy;

/// Hard cap on tool calls per run, whatever the agent config says.
pub const MAX_TOOL_CALL_CAP: u32 = 20;
/// Hard cap on tools exposed back into the session.
pub const MAX_EXPOSE_CAP: u32 = 50;
/// Candidate tools fetched from the discovery index for planning.
pub const SHORTLIST_LIMIT: usize = 12;
/// Tool results longer than this are truncated before reporting.
pub const TOOL_RESULT_MAX_CHARS: usize = 6_000;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a namespace assistant for an MCP gateway. \
You receive a user query, a shortlist of candidate tools, and optional reference \
documents. Respond with a single JSON object. To answer directly, set \
\"directAnswer\". To gather information first, propose \"toolCalls\" as an array of \
{name, arguments, reason}. Suggest tools worth exposing to the caller in \
\"exposeTools\" and optional \"followups\". Never propose a tool that is not in the \
shortlist.";

const REPORT_SYSTEM_PROMPT: &str = "You are a namespace assistant summarizing an \
investigation. You receive the candidate tools, the plan, and the executed tool \
calls with their results. Respond with a single JSON object: {\"answer\": string, \
\"suggestedTools\"?: [string], \"exposeTools\"?: [string], \"followups\"?: [string]}.";

/// Executes upstream tools on behalf of the agent.
///
/// Implemented by the aggregator; the name is a full `serverName__toolName`
/// and the result is the upstream content, already JSON-shaped.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, full_name: &str, arguments: Value) -> Result<Value>;
}

/// Receives the curated tool set at the end of a successful run.
///
/// Implemented by the smart-discovery layer; replaces (does not extend) the
/// session's exposed set. Short-circuited runs (disabled agent, budget
/// overflow) never reach this hook.
pub trait ExposureSink: Send + Sync {
    fn replace_exposed(&self, session_id: &str, namespace_uuid: Uuid, tools: &[String]);
}

/// Where the ask run happens.
#[derive(Debug, Clone)]
pub struct AskContext {
    pub namespace_uuid: Uuid,
    pub session_id: String,
    pub namespace_name: String,
    pub namespace_description: Option<String>,
}

/// Per-call knobs from the downstream request; fall back to the agent config.
#[derive(Debug, Clone, Default)]
pub struct AskParams {
    pub query: String,
    pub max_tool_calls: Option<u32>,
    pub expose_limit: Option<u32>,
}

/// One entry of the execution log, refusals included.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutedToolCall {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Token accounting for the budget pre-check.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBreakdown {
    pub system_prompt: usize,
    pub tool_candidates: usize,
    pub references: usize,
    pub query: usize,
    pub planning_payload: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AskUsage {
    pub shortlisted: usize,
    pub planned: usize,
    pub executed: usize,
}

/// Final report returned to the downstream caller.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AskOutcome {
    pub answer: String,
    pub tool_calls_executed: Vec<ExecutedToolCall>,
    pub suggested_tools: Vec<String>,
    pub exposed_tools: Vec<String>,
    pub followups: Vec<String>,
    pub usage: AskUsage,
    pub token_usage: TokenBreakdown,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct PlannedCall {
    name: String,
    arguments: Option<Value>,
    reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct PlanResponse {
    direct_answer: Option<String>,
    tool_calls: Vec<PlannedCall>,
    expose_tools: Vec<String>,
    followups: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct ReportResponse {
    answer: Option<String>,
    suggested_tools: Vec<String>,
    expose_tools: Vec<String>,
    followups: Vec<String>,
}

/// Runs ask agents. Holds only shared services; per-run state stays local.
pub struct AskAgentRunner {
    index: Arc<DiscoveryIndex>,
    tokens: Arc<TokenCounter>,
    chat: Option<Arc<dyn ChatClient>>,
    executor: Arc<dyn ToolExecutor>,
    exposure: Arc<dyn ExposureSink>,
}

impl AskAgentRunner {
    pub fn new(
        index: Arc<DiscoveryIndex>,
        tokens: Arc<TokenCounter>,
        chat: Option<Arc<dyn ChatClient>>,
        executor: Arc<dyn ToolExecutor>,
        exposure: Arc<dyn ExposureSink>,
    ) -> Self {
        Self {
            index,
            tokens,
            chat,
            executor,
            exposure,
        }
    }

    /// Run one ask query end to end.
    ///
    /// Cancellation is cooperative: dropping the returned future between
    /// steps abandons the run without leaking work.
    pub async fn run(
        &self,
        ctx: &AskContext,
        agent: &NamespaceAgent,
        params: AskParams,
    ) -> Result<AskOutcome> {
        if !agent.enabled {
            return Ok(disabled_outcome(agent));
        }
        let Some(chat) = self.chat.clone() else {
            return Err(GatewayError::Internal(
                "ask agent unavailable: no chat API key configured".into(),
            ));
        };

        let max_tool_calls = params
            .max_tool_calls
            .unwrap_or(agent.max_tool_calls)
            .min(MAX_TOOL_CALL_CAP) as usize;
        let expose_limit = params
            .expose_limit
            .unwrap_or(agent.expose_limit)
            .min(MAX_EXPOSE_CAP) as usize;
        let policy = ToolPolicy::new(&agent.allowed_tools, &agent.denied_tools);

        // 1. Shortlist.
        let shortlist = self
            .index
            .search(
                ctx.namespace_uuid,
                &params.query,
                SHORTLIST_LIMIT,
                DEFAULT_SEARCH_THRESHOLD,
            )
            .await?;
        let candidates = candidates_json(&shortlist, &policy);

        // 2. Budget pre-check: nothing goes to the model past this point if
        // the prompt would blow the budget.
        let system_prompt = agent
            .system_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
        let references = agent.references.clone().unwrap_or(Value::Null);
        let planning_payload = json!({
            "namespace": {
                "name": ctx.namespace_name,
                "description": ctx.namespace_description,
            },
            "constraints": {
                "maxToolCalls": max_tool_calls,
                "exposeLimit": expose_limit,
            },
            "tools": candidates,
            "references": references,
            "query": params.query,
        })
        .to_string();

        let breakdown = TokenBreakdown {
            system_prompt: self.tokens.count(&agent.model, &system_prompt)?,
            tool_candidates: self
                .tokens
                .count(&agent.model, &candidates.to_string())?,
            references: self
                .tokens
                .count(&agent.model, &references.to_string())?,
            query: self.tokens.count(&agent.model, &params.query)?,
            planning_payload: self.tokens.count(&agent.model, &planning_payload)?,
            total: 0,
        };
        let total = breakdown.system_prompt
            + breakdown.tool_candidates
            + breakdown.references
            + breakdown.query
            + breakdown.planning_payload;
        let breakdown = TokenBreakdown { total, ..breakdown };
        if total > AGENT_TOKEN_BUDGET {
            return Ok(AskOutcome {
                answer: format!(
                    "The request exceeds the agent token budget ({total} > {AGENT_TOKEN_BUDGET} tokens). \
                     Reduce the query, references, or document set and try again."
                ),
                tool_calls_executed: vec![],
                suggested_tools: vec![],
                exposed_tools: vec![],
                followups: vec![],
                usage: AskUsage {
                    shortlisted: shortlist.len(),
                    planned: 0,
                    executed: 0,
                },
                token_usage: breakdown,
            });
        }

        // 3. Plan.
        let plan_value = chat
            .chat_json(ChatRequest {
                model: agent.model.clone(),
                system: system_prompt,
                user: planning_payload,
                timeout: None,
                base_url: None,
            })
            .await?;
        let plan: PlanResponse = serde_json::from_value(plan_value)
            .map_err(|e| GatewayError::Internal(format!("plan response malformed: {e}")))?;
        debug!(
            target: "metamcp::agent",
            namespace = %ctx.namespace_uuid,
            proposed = plan.tool_calls.len(),
            "plan received"
        );

        // 4. Execute the first `max_tool_calls` proposals; refusals count.
        let mut executed = Vec::new();
        for call in plan.tool_calls.iter().take(max_tool_calls) {
            executed.push(self.execute_one(call, &policy).await);
        }

        // 5. Report.
        let report_payload = json!({
            "query": params.query,
            "shortlist": candidates,
            "plan": plan,
            "toolCallsExecuted": executed,
        })
        .to_string();
        let report_value = chat
            .chat_json(ChatRequest {
                model: agent.model.clone(),
                system: REPORT_SYSTEM_PROMPT.to_string(),
                user: report_payload,
                timeout: None,
                base_url: None,
            })
            .await?;
        let report: ReportResponse = serde_json::from_value(report_value).unwrap_or_default();

        // 6. Expose: report wins ties, plan fills in, clamp after filtering.
        let mut exposed: Vec<String> = Vec::new();
        for name in report
            .expose_tools
            .iter()
            .chain(plan.expose_tools.iter())
        {
            if is_synthetic_tool(name) || !policy.is_allowed(name) {
                continue;
            }
            if !exposed.iter().any(|n| n == name) {
                exposed.push(name.clone());
            }
        }
        exposed.truncate(expose_limit);
        self.exposure
            .replace_exposed(&ctx.session_id, ctx.namespace_uuid, &exposed);

        let answer = report
            .answer
            .or(plan.direct_answer)
            .unwrap_or_else(|| "The agent could not produce an answer.".to_string());

        Ok(AskOutcome {
            answer,
            usage: AskUsage {
                shortlisted: shortlist.len(),
                planned: plan.tool_calls.len(),
                executed: executed.len(),
            },
            tool_calls_executed: executed,
            suggested_tools: report.suggested_tools,
            exposed_tools: exposed,
            followups: report.followups,
            token_usage: breakdown,
        })
    }

    async fn execute_one(&self, call: &PlannedCall, policy: &ToolPolicy<'_>) -> ExecutedToolCall {
        if is_synthetic_tool(&call.name) {
            return ExecutedToolCall {
                name: call.name.clone(),
                arguments: call.arguments.clone(),
                ok: false,
                reason: Some("Refusing recursive call".into()),
                result: None,
                error: None,
            };
        }
        if !policy.is_allowed(&call.name) {
            return ExecutedToolCall {
                name: call.name.clone(),
                arguments: call.arguments.clone(),
                ok: false,
                reason: Some(format!("Tool not allowed by agent policy: {}", call.name)),
                result: None,
                error: None,
            };
        }

        let arguments = call.arguments.clone().unwrap_or_else(|| json!({}));
        match self.executor.execute(&call.name, arguments.clone()).await {
            Ok(value) => ExecutedToolCall {
                name: call.name.clone(),
                arguments: Some(arguments),
                ok: true,
                reason: call.reason.clone(),
                result: Some(truncate_result(&value.to_string())),
                error: None,
            },
            Err(err) => {
                warn!(
                    target: "metamcp::agent",
                    tool = %call.name,
                    error = %err,
                    "agent tool call failed"
                );
                ExecutedToolCall {
                    name: call.name.clone(),
                    arguments: Some(arguments),
                    ok: false,
                    reason: None,
                    result: None,
                    error: Some(err.to_string()),
                }
            }
        }
    }
}

fn disabled_outcome(agent: &NamespaceAgent) -> AskOutcome {
    AskOutcome {
        answer: format!("The ask agent '{}' is disabled for this namespace.", agent.name),
        tool_calls_executed: vec![],
        suggested_tools: vec![],
        exposed_tools: vec![],
        followups: vec![],
        usage: AskUsage {
            shortlisted: 0,
            planned: 0,
            executed: 0,
        },
        token_usage: TokenBreakdown {
            system_prompt: 0,
            tool_candidates: 0,
            references: 0,
            query: 0,
            planning_payload: 0,
            total: 0,
        },
    }
}

fn candidates_json(shortlist: &[SearchHit], policy: &ToolPolicy<'_>) -> Value {
    Value::Array(
        shortlist
            .iter()
            .map(|hit| {
                json!({
                    "name": hit.full_name,
                    "description": hit.description,
                    "arguments": hit.input_schema,
                    "relevanceScore": (hit.score * 100.0).round() / 100.0,
                    "allowed": policy.is_allowed(&hit.full_name),
                })
            })
            .collect(),
    )
}

fn truncate_result(raw: &str) -> String {
    if raw.chars().count() <= TOOL_RESULT_MAX_CHARS {
        return raw.to_string();
    }
    let mut truncated: String = raw.chars().take(TOOL_RESULT_MAX_CHARS).collect();
    truncated.push_str("…(truncated)");
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use metamcp_discovery::{HashEmbedder, ToolSummary};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedChat {
        responses: Mutex<VecDeque<Value>>,
        calls: AtomicUsize,
    }

    impl ScriptedChat {
        fn new(responses: Vec<Value>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ChatClient for ScriptedChat {
        async fn chat_json(&self, _request: ChatRequest) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .pop_front()
                .ok_or_else(|| GatewayError::Internal("no scripted response left".into()))
        }
    }

    struct RecordingExecutor {
        calls: Mutex<Vec<(String, Value)>>,
        response: Value,
    }

    impl RecordingExecutor {
        fn new(response: Value) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(vec![]),
                response,
            })
        }
    }

    #[async_trait]
    impl ToolExecutor for RecordingExecutor {
        async fn execute(&self, full_name: &str, arguments: Value) -> Result<Value> {
            self.calls.lock().push((full_name.to_string(), arguments));
            Ok(self.response.clone())
        }
    }

    fn agent(denied: Vec<String>, max_tool_calls: u32) -> NamespaceAgent {
        NamespaceAgent {
            uuid: Uuid::new_v4(),
            namespace_uuid: Uuid::new_v4(),
            agent_type: "ask".into(),
            name: "helper".into(),
            enabled: true,
            model: "gpt-4o-mini".into(),
            system_prompt: None,
            references: None,
            allowed_tools: vec![],
            denied_tools: denied,
            max_tool_calls,
            expose_limit: NamespaceAgent::DEFAULT_EXPOSE_LIMIT,
        }
    }

    fn context(namespace_uuid: Uuid) -> AskContext {
        AskContext {
            namespace_uuid,
            session_id: "session-1".into(),
            namespace_name: "dev".into(),
            namespace_description: None,
        }
    }

    async fn seeded_index(namespace_uuid: Uuid) -> Arc<DiscoveryIndex> {
        let index = Arc::new(DiscoveryIndex::new(Arc::new(HashEmbedder::new())));
        index
            .index_tools(
                namespace_uuid,
                vec![
                    ToolSummary {
                        full_name: "alpha__read".into(),
                        server_name: "alpha".into(),
                        original_name: "read".into(),
                        title: None,
                        description: Some("Read a file from disk".into()),
                        input_schema: json!({"type": "object"}),
                    },
                    ToolSummary {
                        full_name: "alpha__write".into(),
                        server_name: "alpha".into(),
                        original_name: "write".into(),
                        title: None,
                        description: Some("Write a file to disk".into()),
                        input_schema: json!({"type": "object"}),
                    },
                ],
            )
            .await
            .unwrap();
        index
    }

    #[derive(Default)]
    struct RecordingSink {
        replaced: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl ExposureSink for RecordingSink {
        fn replace_exposed(&self, session_id: &str, _namespace_uuid: Uuid, tools: &[String]) {
            self.replaced
                .lock()
                .push((session_id.to_string(), tools.to_vec()));
        }
    }

    fn runner(
        index: Arc<DiscoveryIndex>,
        chat: Arc<ScriptedChat>,
        executor: Arc<RecordingExecutor>,
    ) -> (AskAgentRunner, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        (
            AskAgentRunner::new(
                index,
                Arc::new(TokenCounter::new()),
                Some(chat),
                executor,
                sink.clone(),
            ),
            sink,
        )
    }

    #[tokio::test]
    async fn denied_tool_is_refused_but_the_run_continues() {
        let agent = agent(vec!["alpha__write".into()], 1);
        let ctx = context(agent.namespace_uuid);
        let index = seeded_index(agent.namespace_uuid).await;
        let chat = ScriptedChat::new(vec![
            json!({"toolCalls": [{"name": "alpha__write", "arguments": {"path": "/tmp/x"}}]}),
            json!({"answer": "Writing is not permitted for this agent."}),
        ]);
        let executor = RecordingExecutor::new(json!({"ok": true}));
        let (runner, _sink) = runner(index, chat.clone(), executor.clone());

        let outcome = runner
            .run(
                &ctx,
                &agent,
                AskParams {
                    query: "write a file".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome.tool_calls_executed.len(), 1);
        let refusal = &outcome.tool_calls_executed[0];
        assert!(!refusal.ok);
        assert!(refusal.reason.as_deref().unwrap().contains("not allowed"));
        assert!(executor.calls.lock().is_empty(), "denied call never dispatched");
        assert_eq!(outcome.answer, "Writing is not permitted for this agent.");
    }

    #[tokio::test]
    async fn synthetic_tools_are_refused_as_recursive() {
        let agent = agent(vec![], 2);
        let ctx = context(agent.namespace_uuid);
        let index = seeded_index(agent.namespace_uuid).await;
        let chat = ScriptedChat::new(vec![
            json!({"toolCalls": [{"name": "metamcp__ask", "arguments": {"query": "loop"}}]}),
            json!({"answer": "done"}),
        ]);
        let executor = RecordingExecutor::new(json!({}));
        let (runner, _sink) = runner(index, chat, executor.clone());

        let outcome = runner
            .run(
                &ctx,
                &agent,
                AskParams {
                    query: "anything".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(
            outcome.tool_calls_executed[0].reason.as_deref(),
            Some("Refusing recursive call")
        );
        assert!(executor.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn tool_calls_are_clamped_to_the_requested_maximum() {
        let agent = agent(vec![], 5);
        let ctx = context(agent.namespace_uuid);
        let index = seeded_index(agent.namespace_uuid).await;
        let chat = ScriptedChat::new(vec![
            json!({"toolCalls": [
                {"name": "alpha__read", "arguments": {"path": "a"}},
                {"name": "alpha__read", "arguments": {"path": "b"}},
                {"name": "alpha__read", "arguments": {"path": "c"}},
            ]}),
            json!({"answer": "read one file"}),
        ]);
        let executor = RecordingExecutor::new(json!({"content": "data"}));
        let (runner, _sink) = runner(index, chat, executor.clone());

        let outcome = runner
            .run(
                &ctx,
                &agent,
                AskParams {
                    query: "read files".into(),
                    max_tool_calls: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome.tool_calls_executed.len(), 1);
        assert_eq!(executor.calls.lock().len(), 1);
        assert_eq!(outcome.usage.planned, 3);
    }

    #[tokio::test]
    async fn long_results_are_truncated() {
        let agent = agent(vec![], 1);
        let ctx = context(agent.namespace_uuid);
        let index = seeded_index(agent.namespace_uuid).await;
        let chat = ScriptedChat::new(vec![
            json!({"toolCalls": [{"name": "alpha__read", "arguments": {}}]}),
            json!({"answer": "big file"}),
        ]);
        let executor = RecordingExecutor::new(json!("x".repeat(10_000)));
        let (runner, _sink) = runner(index, chat, executor);

        let outcome = runner
            .run(
                &ctx,
                &agent,
                AskParams {
                    query: "read".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let result = outcome.tool_calls_executed[0].result.as_deref().unwrap();
        assert!(result.ends_with("…(truncated)"));
        assert!(result.chars().count() <= TOOL_RESULT_MAX_CHARS + "…(truncated)".chars().count());
    }

    #[tokio::test]
    async fn budget_overflow_makes_zero_llm_calls() {
        let agent = agent(vec![], 1);
        let ctx = context(agent.namespace_uuid);
        let index = seeded_index(agent.namespace_uuid).await;
        let chat = ScriptedChat::new(vec![]);
        let executor = RecordingExecutor::new(json!({}));
        let (runner, _sink) = runner(index, chat.clone(), executor.clone());

        let outcome = runner
            .run(
                &ctx,
                &agent,
                AskParams {
                    // Far past the 200k budget once it appears in both the
                    // query and the planning payload.
                    query: "word ".repeat(150_000),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(chat.calls.load(Ordering::SeqCst), 0);
        assert!(executor.calls.lock().is_empty());
        assert!(outcome.tool_calls_executed.is_empty());
        assert!(outcome.exposed_tools.is_empty());
        assert!(outcome.token_usage.total > AGENT_TOKEN_BUDGET);
        assert!(outcome.answer.contains("token budget"));
    }

    #[tokio::test]
    async fn disabled_agent_short_circuits() {
        let mut agent = agent(vec![], 1);
        agent.enabled = false;
        let ctx = context(agent.namespace_uuid);
        let index = seeded_index(agent.namespace_uuid).await;
        let chat = ScriptedChat::new(vec![]);
        let executor = RecordingExecutor::new(json!({}));
        let (runner, _sink) = runner(index, chat.clone(), executor);

        let outcome = runner
            .run(
                &ctx,
                &agent,
                AskParams {
                    query: "anything".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(chat.calls.load(Ordering::SeqCst), 0);
        assert!(outcome.answer.contains("disabled"));
    }

    #[tokio::test]
    async fn missing_chat_client_is_a_descriptive_error() {
        let agent = agent(vec![], 1);
        let ctx = context(agent.namespace_uuid);
        let index = seeded_index(agent.namespace_uuid).await;
        let runner = AskAgentRunner::new(
            index,
            Arc::new(TokenCounter::new()),
            None,
            RecordingExecutor::new(json!({})),
            Arc::new(RecordingSink::default()),
        );

        let err = runner
            .run(
                &ctx,
                &agent,
                AskParams {
                    query: "anything".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no chat API key"));
    }

    #[tokio::test]
    async fn exposure_merges_report_and_plan_filtered_by_policy() {
        let agent = agent(vec!["alpha__write".into()], 0);
        let ctx = context(agent.namespace_uuid);
        let index = seeded_index(agent.namespace_uuid).await;
        let chat = ScriptedChat::new(vec![
            json!({"exposeTools": ["alpha__read", "metamcp__find"]}),
            json!({
                "answer": "done",
                "exposeTools": ["alpha__read", "alpha__write"],
            }),
        ]);
        let executor = RecordingExecutor::new(json!({}));
        let (runner, _sink) = runner(index, chat, executor);

        let outcome = runner
            .run(
                &ctx,
                &agent,
                AskParams {
                    query: "expose".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // Synthetic and denied names filtered, duplicates collapsed.
        assert_eq!(outcome.exposed_tools, vec!["alpha__read".to_string()]);
    }
}
