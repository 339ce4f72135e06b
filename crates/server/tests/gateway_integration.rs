//! End-to-end scenarios against in-process fake upstreams.
//!
//! Exercises the full middleware chain (smart discovery, overrides,
//! aggregation) the way a downstream session drives it, with no real
//! subprocesses, sockets, or chat providers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rmcp::model::{CallToolResult, Content, JsonObject, Tool};
use serde_json::{json, Value};
use uuid::Uuid;

use metamcp_agent::{ChatClient, ChatRequest};
use metamcp_core::{
    GatewayError, McpServer, MembershipStatus, MemoryRepository, Namespace, NamespaceAgent,
    Repository, Result, SessionTransport, ToolOverrides, ToolUpsert, TransportConfig,
};
use metamcp_discovery::HashEmbedder;
use metamcp_server::middleware::CallRequest;
use metamcp_server::pool::{UpstreamClient, UpstreamConnector};
use metamcp_server::service::NamespaceService;
use metamcp_server::smart_discovery::SmartDiscoveryState;
use metamcp_server::GatewayContext;

struct ScriptedUpstreamClient {
    tools: Vec<Tool>,
    calls: Mutex<Vec<(String, Option<JsonObject>)>>,
}

impl ScriptedUpstreamClient {
    fn new(tool_specs: &[(&str, &str)]) -> Arc<Self> {
        let tools = tool_specs
            .iter()
            .map(|(name, description)| Tool {
                name: name.to_string().into(),
                title: None,
                description: Some(description.to_string().into()),
                input_schema: Arc::new(json!({"type": "object"}).as_object().cloned().unwrap()),
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

    fn calls(&self) -> Vec<(String, Option<JsonObject>)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl UpstreamClient for ScriptedUpstreamClient {
    async fn list_tools(&self) -> Result<Vec<Tool>> {
        Ok(self.tools.clone())
    }

    async fn call_tool(&self, name: &str, arguments: Option<JsonObject>) -> Result<CallToolResult> {
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

struct ScriptedConnector {
    clients: Mutex<HashMap<String, Arc<ScriptedUpstreamClient>>>,
}

impl ScriptedConnector {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            clients: Mutex::new(HashMap::new()),
        })
    }

    fn register(&self, server_name: &str, client: Arc<ScriptedUpstreamClient>) {
        self.clients.lock().insert(server_name.to_string(), client);
    }

    fn client(&self, server_name: &str) -> Arc<ScriptedUpstreamClient> {
        self.clients.lock().get(server_name).cloned().unwrap()
    }
}

#[async_trait]
impl UpstreamConnector for ScriptedConnector {
    async fn connect(&self, server: &McpServer) -> Result<Arc<dyn UpstreamClient>> {
        self.clients
            .lock()
            .get(&server.name)
            .cloned()
            .map(|c| c as Arc<dyn UpstreamClient>)
            .ok_or_else(|| GatewayError::UpstreamTransient(format!("no fake for {}", server.name)))
    }
}

struct ScriptedChat {
    responses: Mutex<std::collections::VecDeque<Value>>,
}

impl ScriptedChat {
    fn new(responses: Vec<Value>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
        })
    }
}

#[async_trait]
impl ChatClient for ScriptedChat {
    async fn chat_json(&self, _request: ChatRequest) -> Result<Value> {
        self.responses
            .lock()
            .pop_front()
            .ok_or_else(|| GatewayError::Internal("no scripted response left".into()))
    }
}

struct Fixture {
    ctx: Arc<GatewayContext>,
    connector: Arc<ScriptedConnector>,
    namespace: Namespace,
    alpha: McpServer,
}

async fn fixture(smart_discovery: bool, chat: Option<Arc<dyn ChatClient>>) -> Fixture {
    let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
    let connector = ScriptedConnector::new();
    connector.register(
        "alpha",
        ScriptedUpstreamClient::new(&[
            ("read", "Read a file from disk"),
            ("write", "Write a file to disk"),
        ]),
    );
    connector.register(
        "beta",
        ScriptedUpstreamClient::new(&[("query", "Run a SQL query")]),
    );

    let namespace = Namespace {
        uuid: Uuid::new_v4(),
        name: "dev".into(),
        description: None,
        user_id: None,
        smart_discovery_enabled: smart_discovery,
        smart_discovery_description: None,
        pinned_tools: vec![],
        ask_agent_uuid: None,
    };
    repo.upsert_namespace(namespace.clone()).await.unwrap();

    let mut servers = Vec::new();
    for name in ["alpha", "beta"] {
        let server = McpServer {
            uuid: Uuid::new_v4(),
            name: name.into(),
            transport: TransportConfig::Stdio {
                command: "echo".into(),
                args: vec![],
                env: HashMap::new(),
                inherit_env: false,
            },
            user_id: None,
        };
        repo.upsert_server(server.clone()).await.unwrap();
        repo.add_server_to_namespace(namespace.uuid, server.uuid, MembershipStatus::Active)
            .await
            .unwrap();
        servers.push(server);
    }

    let ctx = GatewayContext::new(
        repo,
        Arc::new(HashEmbedder::new()),
        connector.clone(),
        chat,
        SmartDiscoveryState::new(Duration::from_secs(5), 1_000, Duration::from_secs(3_600)),
    );
    Fixture {
        ctx,
        connector,
        namespace,
        alpha: servers.remove(0),
    }
}

fn attach(fixture: &Fixture) -> NamespaceService {
    NamespaceService::new(
        fixture.ctx.clone(),
        fixture.namespace.uuid,
        &fixture.namespace.name,
        SessionTransport::StreamableHttp,
    )
}

fn listed_names(result: &rmcp::model::ListToolsResult) -> Vec<String> {
    result.tools.iter().map(|t| t.name.to_string()).collect()
}

#[tokio::test]
async fn two_upstreams_merge_and_dispatch_without_discovery() {
    let fixture = fixture(false, None).await;
    let service = attach(&fixture);

    let listed = service.list_tools_merged().await.unwrap();
    assert_eq!(
        listed_names(&listed),
        vec!["alpha__read", "alpha__write", "beta__query"]
    );

    let args = json!({"sql": "SELECT 1"}).as_object().cloned();
    let result = service
        .call_tool_routed(CallRequest {
            name: "beta__query".into(),
            arguments: args.clone(),
        })
        .await
        .unwrap();
    assert_eq!(result.is_error, Some(false));

    let beta_calls = fixture.connector.client("beta").calls();
    assert_eq!(beta_calls.len(), 1);
    assert_eq!(beta_calls[0].0, "query");
    assert_eq!(beta_calls[0].1, args);
    assert!(fixture.connector.client("alpha").calls().is_empty());

    // The session is registered while attached.
    assert_eq!(fixture.ctx.sessions.total(), 1);
    drop(service);
    assert_eq!(fixture.ctx.sessions.total(), 0);
}

#[tokio::test]
async fn overrides_rename_on_list_and_map_back_on_call() {
    let fixture = fixture(false, None).await;

    // Persist the alpha tools and rename alpha__read to fs_read.
    let (tools, _) = fixture
        .ctx
        .repo
        .bulk_upsert_tools(
            fixture.alpha.uuid,
            vec![
                ToolUpsert {
                    name: "read".into(),
                    title: None,
                    description: Some("Read a file from disk".into()),
                    input_schema: json!({"type": "object"}),
                },
                ToolUpsert {
                    name: "write".into(),
                    title: None,
                    description: None,
                    input_schema: json!({"type": "object"}),
                },
            ],
        )
        .await
        .unwrap();
    fixture
        .ctx
        .repo
        .bulk_upsert_tool_memberships(
            fixture.namespace.uuid,
            tools.iter().map(|t| (t.uuid, fixture.alpha.uuid)).collect(),
        )
        .await
        .unwrap();
    fixture
        .ctx
        .repo
        .update_tool_overrides(
            fixture.namespace.uuid,
            tools[0].uuid,
            ToolOverrides {
                name: Some("fs_read".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let service = attach(&fixture);
    let listed = service.list_tools_merged().await.unwrap();
    assert_eq!(
        listed_names(&listed),
        vec!["fs_read", "alpha__write", "beta__query"]
    );

    service
        .call_tool_routed(CallRequest {
            name: "fs_read".into(),
            arguments: None,
        })
        .await
        .unwrap();
    let alpha_calls = fixture.connector.client("alpha").calls();
    assert_eq!(alpha_calls.len(), 1);
    assert_eq!(alpha_calls[0].0, "read", "override maps back to the original");
}

#[tokio::test]
async fn smart_discovery_hides_tools_and_indexes_in_the_background() {
    let fixture = fixture(true, None).await;
    let service = attach(&fixture);

    let listed = service.list_tools_merged().await.unwrap();
    assert_eq!(listed_names(&listed), vec!["metamcp__ask", "metamcp__find"]);

    // Background indexing lands within a bounded delay.
    let mut indexed = 0;
    for _ in 0..100 {
        indexed = fixture.ctx.index.namespace_size(fixture.namespace.uuid);
        if indexed >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(indexed >= 3, "expected >= 3 indexed tools, got {indexed}");
}

#[tokio::test]
async fn find_exposes_tools_for_the_session_and_makes_them_callable() {
    let fixture = fixture(true, None).await;
    let service = attach(&fixture);

    // Populate the index via a listing, then search.
    service.list_tools_merged().await.unwrap();
    for _ in 0..100 {
        if fixture.ctx.index.namespace_size(fixture.namespace.uuid) >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let result = service
        .call_tool_routed(CallRequest {
            name: "metamcp__find".into(),
            arguments: json!({"query": "read a file", "limit": 2})
                .as_object()
                .cloned(),
        })
        .await
        .unwrap();
    assert_eq!(result.is_error, Some(false));
    let payload = result.structured_content.unwrap();
    let found: Vec<&str> = payload["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert!(found.len() <= 2);
    assert!(found.contains(&"alpha__read"), "found: {found:?}");
    assert!(payload["tools"][0]["relevanceScore"].is_number());

    // The next listing for this session includes the discovered tool.
    let listed = service.list_tools_merged().await.unwrap();
    let names = listed_names(&listed);
    assert!(names.contains(&"alpha__read".to_string()), "names: {names:?}");

    // And it is directly callable.
    service
        .call_tool_routed(CallRequest {
            name: "alpha__read".into(),
            arguments: None,
        })
        .await
        .unwrap();
    assert_eq!(fixture.connector.client("alpha").calls()[0].0, "read");
}

#[tokio::test]
async fn find_replaces_the_exposed_set_instead_of_extending_it() {
    let fixture = fixture(true, None).await;
    let service = attach(&fixture);
    service.list_tools_merged().await.unwrap();
    for _ in 0..100 {
        if fixture.ctx.index.namespace_size(fixture.namespace.uuid) >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let find = |query: &str| {
        let service = &service;
        let arguments = json!({"query": query, "limit": 1}).as_object().cloned();
        async move {
            service
                .call_tool_routed(CallRequest {
                    name: "metamcp__find".into(),
                    arguments,
                })
                .await
                .unwrap()
        }
    };

    find("read a file from disk").await;
    let first = fixture
        .ctx
        .discovery_state
        .get_exposed(service.session_id(), fixture.namespace.uuid);

    find("run a sql query").await;
    let second = fixture
        .ctx
        .discovery_state
        .get_exposed(service.session_id(), fixture.namespace.uuid);

    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);
    assert_ne!(first, second, "second find replaced the first result");
}

#[tokio::test]
async fn synthetic_calls_error_when_discovery_is_disabled() {
    let fixture = fixture(false, None).await;
    let service = attach(&fixture);

    let result = service
        .call_tool_routed(CallRequest {
            name: "metamcp__find".into(),
            arguments: json!({"query": "anything"}).as_object().cloned(),
        })
        .await
        .unwrap();
    assert_eq!(result.is_error, Some(true));
}

#[tokio::test]
async fn ask_agent_refuses_denied_tools_but_still_answers() {
    let chat = ScriptedChat::new(vec![
        json!({"toolCalls": [{"name": "alpha__write", "arguments": {"path": "/tmp/x"}}]}),
        json!({"answer": "Writing is not permitted in this namespace."}),
    ]);
    let fixture = fixture(true, Some(chat as Arc<dyn ChatClient>)).await;

    let agent = NamespaceAgent {
        uuid: Uuid::new_v4(),
        namespace_uuid: fixture.namespace.uuid,
        agent_type: "ask".into(),
        name: "helper".into(),
        enabled: true,
        model: "gpt-4o-mini".into(),
        system_prompt: None,
        references: None,
        allowed_tools: vec![],
        denied_tools: vec!["alpha__write".into()],
        max_tool_calls: 1,
        expose_limit: NamespaceAgent::DEFAULT_EXPOSE_LIMIT,
    };
    fixture.ctx.repo.upsert_agent(agent.clone()).await.unwrap();
    fixture
        .ctx
        .repo
        .set_active_ask_agent(fixture.namespace.uuid, Some(agent.uuid))
        .await
        .unwrap();

    let service = attach(&fixture);
    let result = service
        .call_tool_routed(CallRequest {
            name: "metamcp__ask".into(),
            arguments: json!({"query": "write a file"}).as_object().cloned(),
        })
        .await
        .unwrap();
    assert_eq!(result.is_error, Some(false));

    let payload = result.structured_content.unwrap();
    let executed = payload["toolCallsExecuted"].as_array().unwrap();
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0]["ok"], json!(false));
    assert!(executed[0]["reason"]
        .as_str()
        .unwrap()
        .contains("not allowed"));
    assert_eq!(
        payload["answer"],
        json!("Writing is not permitted in this namespace.")
    );
    assert!(
        fixture.connector.client("alpha").calls().is_empty(),
        "denied call never reached the upstream"
    );
}

#[tokio::test]
async fn disconnect_clears_session_scoped_state() {
    let fixture = fixture(true, None).await;
    let service = attach(&fixture);
    service.list_tools_merged().await.unwrap();
    for _ in 0..100 {
        if fixture.ctx.index.namespace_size(fixture.namespace.uuid) >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    service
        .call_tool_routed(CallRequest {
            name: "metamcp__find".into(),
            arguments: json!({"query": "read a file"}).as_object().cloned(),
        })
        .await
        .unwrap();
    let session_id = service.session_id().to_string();
    assert!(!fixture
        .ctx
        .discovery_state
        .get_exposed(&session_id, fixture.namespace.uuid)
        .is_empty());

    drop(service);
    assert!(fixture
        .ctx
        .discovery_state
        .get_exposed(&session_id, fixture.namespace.uuid)
        .is_empty());
    assert_eq!(fixture.ctx.sessions.total(), 0);
}
