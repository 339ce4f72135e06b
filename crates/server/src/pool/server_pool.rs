//! Per-server upstream client pool.
//!
//! One connected MCP client per upstream server in use, shared by every
//! namespace that includes the server and refcounted accordingly. Connects
//! retry transient transport failures with bounded exponential backoff;
//! `tools/call` is never retried here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rmcp::model::{CallToolRequestParam, CallToolResult, JsonObject, Tool};
use rmcp::service::{serve_client, Peer, RunningService, ServiceError};
use rmcp::transport::{
    sse_client::SseClientConfig, streamable_http_client::StreamableHttpClientTransportConfig,
    ConfigureCommandExt, SseClientTransport, StreamableHttpClientTransport, TokioChildProcess,
};
use rmcp::RoleClient;
use tracing::{debug, info, warn};
use uuid::Uuid;

use metamcp_core::{GatewayError, McpServer, Result, TransportConfig};

const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_BACKOFF: Duration = Duration::from_millis(250);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A live MCP client session against one upstream server.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<Tool>>;
    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<CallToolResult>;
    /// Close the session. Idempotent.
    async fn close(&self);
}

/// Establishes upstream sessions. Tests swap in fakes so the pool never
/// spawns real subprocesses or sockets.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect(&self, server: &McpServer) -> Result<Arc<dyn UpstreamClient>>;
}

fn call_error(server: &str, err: ServiceError) -> GatewayError {
    match err {
        ServiceError::McpError(data) => {
            GatewayError::UpstreamFatal(format!("{server}: {}", data.message))
        }
        other => GatewayError::UpstreamTransient(format!("{server}: {other}")),
    }
}

struct RmcpUpstreamClient {
    server_name: String,
    peer: Peer<RoleClient>,
    service: tokio::sync::Mutex<Option<RunningService<RoleClient, ()>>>,
}

#[async_trait]
impl UpstreamClient for RmcpUpstreamClient {
    async fn list_tools(&self) -> Result<Vec<Tool>> {
        self.peer
            .list_all_tools()
            .await
            .map_err(|e| call_error(&self.server_name, e))
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<CallToolResult> {
        self.peer
            .call_tool(CallToolRequestParam {
                name: name.to_string().into(),
                arguments,
            })
            .await
            .map_err(|e| call_error(&self.server_name, e))
    }

    async fn close(&self) {
        if let Some(service) = self.service.lock().await.take() {
            if let Err(err) = service.cancel().await {
                warn!(
                    target: "metamcp::pool",
                    server = %self.server_name,
                    error = %err,
                    "error closing upstream client"
                );
            }
        }
    }
}

fn build_http_client(
    bearer_token: Option<&str>,
    headers: &HashMap<String, String>,
) -> Result<reqwest::Client> {
    let mut header_map = reqwest::header::HeaderMap::new();
    if let Some(token) = bearer_token {
        header_map.insert(
            reqwest::header::AUTHORIZATION,
            format!("Bearer {token}")
                .parse()
                .map_err(|e| GatewayError::Validation(format!("bearer token: {e}")))?,
        );
    }
    for (key, value) in headers {
        header_map.insert(
            reqwest::header::HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| GatewayError::Validation(format!("header name '{key}': {e}")))?,
            value
                .parse()
                .map_err(|e| GatewayError::Validation(format!("header value for '{key}': {e}")))?,
        );
    }

    let mut builder = reqwest::Client::builder().connect_timeout(CONNECT_TIMEOUT);
    if !header_map.is_empty() {
        builder = builder.default_headers(header_map);
    }
    builder
        .build()
        .map_err(|e| GatewayError::Internal(format!("build HTTP client: {e}")))
}

/// Connects real upstreams through rmcp's client transports.
pub struct RmcpConnector;

#[async_trait]
impl UpstreamConnector for RmcpConnector {
    async fn connect(&self, server: &McpServer) -> Result<Arc<dyn UpstreamClient>> {
        let service = match &server.transport {
            TransportConfig::Stdio {
                command,
                args,
                env,
                inherit_env,
            } => {
                let transport = TokioChildProcess::new(
                    tokio::process::Command::new(command).configure(|cmd| {
                        cmd.args(args);
                        if !inherit_env {
                            cmd.env_clear();
                        }
                        cmd.envs(env.iter());
                        cmd.stderr(std::process::Stdio::inherit());
                    }),
                )
                .map_err(|e| {
                    GatewayError::UpstreamTransient(format!(
                        "{}: spawn stdio transport: {e}",
                        server.name
                    ))
                })?;
                serve_client((), transport).await.map_err(|e| {
                    GatewayError::UpstreamTransient(format!(
                        "{}: initialize stdio client: {e}",
                        server.name
                    ))
                })?
            }
            TransportConfig::Sse {
                url,
                bearer_token,
                headers,
            } => {
                let http_client = build_http_client(bearer_token.as_deref(), headers)?;
                let transport = SseClientTransport::start_with_client(
                    http_client,
                    SseClientConfig {
                        sse_endpoint: url.clone().into(),
                        ..Default::default()
                    },
                )
                .await
                .map_err(|e| {
                    GatewayError::UpstreamTransient(format!(
                        "{}: create SSE transport: {e}",
                        server.name
                    ))
                })?;
                serve_client((), transport).await.map_err(|e| {
                    GatewayError::UpstreamTransient(format!(
                        "{}: initialize SSE client: {e}",
                        server.name
                    ))
                })?
            }
            TransportConfig::StreamableHttp {
                url,
                bearer_token,
                headers,
            } => {
                let http_client = build_http_client(bearer_token.as_deref(), headers)?;
                let transport = StreamableHttpClientTransport::with_client(
                    http_client,
                    StreamableHttpClientTransportConfig::with_uri(url.as_str()),
                );
                serve_client((), transport).await.map_err(|e| {
                    GatewayError::UpstreamTransient(format!(
                        "{}: initialize streamable client: {e}",
                        server.name
                    ))
                })?
            }
        };

        let peer = service.peer().clone();
        Ok(Arc::new(RmcpUpstreamClient {
            server_name: server.name.clone(),
            peer,
            service: tokio::sync::Mutex::new(Some(service)),
        }))
    }
}

struct ServerSlot {
    client: Arc<dyn UpstreamClient>,
    refcount: usize,
}

/// Refcounted pool of upstream clients, keyed by server uuid.
pub struct McpServerPool {
    connector: Arc<dyn UpstreamConnector>,
    slots: Mutex<HashMap<Uuid, ServerSlot>>,
    /// Serializes connects per server so concurrent attaches share one
    /// session instead of racing.
    connect_locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl McpServerPool {
    pub fn new(connector: Arc<dyn UpstreamConnector>) -> Self {
        Self {
            connector,
            slots: Mutex::new(HashMap::new()),
            connect_locks: Mutex::new(HashMap::new()),
        }
    }

    fn connect_lock(&self, server_uuid: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.connect_locks
            .lock()
            .entry(server_uuid)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Borrow (or establish) the client for `server`, bumping its refcount.
    /// Every successful acquire must be paired with a [`Self::release`].
    pub async fn acquire(&self, server: &McpServer) -> Result<Arc<dyn UpstreamClient>> {
        let lock = self.connect_lock(server.uuid);
        let _guard = lock.lock().await;

        if let Some(slot) = self.slots.lock().get_mut(&server.uuid) {
            slot.refcount += 1;
            return Ok(slot.client.clone());
        }

        let client = self.connect_with_backoff(server).await?;
        self.slots.lock().insert(
            server.uuid,
            ServerSlot {
                client: client.clone(),
                refcount: 1,
            },
        );
        info!(
            target: "metamcp::pool",
            server = %server.name,
            transport = server.transport.kind().label(),
            "upstream connected"
        );
        Ok(client)
    }

    async fn connect_with_backoff(&self, server: &McpServer) -> Result<Arc<dyn UpstreamClient>> {
        let mut delay = CONNECT_BACKOFF;
        let mut attempt = 1;
        loop {
            match self.connector.connect(server).await {
                Ok(client) => return Ok(client),
                Err(err) if err.is_transient() && attempt < CONNECT_ATTEMPTS => {
                    warn!(
                        target: "metamcp::pool",
                        server = %server.name,
                        attempt,
                        error = %err,
                        "upstream connect failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Drop one reference. The session closes when the last reference goes.
    pub fn release(&self, server_uuid: Uuid) {
        let client = {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(&server_uuid) else {
                return;
            };
            slot.refcount = slot.refcount.saturating_sub(1);
            if slot.refcount > 0 {
                return;
            }
            slots.remove(&server_uuid).map(|s| s.client)
        };
        if let Some(client) = client {
            debug!(
                target: "metamcp::pool",
                server = %server_uuid,
                "last reference released, closing upstream"
            );
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { client.close().await });
            }
        }
    }

    /// Uuids of currently connected servers.
    pub fn connected_servers(&self) -> Vec<Uuid> {
        let mut servers: Vec<Uuid> = self.slots.lock().keys().copied().collect();
        servers.sort();
        servers
    }

    #[cfg(test)]
    fn refcount(&self, server_uuid: Uuid) -> usize {
        self.slots
            .lock()
            .get(&server_uuid)
            .map(|s| s.refcount)
            .unwrap_or(0)
    }
}
