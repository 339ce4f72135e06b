//! Per-session MCP service.
//!
//! One `NamespaceService` is created per downstream transport session. It
//! registers itself in the live-session registry on construction, lazily
//! checks a composed session out of the pool on first use, and tears its
//! state down on drop (registry entry, smart-discovery exposure, pool entry).

use std::sync::Arc;

use rmcp::model::{
    CallToolRequestParam, CallToolResult, ListToolsResult, PaginatedRequestParam,
    ServerCapabilities, ServerInfo,
};
use rmcp::{ErrorData, ServerHandler};
use tracing::debug;
use uuid::Uuid;

use metamcp_agent::{AskAgentRunner, ExposureSink, ToolExecutor};
use metamcp_core::{GatewayError, LiveSession, Result, SessionTransport};

use crate::aggregator::{AggregatorCallHandler, AggregatorListHandler, SessionExecutor};
use crate::context::GatewayContext;
use crate::middleware::{CallRequest, RequestContext, ToolPipeline};
use crate::overrides::ToolOverridesLayer;
use crate::smart_discovery::SmartDiscoveryLayer;

struct SessionBundle {
    pipeline: ToolPipeline,
    executor: Arc<dyn ToolExecutor>,
}

/// MCP server handler bound to one namespace and one downstream session.
pub struct NamespaceService {
    ctx: Arc<GatewayContext>,
    namespace_uuid: Uuid,
    endpoint: String,
    session_id: String,
    bundle: tokio::sync::OnceCell<SessionBundle>,
}

impl NamespaceService {
    pub fn new(
        ctx: Arc<GatewayContext>,
        namespace_uuid: Uuid,
        endpoint: &str,
        transport: SessionTransport,
    ) -> Self {
        let session_id = Uuid::new_v4().to_string();
        ctx.sessions.add(LiveSession {
            session_id: session_id.clone(),
            endpoint_name: endpoint.to_string(),
            namespace_uuid,
            transport,
        });
        Self {
            ctx,
            namespace_uuid,
            endpoint: endpoint.to_string(),
            session_id,
            bundle: tokio::sync::OnceCell::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn bundle(&self) -> Result<&SessionBundle> {
        self.bundle
            .get_or_try_init(|| async {
                let session = self
                    .ctx
                    .namespace_pool
                    .checkout(self.namespace_uuid, &self.session_id)
                    .await?;

                let executor: Arc<dyn ToolExecutor> =
                    Arc::new(SessionExecutor::new(session.clone()));
                let runner = Arc::new(AskAgentRunner::new(
                    self.ctx.index.clone(),
                    self.ctx.tokens.clone(),
                    self.ctx.chat.clone(),
                    executor.clone(),
                    self.ctx.discovery_state.clone() as Arc<dyn ExposureSink>,
                ));
                let discovery = Arc::new(SmartDiscoveryLayer::new(
                    self.ctx.repo.clone(),
                    self.ctx.index.clone(),
                    self.ctx.discovery_state.clone(),
                    runner,
                ));
                let overrides = Arc::new(ToolOverridesLayer::new(self.ctx.overrides.clone()));

                // Outer to inner: smart discovery, then overrides, then the
                // aggregator base.
                let pipeline = ToolPipeline::new(
                    Arc::new(AggregatorListHandler::new(
                        session.clone(),
                        self.ctx.repo.clone(),
                    )),
                    Arc::new(AggregatorCallHandler::new(session)),
                )
                .with_list_layer(discovery.clone())
                .with_call_layer(discovery)
                .with_list_layer(overrides.clone())
                .with_call_layer(overrides);

                Ok(SessionBundle { pipeline, executor })
            })
            .await
    }

    fn request_context(&self, bundle: &SessionBundle) -> RequestContext {
        RequestContext {
            namespace_uuid: self.namespace_uuid,
            session_id: self.session_id.clone(),
            executor: bundle.executor.clone(),
        }
    }

    /// List tools through the middleware chain.
    pub async fn list_tools_merged(&self) -> Result<ListToolsResult> {
        let bundle = self.bundle().await?;
        let ctx = self.request_context(bundle);
        let tools = bundle.pipeline.list_tools(&ctx).await?;
        Ok(ListToolsResult {
            tools: tools.into_iter().map(|t| t.display).collect(),
            next_cursor: None,
        })
    }

    /// Dispatch a call through the middleware chain.
    pub async fn call_tool_routed(&self, request: CallRequest) -> Result<CallToolResult> {
        let bundle = self.bundle().await?;
        let ctx = self.request_context(bundle);
        bundle.pipeline.call_tool(&ctx, request).await
    }
}

impl Drop for NamespaceService {
    fn drop(&mut self) {
        debug!(
            target: "metamcp::service",
            session_id = %self.session_id,
            endpoint = %self.endpoint,
            "downstream session closed"
        );
        self.ctx.sessions.remove(&self.session_id);
        self.ctx.discovery_state.remove_session(&self.session_id);
        self.ctx.namespace_pool.release_session(&self.session_id);
    }
}

fn error_data(err: GatewayError) -> ErrorData {
    match &err {
        GatewayError::Validation(_) | GatewayError::NotFound(_) => {
            ErrorData::invalid_params(err.to_string(), None)
        }
        _ => ErrorData::internal_error(err.to_string(), None),
    }
}

impl ServerHandler for NamespaceService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            instructions: Some(format!(
                "MetaMCP namespace endpoint '{}'. Call tools/list to see what is available.",
                self.endpoint
            )),
            ..Default::default()
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> impl std::future::Future<Output = std::result::Result<ListToolsResult, ErrorData>> + Send + '_
    {
        Box::pin(async move { self.list_tools_merged().await.map_err(error_data) })
    }

    fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> impl std::future::Future<Output = std::result::Result<CallToolResult, ErrorData>> + Send + '_
    {
        Box::pin(async move {
            self.call_tool_routed(CallRequest {
                name: request.name.to_string(),
                arguments: request.arguments,
            })
            .await
            .map_err(error_data)
        })
    }
}
