//! List/call middleware pipeline.
//!
//! Two parallel chains wrap the aggregator base handlers: one for
//! `tools/list`, one for `tools/call`. Layers are ordered outermost first;
//! each receives the shared [`RequestContext`] and a [`ListNext`]/[`CallNext`]
//! continuation. The canonical full tool name travels unchanged through the
//! list chain inside [`AggregatedTool`]; layers only rewrite the display
//! surface.

use std::sync::Arc;

use async_trait::async_trait;
use rmcp::model::{CallToolResult, JsonObject};
use uuid::Uuid;

use metamcp_agent::ToolExecutor;
use metamcp_core::Result;

use crate::aggregator::AggregatedTool;

/// Shared per-request context.
pub struct RequestContext {
    pub namespace_uuid: Uuid,
    pub session_id: String,
    /// Upstream call executor, for layers that invoke tools themselves
    /// (the ask agent does).
    pub executor: Arc<dyn ToolExecutor>,
}

/// One incoming `tools/call`.
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub name: String,
    pub arguments: Option<JsonObject>,
}

#[async_trait]
pub trait ListToolsHandler: Send + Sync {
    async fn list_tools(&self, ctx: &RequestContext) -> Result<Vec<AggregatedTool>>;
}

#[async_trait]
pub trait ListToolsLayer: Send + Sync {
    async fn handle(
        &self,
        ctx: &RequestContext,
        next: ListNext<'_>,
    ) -> Result<Vec<AggregatedTool>>;
}

/// Continuation over the remaining list layers.
pub struct ListNext<'a> {
    layers: &'a [Arc<dyn ListToolsLayer>],
    base: &'a dyn ListToolsHandler,
}

impl ListNext<'_> {
    pub async fn run(self, ctx: &RequestContext) -> Result<Vec<AggregatedTool>> {
        match self.layers.split_first() {
            Some((layer, rest)) => {
                layer
                    .handle(
                        ctx,
                        ListNext {
                            layers: rest,
                            base: self.base,
                        },
                    )
                    .await
            }
            None => self.base.list_tools(ctx).await,
        }
    }
}

#[async_trait]
pub trait CallToolHandler: Send + Sync {
    async fn call_tool(&self, ctx: &RequestContext, request: CallRequest)
        -> Result<CallToolResult>;
}

#[async_trait]
pub trait CallToolLayer: Send + Sync {
    async fn handle(
        &self,
        ctx: &RequestContext,
        request: CallRequest,
        next: CallNext<'_>,
    ) -> Result<CallToolResult>;
}

/// Continuation over the remaining call layers.
pub struct CallNext<'a> {
    layers: &'a [Arc<dyn CallToolLayer>],
    base: &'a dyn CallToolHandler,
}

impl CallNext<'_> {
    pub async fn run(self, ctx: &RequestContext, request: CallRequest) -> Result<CallToolResult> {
        match self.layers.split_first() {
            Some((layer, rest)) => {
                layer
                    .handle(
                        ctx,
                        request,
                        CallNext {
                            layers: rest,
                            base: self.base,
                        },
                    )
                    .await
            }
            None => self.base.call_tool(ctx, request).await,
        }
    }
}

/// An assembled pair of chains.
pub struct ToolPipeline {
    list_layers: Vec<Arc<dyn ListToolsLayer>>,
    call_layers: Vec<Arc<dyn CallToolLayer>>,
    base_list: Arc<dyn ListToolsHandler>,
    base_call: Arc<dyn CallToolHandler>,
}

impl ToolPipeline {
    pub fn new(base_list: Arc<dyn ListToolsHandler>, base_call: Arc<dyn CallToolHandler>) -> Self {
        Self {
            list_layers: Vec::new(),
            call_layers: Vec::new(),
            base_list,
            base_call,
        }
    }

    /// Add a list layer. The first layer added is the outermost.
    pub fn with_list_layer(mut self, layer: Arc<dyn ListToolsLayer>) -> Self {
        self.list_layers.push(layer);
        self
    }

    /// Add a call layer. The first layer added is the outermost.
    pub fn with_call_layer(mut self, layer: Arc<dyn CallToolLayer>) -> Self {
        self.call_layers.push(layer);
        self
    }

    pub async fn list_tools(&self, ctx: &RequestContext) -> Result<Vec<AggregatedTool>> {
        ListNext {
            layers: &self.list_layers,
            base: self.base_list.as_ref(),
        }
        .run(ctx)
        .await
    }

    pub async fn call_tool(
        &self,
        ctx: &RequestContext,
        request: CallRequest,
    ) -> Result<CallToolResult> {
        CallNext {
            layers: &self.call_layers,
            base: self.base_call.as_ref(),
        }
        .run(ctx, request)
        .await
    }
}
