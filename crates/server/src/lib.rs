//! MetaMCP gateway runtime.
//!
//! Aggregates upstream MCP servers into namespaces and republishes each
//! namespace as one MCP endpoint over SSE and Streamable HTTP. The pieces:
//!
//! - [`sessions`] - live downstream session registry
//! - [`pool`] - upstream client pool and composed namespace sessions
//! - [`aggregator`] - merged tool registry, dispatch, and tool refresh
//! - [`middleware`] - the list/call pipeline the service runs requests through
//! - [`overrides`] - per-namespace tool renames
//! - [`smart_discovery`] - synthetic `metamcp__find` / `metamcp__ask` layer
//! - [`service`] - the per-session `rmcp::ServerHandler`
//! - [`http_transport`] - axum wiring, auth, TLS, CORS
//! - [`control`] - control-plane entry points and their invalidation fan-out
//! - [`installer`] - gated package-install helper

pub mod aggregator;
pub mod cli;
pub mod config;
pub mod context;
pub mod control;
pub mod http_transport;
pub mod installer;
pub mod middleware;
pub mod overrides;
pub mod pool;
pub mod service;
pub mod sessions;
pub mod smart_discovery;

pub use context::GatewayContext;
