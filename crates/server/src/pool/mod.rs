//! Upstream connection pooling.
//!
//! Two layers: [`server_pool::McpServerPool`] keeps one connected MCP client
//! per upstream server, refcounted across namespaces;
//! [`namespace_pool::NamespacePool`] keeps one idle composed session per
//! namespace plus the active sessions handed to downstream clients.

pub mod namespace_pool;
pub mod server_pool;

pub use namespace_pool::{NamespacePool, NamespaceSession, PoolStatus};
pub use server_pool::{
    McpServerPool, RmcpConnector, UpstreamClient, UpstreamConnector,
};
