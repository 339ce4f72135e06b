//! Core domain model for the MetaMCP gateway.
//!
//! This crate holds the entities shared across the workspace (namespaces,
//! upstream server definitions, tool records, agents), the gateway-wide error
//! taxonomy, the `serverName__toolName` codec, the per-model token counter,
//! and the persistence port the control plane implements.
//!
//! Nothing in here speaks MCP or HTTP; protocol concerns live in
//! `metamcp-server`.

pub mod error;
pub mod model;
pub mod names;
pub mod repo;
pub mod tokens;

pub use error::{GatewayError, Result};
pub use model::{
    AgentDocument, LiveSession, McpServer, MembershipStatus, Namespace, NamespaceAgent,
    NamespaceServerMembership, NamespaceToolMembership, PackageInstallRecord, PackageManager,
    SessionTransport, ToolOverrides, ToolRecord, TransportConfig, TransportKind,
};
pub use names::{
    content_hash, full_tool_name, is_synthetic_tool, split_tool_name, ASK_TOOL_NAME,
    FIND_TOOL_NAME, TOOL_SEPARATOR,
};
pub use repo::{MemoryRepository, Repository, ToolUpsert};
pub use tokens::{TokenCounter, AGENT_TOKEN_BUDGET};
