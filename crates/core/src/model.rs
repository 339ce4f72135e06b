//! Gateway entities.
//!
//! These are plain data records: the control plane creates and mutates them
//! through the [`crate::repo::Repository`] port, the gateway runtime reads
//! them. JSON-valued fields (`input_schema`, `override_annotations`,
//! `references`) stay opaque; the core only inspects the keys it needs.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

/// Launch parameters for an upstream MCP server, one variant per transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Subprocess speaking MCP over stdin/stdout.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        /// Extra environment variables. The child only inherits the parent
        /// environment when this is explicitly configured to do so.
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        inherit_env: bool,
    },
    /// Remote server over the legacy SSE transport.
    Sse {
        url: String,
        #[serde(default)]
        bearer_token: Option<String>,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    /// Remote server over Streamable HTTP.
    StreamableHttp {
        url: String,
        #[serde(default)]
        bearer_token: Option<String>,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

impl TransportConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportConfig::Stdio { .. } => TransportKind::Stdio,
            TransportConfig::Sse { .. } => TransportKind::Sse,
            TransportConfig::StreamableHttp { .. } => TransportKind::StreamableHttp,
        }
    }
}

/// Upstream transport kind, without launch parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransportKind {
    Stdio,
    Sse,
    StreamableHttp,
}

impl TransportKind {
    /// Stable label for logs and status payloads.
    pub fn label(&self) -> &'static str {
        match self {
            TransportKind::Stdio => "STDIO",
            TransportKind::Sse => "SSE",
            TransportKind::StreamableHttp => "STREAMABLE_HTTP",
        }
    }
}

/// Transport a downstream client attached over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionTransport {
    Sse,
    StreamableHttp,
}

impl SessionTransport {
    pub fn label(&self) -> &'static str {
        match self {
            SessionTransport::Sse => "SSE",
            SessionTransport::StreamableHttp => "StreamableHTTP",
        }
    }
}

/// An upstream MCP server definition.
///
/// `name` is unique per owner, which makes full tool names
/// (`serverName__toolName`) unique within any namespace the server joins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServer {
    pub uuid: Uuid,
    pub name: String,
    pub transport: TransportConfig,
    /// Owner; `None` means the server is public.
    pub user_id: Option<Uuid>,
}

impl McpServer {
    pub fn is_public(&self) -> bool {
        self.user_id.is_none()
    }
}

/// A logical grouping of upstream servers exposed as one MCP endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Namespace {
    pub uuid: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Owner; `None` means the namespace is public. Public namespaces must
    /// contain only public servers.
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub smart_discovery_enabled: bool,
    #[serde(default)]
    pub smart_discovery_description: Option<String>,
    /// Full tool names always exposed, even under smart discovery.
    #[serde(default)]
    pub pinned_tools: Vec<String>,
    /// Active ask agent, if one is configured.
    #[serde(default)]
    pub ask_agent_uuid: Option<Uuid>,
}

/// Whether a membership participates in aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MembershipStatus {
    Active,
    Inactive,
}

/// Membership of a server in a namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceServerMembership {
    pub namespace_uuid: Uuid,
    pub server_uuid: Uuid,
    pub status: MembershipStatus,
}

/// A tool as last reported by its upstream server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRecord {
    pub uuid: Uuid,
    pub server_uuid: Uuid,
    /// Unique within its server.
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// JSON Schema object, kept opaque.
    pub input_schema: Value,
}

impl ToolRecord {
    /// Stable hash over the fields the discovery index embeds. Unchanged
    /// hash means the cached embedding is still valid.
    pub fn content_hash(&self) -> String {
        crate::names::content_hash(&self.name, self.title.as_deref(), self.description.as_deref())
    }
}

/// Per-namespace presentation overrides for a tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOverrides {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub annotations: Option<Value>,
}

impl ToolOverrides {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.title.is_none()
            && self.description.is_none()
            && self.annotations.is_none()
    }
}

/// Membership of a tool in a namespace, with optional overrides.
///
/// `overrides.name` is unique per namespace; the repository enforces this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceToolMembership {
    pub namespace_uuid: Uuid,
    pub tool_uuid: Uuid,
    pub server_uuid: Uuid,
    pub status: MembershipStatus,
    #[serde(default)]
    pub overrides: ToolOverrides,
}

/// Configuration of a namespace's ask agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceAgent {
    pub uuid: Uuid,
    pub namespace_uuid: Uuid,
    /// Currently always `"ask"`.
    pub agent_type: String,
    pub name: String,
    pub enabled: bool,
    /// Chat model identifier, also used for token accounting.
    pub model: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Free-form JSON handed to the planner; only `ragDocuments` is
    /// interpreted by the core.
    #[serde(default)]
    pub references: Option<Value>,
    /// Full tool names the agent may call. Empty means "anything not denied".
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Full tool names the agent must never call.
    #[serde(default)]
    pub denied_tools: Vec<String>,
    /// Default number of tool calls per run; clamped to 20 at call time.
    pub max_tool_calls: u32,
    /// Default number of tools exposed back to the session; clamped to 50.
    pub expose_limit: u32,
}

impl NamespaceAgent {
    pub const DEFAULT_MAX_TOOL_CALLS: u32 = 3;
    pub const DEFAULT_EXPOSE_LIMIT: u32 = 5;
}

/// A reference document attached to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDocument {
    pub uuid: Uuid,
    pub agent_uuid: Uuid,
    pub filename: String,
    pub mime: String,
    pub content: String,
    /// Counted with the agent's model at insert time.
    pub token_count: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A downstream client currently attached to a namespace endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveSession {
    pub session_id: String,
    pub endpoint_name: String,
    pub namespace_uuid: Uuid,
    pub transport: SessionTransport,
}

/// Package manager handled by the optional install helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Npm,
    Apt,
    Pip,
    Uv,
}

impl PackageManager {
    pub fn label(&self) -> &'static str {
        match self {
            PackageManager::Npm => "npm",
            PackageManager::Apt => "apt",
            PackageManager::Pip => "pip",
            PackageManager::Uv => "uv",
        }
    }
}

/// Append-only audit row for the install helper. Write path only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageInstallRecord {
    pub uuid: Uuid,
    pub manager: PackageManager,
    pub package_name: String,
    pub command: String,
    pub output: String,
    pub success: bool,
    pub user_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}
