//! Ask-agent orchestration.
//!
//! An ask agent answers a free-form query about a namespace by planning with
//! an external chat model, executing a bounded number of upstream tool calls
//! under an allow/deny policy, and reporting back with a curated set of tools
//! to expose into the calling session.

pub mod llm;
pub mod orchestrator;
pub mod policy;

pub use llm::{ChatClient, ChatRequest, OpenAiChatClient};
pub use orchestrator::{
    AskAgentRunner, AskContext, AskOutcome, AskParams, ExecutedToolCall, ExposureSink,
    TokenBreakdown, ToolExecutor, MAX_EXPOSE_CAP, MAX_TOOL_CALL_CAP, SHORTLIST_LIMIT,
    TOOL_RESULT_MAX_CHARS,
};
pub use policy::ToolPolicy;
