//! The per-agent agentic loop: reason → tool → observe → respond, with
//! iteration/time/token budgets, tagged tool dispatch, and auto approval
//! policies.

pub mod activation;
pub mod approval;
pub mod context;
pub mod dispatch;
pub mod provider;

pub use activation::{AgentLoop, LoopLimits};
pub use approval::{ApprovalPolicy, AutoApprover};
pub use dispatch::{BuiltinTool, ToolDispatch, ToolRegistry};
pub use provider::{
    AnthropicProvider, ChatMessage, ChatRequest, ChatResponse, LlmProvider, ProviderError,
    ScriptedProvider, ToolCall, ToolSpec,
};
