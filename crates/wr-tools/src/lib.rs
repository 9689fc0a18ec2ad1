//! Tool-server lifecycle: JSON-RPC 2.0 over newline-delimited stdio,
//! grant-filtered discovery, request/response multiplexing, and
//! termination with kill escalation.

pub mod http;
pub mod jsonrpc;
pub mod manager;
pub mod server;

pub use http::HttpToolServer;
pub use jsonrpc::{McpTool, ToolCallResult, PROTOCOL_VERSION};
pub use manager::{AdvertisedTool, ToolServerManager};
pub use server::{ToolServer, ToolServerError};
