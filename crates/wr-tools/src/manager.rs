use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};

use wr_core::secrets::{EnvSecrets, SecretsProvider};
use wr_core::types::{CapabilitiesConfig, ToolTransport};

use crate::http::HttpToolServer;
use crate::jsonrpc::{McpTool, ToolCallResult};
use crate::server::{Result, ToolServer, ToolServerError};

/// Grace given to a server between SIGTERM and SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(5);
/// Handshake budget per server.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);

// ---------------------------------------------------------------------------
// AdvertisedTool
// ---------------------------------------------------------------------------

/// A tool offered to the agent loop, qualified by its owning server.
#[derive(Debug, Clone)]
pub struct AdvertisedTool {
    /// `tool-server-{server}.{tool}` — the name the LLM calls.
    pub qualified_name: String,
    pub server: String,
    pub tool: McpTool,
    /// False for static fallback descriptors whose server never started;
    /// calling one yields an error tool-result.
    pub available: bool,
}

// ---------------------------------------------------------------------------
// ToolServerManager
// ---------------------------------------------------------------------------

/// One live connection, whichever transport the spec asked for.
enum ServerConn {
    Stdio(ToolServer),
    Http(HttpToolServer),
}

impl ServerConn {
    async fn initialize(&self, timeout: Duration) -> Result<()> {
        match self {
            ServerConn::Stdio(s) => s.initialize(timeout).await.map(|_| ()),
            ServerConn::Http(s) => s.initialize(timeout).await.map(|_| ()),
        }
    }

    async fn list_tools(&self, timeout: Duration) -> Result<Vec<McpTool>> {
        match self {
            ServerConn::Stdio(s) => s.list_tools(timeout).await,
            ServerConn::Http(s) => s.list_tools(timeout).await,
        }
    }

    async fn call_tool(
        &self,
        tool: &str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> Result<ToolCallResult> {
        match self {
            ServerConn::Stdio(s) => s.call_tool(tool, arguments, timeout).await,
            ServerConn::Http(s) => s.call_tool(tool, arguments, timeout).await,
        }
    }

    async fn shutdown(&self, grace: Duration) {
        if let ServerConn::Stdio(s) = self {
            s.shutdown(grace).await;
        }
    }
}

/// Per-activation lifecycle of tool-server connections.
///
/// `start_servers` launches every server from the agent's capabilities
/// whose required grants are all held, handshakes, and collects the
/// advertised tools. `stop_servers` must run on every exit path; the
/// runner wraps the manager in a scope whose cleanup always calls it
/// (child processes additionally die with the runner via kill-on-drop).
pub struct ToolServerManager {
    servers: HashMap<String, ServerConn>,
    not_started: Vec<String>,
    tools: Vec<AdvertisedTool>,
    call_timeout: Duration,
}

impl ToolServerManager {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            servers: HashMap::new(),
            not_started: Vec::new(),
            tools: Vec::new(),
            call_timeout,
        }
    }

    /// The name the agent loop and LLM use for a server tool.
    pub fn qualified_name(server: &str, tool: &str) -> String {
        format!("tool-server-{server}.{tool}")
    }

    /// Launch grant-eligible servers and discover their tools.
    ///
    /// A server that fails to spawn or handshake is recorded in
    /// `not_started`; its static fallback descriptors (if any) are still
    /// advertised so the agent can see what exists, but marked
    /// unavailable. Credentials resolve through the secrets provider and
    /// are placed in the child environment only, never logged.
    pub async fn start_servers(
        &mut self,
        capabilities: &CapabilitiesConfig,
        secrets: &dyn SecretsProvider,
        workspace: &Path,
    ) {
        for spec in &capabilities.tool_servers {
            let missing: Vec<&String> = spec
                .required_grants
                .iter()
                .filter(|g| !capabilities.has_grant(g))
                .collect();
            if !missing.is_empty() {
                info!(
                    server = %spec.name,
                    missing = ?missing,
                    "tool server skipped, grants not held"
                );
                continue;
            }

            let mut env = HashMap::new();
            for grant in &spec.required_grants {
                if let Some(value) = secrets.get(grant) {
                    env.insert(EnvSecrets::var_name(grant), value);
                }
            }

            match self.launch(spec.name.clone(), &spec.transport, &env, workspace) {
                Ok(server) => match self.handshake(&server).await {
                    Ok(tools) => {
                        info!(
                            server = %spec.name,
                            tool_count = tools.len(),
                            event = "tool_server_started",
                            "tool server started"
                        );
                        for tool in tools {
                            self.tools.push(AdvertisedTool {
                                qualified_name: Self::qualified_name(&spec.name, &tool.name),
                                server: spec.name.clone(),
                                tool,
                                available: true,
                            });
                        }
                        self.servers.insert(spec.name.clone(), server);
                    }
                    Err(e) => {
                        warn!(
                            server = %spec.name,
                            error = %e,
                            event = "tool_server_failed",
                            "tool server handshake failed"
                        );
                        server.shutdown(STOP_GRACE).await;
                        self.record_not_started(spec.name.clone(), &spec.fallback_tools);
                    }
                },
                Err(e) => {
                    warn!(
                        server = %spec.name,
                        error = %e,
                        event = "tool_server_failed",
                        "tool server failed to start"
                    );
                    self.record_not_started(spec.name.clone(), &spec.fallback_tools);
                }
            }
        }
    }

    fn launch(
        &self,
        name: String,
        transport: &ToolTransport,
        env: &HashMap<String, String>,
        workspace: &Path,
    ) -> Result<ServerConn> {
        match transport {
            ToolTransport::Stdio { command, args } => {
                ToolServer::spawn(name, command, args, env, workspace).map(ServerConn::Stdio)
            }
            ToolTransport::Http { url } => {
                HttpToolServer::new(name, url.clone()).map(ServerConn::Http)
            }
        }
    }

    async fn handshake(&self, server: &ServerConn) -> Result<Vec<McpTool>> {
        server.initialize(HANDSHAKE_TIMEOUT).await?;
        server.list_tools(HANDSHAKE_TIMEOUT).await
    }

    fn record_not_started(&mut self, name: String, fallbacks: &[wr_core::types::FallbackTool]) {
        for fb in fallbacks {
            self.tools.push(AdvertisedTool {
                qualified_name: Self::qualified_name(&name, &fb.name),
                server: name.clone(),
                tool: McpTool {
                    name: fb.name.clone(),
                    description: fb.description.clone(),
                    input_schema: serde_json::json!({ "type": "object" }),
                },
                available: false,
            });
        }
        self.not_started.push(name);
    }

    /// Tools to advertise to the LLM, including unavailable fallbacks.
    pub fn advertised_tools(&self) -> &[AdvertisedTool] {
        &self.tools
    }

    /// Servers that were eligible but never came up.
    pub fn not_started(&self) -> &[String] {
        &self.not_started
    }

    pub fn running_count(&self) -> usize {
        self.servers.len()
    }

    /// Invoke a tool on a running server.
    pub async fn call(
        &self,
        server_name: &str,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolCallResult> {
        let server = self
            .servers
            .get(server_name)
            .ok_or_else(|| ToolServerError::NotRunning(server_name.to_string()))?;
        server
            .call_tool(tool_name, arguments, self.call_timeout)
            .await
    }

    /// Terminate every running server: signal, wait up to 5 s, force-kill.
    pub async fn stop_servers(&mut self) {
        for (name, server) in self.servers.drain() {
            info!(server = %name, "stopping tool server");
            server.shutdown(STOP_GRACE).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
