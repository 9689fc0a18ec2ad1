use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::jsonrpc::{
    InitializeResult, JsonRpcRequest, JsonRpcResponse, McpTool, ToolCallResult, ToolsListResult,
    PROTOCOL_VERSION,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ToolServerError {
    #[error("spawn {command}: {message}")]
    Spawn { command: String, message: String },
    #[error("io: {0}")]
    Io(String),
    #[error("request timed out")]
    Timeout,
    #[error("rpc error {code}: {message}")]
    Rpc { code: i32, message: String },
    #[error("server connection closed")]
    Closed,
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("server not running: {0}")]
    NotRunning(String),
}

pub type Result<T> = std::result::Result<T, ToolServerError>;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

// ---------------------------------------------------------------------------
// ToolServer — one running tool-server subprocess
// ---------------------------------------------------------------------------

/// JSON-RPC connection to a tool-server child process over
/// newline-delimited stdin/stdout.
///
/// Request ids are a per-connection monotonic counter; a background task
/// reads stdout and routes responses to waiters by id. Server-initiated
/// requests and notifications are ignored (none are part of the methods
/// the core uses).
pub struct ToolServer {
    name: String,
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    pending: PendingMap,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
}

impl ToolServer {
    /// Spawn the subprocess with the given environment additions and
    /// working directory. Does not handshake; call [`Self::initialize`].
    pub fn spawn(
        name: impl Into<String>,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        workspace: &Path,
    ) -> Result<Self> {
        let name = name.into();
        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .current_dir(workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolServerError::Spawn {
                command: command.to_string(),
                message: e.to_string(),
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ToolServerError::Io("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ToolServerError::Io("child stdout unavailable".into()))?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let reader = tokio::spawn(Self::read_loop(name.clone(), stdout, pending.clone()));

        Ok(Self {
            name,
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            pending,
            next_id: AtomicU64::new(1),
            reader,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn read_loop(
        name: String,
        stdout: tokio::process::ChildStdout,
        pending: PendingMap,
    ) {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<JsonRpcResponse>(line) {
                        Ok(resp) => {
                            let Some(id) = resp.id else {
                                // Server notification; nothing waits on it.
                                continue;
                            };
                            if let Some(tx) = pending.lock().await.remove(&id) {
                                let _ = tx.send(resp);
                            } else {
                                debug!(server = %name, id, "response for unknown request id");
                            }
                        }
                        Err(e) => {
                            debug!(server = %name, error = %e, "unparseable line from server");
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(server = %name, error = %e, "tool server stdout read failed");
                    break;
                }
            }
        }
        // Wake any remaining waiters with a closed channel.
        pending.lock().await.clear();
    }

    async fn write_line(&self, payload: &JsonRpcRequest) -> Result<()> {
        let mut encoded =
            serde_json::to_vec(payload).map_err(|e| ToolServerError::Protocol(e.to_string()))?;
        encoded.push(b'\n');
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(&encoded)
            .await
            .map_err(|e| ToolServerError::Io(e.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|e| ToolServerError::Io(e.to_string()))
    }

    /// Send a request and await its response, bounded by `timeout`.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let req = JsonRpcRequest::new(id, method, params);
        if let Err(e) = self.write_line(&req).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => match (resp.result, resp.error) {
                (_, Some(err)) => Err(ToolServerError::Rpc {
                    code: err.code,
                    message: err.message,
                }),
                (Some(result), None) => Ok(result),
                (None, None) => Ok(serde_json::Value::Null),
            },
            Ok(Err(_)) => Err(ToolServerError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(ToolServerError::Timeout)
            }
        }
    }

    /// Send a notification (no id, no response).
    pub async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<()> {
        self.write_line(&JsonRpcRequest::notification(method, params))
            .await
    }

    /// The MCP handshake: `initialize`, then `notifications/initialized`.
    pub async fn initialize(&self, timeout: Duration) -> Result<InitializeResult> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "clientInfo": {
                "name": "warren-runner",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        let result = self.request("initialize", Some(params), timeout).await?;
        let init: InitializeResult = serde_json::from_value(result)
            .map_err(|e| ToolServerError::Protocol(e.to_string()))?;
        self.notify("notifications/initialized", Some(serde_json::json!({})))
            .await?;
        Ok(init)
    }

    /// Fetch the advertised tool catalogue.
    pub async fn list_tools(&self, timeout: Duration) -> Result<Vec<McpTool>> {
        let result = self.request("tools/list", None, timeout).await?;
        let parsed: ToolsListResult = serde_json::from_value(result)
            .map_err(|e| ToolServerError::Protocol(e.to_string()))?;
        Ok(parsed.tools)
    }

    /// Invoke one tool.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> Result<ToolCallResult> {
        let params = serde_json::json!({ "name": tool_name, "arguments": arguments });
        let result = self.request("tools/call", Some(params), timeout).await?;
        serde_json::from_value(result).map_err(|e| ToolServerError::Protocol(e.to_string()))
    }

    /// Terminate: signal, wait up to `grace`, then force-kill.
    pub async fn shutdown(&self, grace: Duration) {
        self.reader.abort();
        let mut child = self.child.lock().await;

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
        #[cfg(not(unix))]
        let _ = child.start_kill();

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(server = %self.name, ?status, "tool server exited");
            }
            Ok(Err(e)) => {
                warn!(server = %self.name, error = %e, "tool server wait failed");
            }
            Err(_) => {
                warn!(server = %self.name, "tool server ignored termination, killing");
                let _ = child.kill().await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    /// Shell stand-in for a tool server. Relies on request ids being a
    /// monotonic counter from 1: initialize=1, tools/list=2, tools/call=3.
    const FAKE_SERVER: &str = r#"
read line
printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"fake","version":"0"}}}'
read line
read line
printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo","description":"Echo back","inputSchema":{"type":"object"}}]}}'
read line
printf '%s\n' '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"pong"}],"isError":false}}'
"#;

    fn spawn_fake() -> ToolServer {
        let dir = std::env::temp_dir();
        ToolServer::spawn(
            "fake",
            "sh",
            &["-c".to_string(), FAKE_SERVER.to_string()],
            &HashMap::new(),
            &dir,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn handshake_list_and_call() {
        let server = spawn_fake();
        let timeout = Duration::from_secs(5);

        let init = server.initialize(timeout).await.unwrap();
        assert_eq!(init.protocol_version, PROTOCOL_VERSION);

        let tools = server.list_tools(timeout).await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");

        let result = server
            .call_tool("echo", serde_json::json!({"text": "ping"}), timeout)
            .await
            .unwrap();
        assert!(!result.is_error);
        assert_eq!(result.text_content(), "pong");

        server.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn spawn_missing_command_fails() {
        let err = ToolServer::spawn(
            "ghost",
            "definitely-not-a-real-binary",
            &[],
            &HashMap::new(),
            &std::env::temp_dir(),
        )
        .err();
        assert!(matches!(err, Some(ToolServerError::Spawn { .. })));
    }

    #[tokio::test]
    async fn unresponsive_server_times_out() {
        let server = ToolServer::spawn(
            "sleepy",
            "sh",
            &["-c".to_string(), "sleep 30".to_string()],
            &HashMap::new(),
            &std::env::temp_dir(),
        )
        .unwrap();

        let err = server
            .request("tools/list", None, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolServerError::Timeout));

        server.shutdown(Duration::from_millis(200)).await;
    }
}
