use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::debug;

use crate::jsonrpc::{
    InitializeResult, JsonRpcRequest, JsonRpcResponse, McpTool, ToolCallResult, ToolsListResult,
    PROTOCOL_VERSION,
};
use crate::server::{Result, ToolServerError};

// ---------------------------------------------------------------------------
// HttpToolServer — the same JSON-RPC envelope over POST
// ---------------------------------------------------------------------------

/// A tool server reached over HTTP instead of a child process.
///
/// Each request POSTs one JSON-RPC envelope and reads one JSON response;
/// ids stay a per-connection monotonic counter. There is no process to
/// terminate, so shutdown is a no-op.
pub struct HttpToolServer {
    name: String,
    client: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl HttpToolServer {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ToolServerError::Io(e.to_string()))?;
        Ok(Self {
            name: name.into(),
            client,
            url: url.into(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn post(
        &self,
        payload: &JsonRpcRequest,
        timeout: Duration,
    ) -> Result<Option<JsonRpcResponse>> {
        let send = self
            .client
            .post(&self.url)
            .header("Accept", "application/json, text/event-stream")
            .json(payload)
            .send();
        let resp = match tokio::time::timeout(timeout, send).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) if e.is_timeout() => return Err(ToolServerError::Timeout),
            Ok(Err(e)) => return Err(ToolServerError::Io(e.to_string())),
            Err(_) => return Err(ToolServerError::Timeout),
        };
        if !resp.status().is_success() {
            return Err(ToolServerError::Io(format!(
                "server answered {}",
                resp.status()
            )));
        }
        if payload.id.is_none() {
            // Notification; the body, if any, is ignored.
            return Ok(None);
        }
        let parsed: JsonRpcResponse = resp
            .json()
            .await
            .map_err(|e| ToolServerError::Protocol(e.to_string()))?;
        Ok(Some(parsed))
    }

    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = JsonRpcRequest::new(id, method, params);
        let resp = self
            .post(&req, timeout)
            .await?
            .ok_or(ToolServerError::Closed)?;
        if resp.id != Some(id) {
            debug!(server = %self.name, expected = id, got = ?resp.id, "response id mismatch");
            return Err(ToolServerError::Protocol("response id mismatch".into()));
        }
        match (resp.result, resp.error) {
            (_, Some(err)) => Err(ToolServerError::Rpc {
                code: err.code,
                message: err.message,
            }),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(serde_json::Value::Null),
        }
    }

    pub async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<()> {
        self.post(&JsonRpcRequest::notification(method, params), Duration::from_secs(10))
            .await?;
        Ok(())
    }

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

    pub async fn list_tools(&self, timeout: Duration) -> Result<Vec<McpTool>> {
        let result = self.request("tools/list", None, timeout).await?;
        let parsed: ToolsListResult = serde_json::from_value(result)
            .map_err(|e| ToolServerError::Protocol(e.to_string()))?;
        Ok(parsed.tools)
    }

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
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::{Json, Router};

    async fn spawn_rpc_server() -> String {
        // Echoes a canned result for each known method, copying the
        // request id back.
        let app = Router::new().route(
            "/rpc",
            post(|Json(req): Json<serde_json::Value>| async move {
                let id = req.get("id").cloned().unwrap_or(serde_json::Value::Null);
                let method = req["method"].as_str().unwrap_or_default();
                let result = match method {
                    "initialize" => serde_json::json!({
                        "protocolVersion": "2024-11-05",
                        "capabilities": { "tools": {} },
                        "serverInfo": { "name": "http-fake", "version": "0" }
                    }),
                    "tools/list" => serde_json::json!({
                        "tools": [{ "name": "fetch", "description": "Fetch", "inputSchema": { "type": "object" } }]
                    }),
                    "tools/call" => serde_json::json!({
                        "content": [{ "type": "text", "text": "fetched" }],
                        "isError": false
                    }),
                    _ => serde_json::json!({}),
                };
                Json(serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": result }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/rpc")
    }

    #[tokio::test]
    async fn http_handshake_list_and_call() {
        let url = spawn_rpc_server().await;
        let server = HttpToolServer::new("http-fake", url).unwrap();
        let timeout = Duration::from_secs(5);

        let init = server.initialize(timeout).await.unwrap();
        assert_eq!(init.protocol_version, PROTOCOL_VERSION);

        let tools = server.list_tools(timeout).await.unwrap();
        assert_eq!(tools[0].name, "fetch");

        let result = server
            .call_tool("fetch", serde_json::json!({"url": "x"}), timeout)
            .await
            .unwrap();
        assert_eq!(result.text_content(), "fetched");
    }

    #[tokio::test]
    async fn unreachable_endpoint_errors() {
        let server = HttpToolServer::new("dead", "http://127.0.0.1:1/rpc").unwrap();
        let err = server
            .request("tools/list", None, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ToolServerError::Io(_) | ToolServerError::Timeout
        ));
    }
}
