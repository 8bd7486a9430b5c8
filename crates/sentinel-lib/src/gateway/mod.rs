//! Tool gateway session
//!
//! Session-oriented RPC client for the remediation gateway. The gateway
//! speaks JSON-RPC over HTTP with SSE-framed responses: an `initialize`
//! handshake returns a session token in the `Mcp-Session-Id` header,
//! `tools/list` enumerates the catalog, and `tools/call` invokes a tool.
//! The session is owned exclusively here; concurrent callers serialize
//! through the session mutex because the gateway's session model is not
//! documented as concurrency-safe.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::errors::SentinelError;

/// Protocol version sent in the handshake
pub const PROTOCOL_VERSION: &str = "2024-11-05";

const CLIENT_NAME: &str = "sre-sentinel";
const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Deadline for handshake and discovery requests
const SESSION_TIMEOUT: Duration = Duration::from_secs(10);

/// One tool advertised by the gateway
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON-schema parameter specification
    pub input_schema: Value,
}

/// Decoded `tools/call` response
#[derive(Debug, Clone)]
pub struct ToolResponse {
    pub is_error: bool,
    pub payload: Value,
}

impl ToolResponse {
    /// Success means the transport worked and the payload reports
    /// `success = true`; read-only probes that return a payload without a
    /// `success` field also count
    pub fn indicates_success(&self) -> bool {
        if self.is_error {
            return false;
        }
        match self.payload.get("success") {
            Some(flag) => flag.as_bool().unwrap_or(false),
            None => true,
        }
    }

    /// Error string carried in the payload, when present
    pub fn error_message(&self) -> Option<String> {
        self.payload
            .get("error")
            .and_then(|e| e.as_str())
            .map(String::from)
            .or_else(|| {
                self.payload
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(String::from)
            })
    }
}

/// Seam between the executor and the gateway transport
#[async_trait]
pub trait ToolGateway: Send + Sync {
    /// Discovered catalog, triggering a handshake when needed
    async fn catalog(&self) -> Result<Vec<ToolSpec>, SentinelError>;

    async fn call_tool(
        &self,
        name: &str,
        arguments: &Value,
        timeout: Duration,
    ) -> Result<ToolResponse, SentinelError>;
}

/// Render a catalog the way the analyzer prompt consumes it
pub fn render_catalog(tools: &[ToolSpec]) -> String {
    let mut lines = Vec::new();
    for tool in tools {
        lines.push(format!("- {}: {}", tool.name, tool.description));
        if let Some(required) = tool.input_schema.get("required").and_then(|r| r.as_array()) {
            let names: Vec<&str> = required.iter().filter_map(|v| v.as_str()).collect();
            if !names.is_empty() {
                lines.push(format!("  Required parameters: {}", names.join(", ")));
            }
        }
        if let Some(properties) = tool
            .input_schema
            .get("properties")
            .and_then(|p| p.as_object())
        {
            for (name, spec) in properties {
                if let Some(desc) = spec.get("description").and_then(|d| d.as_str()) {
                    lines.push(format!("  - {name}: {desc}"));
                }
            }
        }
    }
    lines.join("\n")
}

/// Extract the first JSON document from an SSE-framed body; plain JSON
/// bodies pass through unchanged
pub(crate) fn parse_sse_json(body: &str) -> Option<Value> {
    for line in body.lines() {
        if let Some(data) = line.strip_prefix("data: ") {
            if let Ok(value) = serde_json::from_str(data) {
                return Some(value);
            }
        }
    }
    serde_json::from_str(body.trim()).ok()
}

enum RpcError {
    SessionLost,
    Transport(String),
    Protocol(String),
}

struct RpcOk {
    result: Value,
    /// `Mcp-Session-Id` response header, set by the handshake
    session_id: Option<String>,
}

struct SessionState {
    session_id: Option<String>,
    catalog: HashMap<String, ToolSpec>,
}

/// HTTP session with the remediation gateway
pub struct GatewaySession {
    http: reqwest::Client,
    url: String,
    request_id: AtomicU64,
    state: Mutex<SessionState>,
}

impl GatewaySession {
    pub fn new(gateway_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: gateway_url.into(),
            request_id: AtomicU64::new(1),
            state: Mutex::new(SessionState {
                session_id: None,
                catalog: HashMap::new(),
            }),
        }
    }

    fn mcp_url(&self) -> String {
        format!("{}/mcp", self.url.trim_end_matches('/'))
    }

    async fn rpc(
        &self,
        session_id: Option<&str>,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<RpcOk, RpcError> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let mut request = self.http.post(self.mcp_url()).json(&body);
        if let Some(session_id) = session_id {
            request = request.header("Mcp-Session-Id", session_id);
        }

        let response = tokio::time::timeout(timeout, request.send())
            .await
            .map_err(|_| RpcError::Transport(format!("{method} timed out after {timeout:?}")))?
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            // the gateway signals an expired session this way
            return Err(RpcError::SessionLost);
        }
        if status.is_server_error() {
            return Err(RpcError::Transport(format!("gateway returned {status}")));
        }
        if !status.is_success() {
            return Err(RpcError::Protocol(format!("gateway returned {status}")));
        }

        let session_header = response
            .headers()
            .get("Mcp-Session-Id")
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        let text = tokio::time::timeout(timeout, response.text())
            .await
            .map_err(|_| RpcError::Transport("response body timed out".to_string()))?
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let value = parse_sse_json(&text)
            .ok_or_else(|| RpcError::Protocol("no JSON document in gateway response".to_string()))?;

        if let Some(error) = value.get("error") {
            let code = error.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown gateway error");
            if code == -32001 || message.to_ascii_lowercase().contains("session") {
                return Err(RpcError::SessionLost);
            }
            return Err(RpcError::Protocol(message.to_string()));
        }

        let result = value
            .get("result")
            .cloned()
            .ok_or_else(|| RpcError::Protocol("gateway response carried no result".to_string()))?;

        Ok(RpcOk {
            result,
            session_id: session_header,
        })
    }

    /// Handshake and catalog discovery; runs with the state lock held
    async fn establish(&self, state: &mut SessionState) -> Result<(), SentinelError> {
        info!(gateway = %self.url, "Initializing gateway session");

        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": CLIENT_NAME, "version": CLIENT_VERSION},
        });

        let handshake = self
            .rpc(None, "initialize", params, SESSION_TIMEOUT)
            .await
            .map_err(|e| match e {
                RpcError::SessionLost => {
                    SentinelError::GatewayUnavailable("handshake rejected".to_string())
                }
                RpcError::Transport(msg) | RpcError::Protocol(msg) => {
                    SentinelError::GatewayUnavailable(msg)
                }
            })?;

        let session_id = handshake.session_id.ok_or_else(|| {
            SentinelError::GatewayUnavailable("no session token in handshake".to_string())
        })?;

        let tools = self
            .rpc(Some(&session_id), "tools/list", json!({}), SESSION_TIMEOUT)
            .await
            .map_err(|e| match e {
                RpcError::SessionLost => {
                    SentinelError::GatewayUnavailable("session lost during discovery".to_string())
                }
                RpcError::Transport(msg) | RpcError::Protocol(msg) => {
                    SentinelError::GatewayUnavailable(msg)
                }
            })?;

        let mut catalog = HashMap::new();
        for tool in tools
            .result
            .get("tools")
            .and_then(|t| t.as_array())
            .cloned()
            .unwrap_or_default()
        {
            let Some(name) = tool.get("name").and_then(|n| n.as_str()) else {
                continue;
            };
            catalog.insert(
                name.to_string(),
                ToolSpec {
                    name: name.to_string(),
                    description: tool
                        .get("description")
                        .and_then(|d| d.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    input_schema: tool.get("inputSchema").cloned().unwrap_or(json!({})),
                },
            );
        }

        info!(
            session_id = %session_id,
            tools = catalog.len(),
            "Gateway session established"
        );
        state.session_id = Some(session_id);
        state.catalog = catalog;
        Ok(())
    }

    fn decode_call_result(result: &Value) -> Result<ToolResponse, SentinelError> {
        let is_error = result
            .get("isError")
            .and_then(|e| e.as_bool())
            .unwrap_or(false);

        let content = result
            .get("content")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first());

        let payload = match content {
            Some(item) => {
                let text = item.get("text").and_then(|t| t.as_str()).unwrap_or("{}");
                serde_json::from_str(text).unwrap_or_else(|_| json!({ "raw": text }))
            }
            None => {
                return Err(SentinelError::GatewayUnavailable(
                    "tool response carried no content".to_string(),
                ))
            }
        };

        Ok(ToolResponse { is_error, payload })
    }
}

#[async_trait]
impl ToolGateway for GatewaySession {
    async fn catalog(&self) -> Result<Vec<ToolSpec>, SentinelError> {
        let mut state = self.state.lock().await;
        if state.session_id.is_none() {
            self.establish(&mut state).await?;
        }
        Ok(state.catalog.values().cloned().collect())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: &Value,
        timeout: Duration,
    ) -> Result<ToolResponse, SentinelError> {
        let mut state = self.state.lock().await;
        if state.session_id.is_none() {
            self.establish(&mut state).await?;
        }

        let params = json!({"name": name, "arguments": arguments});
        let session_id = state.session_id.clone().expect("session just established");

        debug!(tool = %name, "Invoking gateway tool");
        match self
            .rpc(Some(&session_id), "tools/call", params.clone(), timeout)
            .await
        {
            Ok(ok) => Self::decode_call_result(&ok.result),
            Err(RpcError::SessionLost) => {
                // one re-handshake, then a single retry of the call
                warn!(tool = %name, "Gateway session expired, re-handshaking");
                state.session_id = None;
                self.establish(&mut state).await?;
                let session_id = state.session_id.clone().expect("session just established");
                match self
                    .rpc(Some(&session_id), "tools/call", params, timeout)
                    .await
                {
                    Ok(ok) => Self::decode_call_result(&ok.result),
                    Err(RpcError::SessionLost) => Err(SentinelError::GatewayUnavailable(
                        "session lost again after re-handshake".to_string(),
                    )),
                    Err(RpcError::Transport(msg)) | Err(RpcError::Protocol(msg)) => {
                        Err(SentinelError::GatewayUnavailable(msg))
                    }
                }
            }
            Err(RpcError::Transport(msg)) | Err(RpcError::Protocol(msg)) => {
                Err(SentinelError::GatewayUnavailable(msg))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sse_extracts_data_line() {
        let body = "event: message\ndata: {\"result\": {\"tools\": []}}\n\n";
        let value = parse_sse_json(body).unwrap();
        assert!(value["result"]["tools"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_parse_plain_json_body() {
        let value = parse_sse_json("{\"jsonrpc\": \"2.0\", \"id\": 1}").unwrap();
        assert_eq!(value["id"], 1);
    }

    #[test]
    fn test_parse_sse_garbage_returns_none() {
        assert!(parse_sse_json("not json at all").is_none());
    }

    #[test]
    fn test_tool_response_success_flag() {
        let ok = ToolResponse {
            is_error: false,
            payload: json!({"success": true, "message": "restarted"}),
        };
        assert!(ok.indicates_success());

        let failed = ToolResponse {
            is_error: false,
            payload: json!({"success": false, "error": "no such container"}),
        };
        assert!(!failed.indicates_success());
        assert_eq!(failed.error_message().unwrap(), "no such container");
    }

    #[test]
    fn test_probe_without_success_field_counts_as_success() {
        let probe = ToolResponse {
            is_error: false,
            payload: json!({"status": "running", "health": "healthy"}),
        };
        assert!(probe.indicates_success());
    }

    #[test]
    fn test_is_error_always_fails() {
        let err = ToolResponse {
            is_error: true,
            payload: json!({"success": true}),
        };
        assert!(!err.indicates_success());
    }

    #[test]
    fn test_decode_call_result() {
        let result = json!({
            "content": [{"type": "text", "text": "{\"success\": true, \"message\": \"done\"}"}],
            "isError": false
        });
        let response = GatewaySession::decode_call_result(&result).unwrap();
        assert!(response.indicates_success());
        assert_eq!(response.payload["message"], "done");
    }

    #[test]
    fn test_decode_call_result_without_content_fails() {
        let result = json!({"isError": false});
        assert!(GatewaySession::decode_call_result(&result).is_err());
    }

    #[test]
    fn test_decode_call_result_non_json_text() {
        let result = json!({
            "content": [{"type": "text", "text": "container restarted"}],
        });
        let response = GatewaySession::decode_call_result(&result).unwrap();
        assert_eq!(response.payload["raw"], "container restarted");
    }

    #[test]
    fn test_render_catalog() {
        let tools = vec![ToolSpec {
            name: "restart_container".to_string(),
            description: "Restart a container".to_string(),
            input_schema: json!({
                "type": "object",
                "required": ["container_name"],
                "properties": {
                    "container_name": {"type": "string", "description": "Name of the container"},
                    "reason": {"type": "string", "description": "Why it is restarted"}
                }
            }),
        }];

        let rendered = render_catalog(&tools);
        assert!(rendered.contains("- restart_container: Restart a container"));
        assert!(rendered.contains("Required parameters: container_name"));
        assert!(rendered.contains("- reason: Why it is restarted"));
    }
}
