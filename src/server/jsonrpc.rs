//! JSON-RPC 2.0 envelope, per spec.md §6.1.
//!
//! Shared by both transports so stdio and HTTP produce byte-identical
//! response bodies.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dispatcher::Dispatcher;
use crate::error::AppError;

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    #[allow(dead_code)]
    pub jsonrpc: Option<String>,
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Deserialize)]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

impl JsonRpcResponse {
    fn ok(id: Value, payload: Value) -> Self {
        // Wrap in the MCP `content` envelope per spec.md §6.1: the
        // tool's own JSON result is carried as a JSON-encoded text
        // block, not inlined directly into `result`.
        let text = serde_json::to_string(&payload).unwrap_or_else(|_| "null".to_string());
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(serde_json::json!({ "content": [ { "type": "text", "text": text } ] })),
            error: None,
        }
    }

    fn err(id: Value, code: i64, message: String) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(JsonRpcError { code, message }),
        }
    }
}

/// Parse `params` as a `tools/call` envelope, dispatch, and fold the
/// result back into a JSON-RPC response. Any malformed request or
/// dispatch failure is reported as a JSON-RPC error, never a panic.
pub async fn handle_request(dispatcher: &Dispatcher, credential: Option<&str>, request: JsonRpcRequest) -> JsonRpcResponse {
    if request.method != "tools/call" {
        return JsonRpcResponse::err(request.id, -32601, format!("unknown method '{}'", request.method));
    }

    let params: ToolCallParams = match serde_json::from_value(request.params) {
        Ok(p) => p,
        Err(e) => return JsonRpcResponse::err(request.id, -32602, format!("invalid params: {e}")),
    };

    match dispatcher.dispatch(credential, &params.name, params.arguments).await {
        Ok(payload) => JsonRpcResponse::ok(request.id, payload),
        Err(e) => JsonRpcResponse::err(request.id, e.code(), e.client_message()),
    }
}

pub fn parse_error(id: Value, detail: impl std::fmt::Display) -> JsonRpcResponse {
    JsonRpcResponse::err(id, -32700, format!("parse error: {detail}"))
}

#[allow(dead_code)]
fn internal_error_response(id: Value, e: AppError) -> JsonRpcResponse {
    JsonRpcResponse::err(id, e.code(), e.client_message())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_response_wraps_payload_as_text_content() {
        let resp = JsonRpcResponse::ok(Value::from(1), serde_json::json!({"a": 1}));
        let result = resp.result.unwrap();
        let content = result["content"][0]["text"].as_str().unwrap();
        assert_eq!(content, r#"{"a":1}"#);
    }

    #[test]
    fn err_response_carries_code_and_message() {
        let resp = JsonRpcResponse::err(Value::from(2), -32004, "bad".to_string());
        assert!(resp.result.is_none());
        assert_eq!(resp.error.unwrap().code, -32004);
    }
}
