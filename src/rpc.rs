use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::dispatch::Dispatcher;
use crate::registry::ToolRegistry;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const AUTH_ERROR: i64 = -32000;

#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    jsonrpc: String,
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Option<Value>,
}

#[derive(Debug, Serialize)]
struct JsonRpcSuccess {
    jsonrpc: &'static str,
    id: Value,
    result: Value,
}

#[derive(Debug, Serialize)]
struct JsonRpcFailure {
    jsonrpc: &'static str,
    id: Value,
    error: JsonRpcError,
}

#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// Handles one JSON-RPC message body and always yields a well-formed
/// response value. Tool failures never surface as JSON-RPC errors: they
/// are rendered as a successful response whose payload carries
/// `isError: true`, so the calling model can read the failure text.
pub async fn handle_message(
    registry: &ToolRegistry,
    dispatcher: &Dispatcher,
    token: &str,
    body: &[u8],
) -> Value {
    let Ok(raw) = serde_json::from_slice::<Value>(body) else {
        return jsonrpc_error(Value::Null, PARSE_ERROR, "Parse error");
    };

    let request = match serde_json::from_value::<JsonRpcRequest>(raw.clone()) {
        Ok(request) => request,
        Err(_) => {
            let id = raw.get("id").cloned().unwrap_or(Value::Null);
            return jsonrpc_error(id, INVALID_REQUEST, "Invalid Request");
        }
    };

    let id = request.id.unwrap_or(Value::Null);
    if request.jsonrpc != "2.0" {
        return jsonrpc_error(id, INVALID_REQUEST, "jsonrpc must be \"2.0\"");
    }

    debug!(method = %request.method, "Handling JSON-RPC message");

    match request.method.as_str() {
        "initialize" => jsonrpc_ok(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": "mcp-gateway-api",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        ),
        "tools/list" => jsonrpc_ok(id, json!({ "tools": registry.list_json() })),
        "tools/call" => {
            let params = request
                .params
                .and_then(|value| serde_json::from_value::<ToolCallParams>(value).ok());
            let Some(params) = params else {
                return jsonrpc_error(id, INVALID_PARAMS, "Invalid tool call parameters");
            };

            match dispatcher.dispatch(&params.name, &params.arguments, token).await {
                Ok(output) => jsonrpc_ok(
                    id,
                    json!({
                        "content": [{ "type": "text", "text": output.into_text() }],
                    }),
                ),
                Err(err) => jsonrpc_ok(
                    id,
                    json!({
                        "content": [{ "type": "text", "text": err.to_string() }],
                        "isError": true,
                    }),
                ),
            }
        }
        _ => jsonrpc_error(id, METHOD_NOT_FOUND, "Method not found"),
    }
}

/// Authentication failure on the message path, rendered in the protocol's
/// own error vocabulary rather than an HTTP failure.
pub fn auth_error(id: Value, message: impl Into<String>) -> Value {
    jsonrpc_error(id, AUTH_ERROR, message)
}

fn jsonrpc_ok(id: Value, result: Value) -> Value {
    serde_json::to_value(JsonRpcSuccess {
        jsonrpc: "2.0",
        id,
        result,
    })
    .unwrap_or_else(|_| json!({"jsonrpc": "2.0", "id": null, "result": null}))
}

fn jsonrpc_error(id: Value, code: i64, message: impl Into<String>) -> Value {
    serde_json::to_value(JsonRpcFailure {
        jsonrpc: "2.0",
        id,
        error: JsonRpcError {
            code,
            message: message.into(),
        },
    })
    .unwrap_or_else(|_| json!({"jsonrpc": "2.0", "id": null, "error": {"code": code}}))
}
