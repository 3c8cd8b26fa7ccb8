//! JSON-RPC wire types exchanged with the automation server.
//!
//! Outbound calls are POSTed as `{jsonrpc, id, method, params}`. Replies come
//! back asynchronously over the event stream and carry the same `id`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Correlation id linking one outbound call to its eventual reply.
pub type RequestId = i64;

/// JSON-RPC protocol version sent with every call.
pub const JSONRPC_VERSION: &str = "2.0";

/// Method used to invoke a server-side tool.
pub const METHOD_TOOLS_CALL: &str = "tools/call";

/// Method used to list the server's tools.
pub const METHOD_TOOLS_LIST: &str = "tools/list";

/// A single outbound JSON-RPC call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default = "empty_params")]
    pub params: Value,
}

fn empty_params() -> Value {
    Value::Object(serde_json::Map::new())
}

impl JsonRpcRequest {
    pub fn new(id: RequestId, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }

    /// The device-selection call issued during session Init.
    pub fn select_device(id: RequestId, tool: &str, serial: &str, device_type: &str) -> Self {
        Self::new(
            id,
            METHOD_TOOLS_CALL,
            serde_json::json!({
                "name": tool,
                "arguments": {
                    "device": serial,
                    "deviceType": device_type,
                }
            }),
        )
    }

    /// The capability-listing call issued during session Discover.
    pub fn list_tools(id: RequestId) -> Self {
        Self::new(id, METHOD_TOOLS_LIST, empty_params())
    }
}

/// A call proposed by the oracle, before an id has been assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub method: String,
    pub params: Value,
}

impl ToolCall {
    /// Bind this call to a freshly assigned correlation id.
    pub fn into_request(self, id: RequestId) -> JsonRpcRequest {
        JsonRpcRequest::new(id, self.method, self.params)
    }
}

/// The fields of an inbound payload the correlator cares about.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    id: Option<Value>,
}

/// Read the response id out of an inbound payload.
///
/// Returns `Err` when the payload is not JSON at all and `Ok(None)` when it
/// is JSON without a usable id (a notification, or a null id). Numeric
/// strings are accepted, since some servers echo ids back as text.
pub fn response_id(payload: &str) -> Result<Option<RequestId>, serde_json::Error> {
    let envelope: Envelope = serde_json::from_str(payload)?;
    Ok(match envelope.id {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Count the tools advertised in a `tools/list` reply, if it has the usual
/// `{"result": {"tools": [...]}}` shape.
pub fn count_tools(payload: &str) -> Option<usize> {
    let value: Value = serde_json::from_str(payload).ok()?;
    value
        .get("result")
        .and_then(|r| r.get("tools"))
        .and_then(Value::as_array)
        .map(Vec::len)
}
