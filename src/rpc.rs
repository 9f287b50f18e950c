//! JSON-RPC 2.0 Protocol Types
//!
//! Core wire types shared by the dispatcher (gateway side) and the
//! tool-server multiplexer (child side):
//! - [`JsonRpcRequest`]: outgoing request with a gateway-chosen `u64` id
//! - [`JsonRpcNotification`]: one-way message (no id, no response)
//! - [`JsonRpcResponse`]: result or error, correlated by id
//! - [`Frame`]: classification of an incoming line for the reader loop
//!
//! ## Protocol Overview
//!
//! Both directions speak JSON-RPC 2.0 as newline-delimited JSON:
//!
//! ```json
//! // Request
//! {"jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {...}}
//!
//! // Success Response
//! {"jsonrpc": "2.0", "id": 1, "result": {...}}
//!
//! // Error Response
//! {"jsonrpc": "2.0", "id": 1, "error": {"code": -32601, "message": "..."}}
//! ```
//!
//! Ids the gateway assigns to child requests are monotonically increasing
//! `u64`s. Ids arriving from callers of the gateway are caller-chosen and
//! carried opaquely as [`serde_json::Value`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC 2.0 Request with a gateway-chosen numeric id.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    /// Protocol version - always "2.0"
    pub jsonrpc: &'static str,

    /// Request ID - used to correlate responses
    pub id: u64,

    /// Method name (e.g., "initialize", "tools/call")
    pub method: String,

    /// Method parameters
    pub params: Value,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 Notification.
///
/// A notification is a request without an ID - the receiver must not respond.
/// Used for one-way messages like `notifications/initialized`.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    /// Protocol version - always "2.0"
    pub jsonrpc: &'static str,

    /// Method name (e.g., "notifications/initialized")
    pub method: String,

    /// Method parameters (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.to_string(),
            params: None,
        }
    }

    /// Create a notification with parameters.
    pub fn with_params(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.to_string(),
            params: Some(params),
        }
    }
}

/// JSON-RPC 2.0 Response.
///
/// Contains either a result or an error, never both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Protocol version - should be "2.0"
    pub jsonrpc: String,

    /// Request ID this response corresponds to
    #[serde(default)]
    pub id: Option<Value>,

    /// Successful result (mutually exclusive with error)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error information (mutually exclusive with result)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Build a success response echoing the caller's id.
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response echoing the caller's id.
    pub fn failure(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            result: None,
            error: Some(error),
        }
    }

    /// Check if the response indicates success.
    ///
    /// A response is successful if it has a result and no error.
    /// Note: a null result is still considered success.
    pub fn is_success(&self) -> bool {
        self.result.is_some() && self.error.is_none()
    }

    /// Numeric id, when the response carries one.
    pub fn id_u64(&self) -> Option<u64> {
        self.id.as_ref().and_then(Value::as_u64)
    }
}

/// JSON-RPC 2.0 Error object.
///
/// ## Gateway Error Codes
///
/// | Code | Meaning |
/// |------|---------|
/// | -32600 | Invalid request |
/// | -32601 | Method not found |
/// | -32602 | Invalid params |
/// | -32603 | Internal error |
/// | -32000 | Tool execution failed |
/// | -32001 | Approval denied / aborted |
/// | -32002 | Unknown tool |
/// | -32003 | Workflow not found or expired |
/// | -32004 | Timeout |
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code (negative integer per JSON-RPC spec)
    pub code: i64,

    /// Human-readable error message
    pub message: String,

    /// Additional error data (optional, implementation-defined)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Classification of an incoming newline-delimited JSON frame.
///
/// The reader loop sees three shapes on a child's stdout: responses to
/// gateway requests, child-originated requests (sampling), and notifications.
#[derive(Debug)]
pub enum Frame {
    /// Has `method` and `id`: child-originated request (e.g. sampling/createMessage)
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    /// Has `method` but no `id`: notification, logged and ignored
    Notification { method: String },
    /// No `method`: response to one of our requests
    Response(JsonRpcResponse),
}

impl Frame {
    /// Classify a raw JSON value into a frame.
    ///
    /// Returns `None` if the value is not a JSON object.
    pub fn classify(value: Value) -> Option<Frame> {
        let obj = value.as_object()?;

        if let Some(method) = obj.get("method").and_then(Value::as_str) {
            let method = method.to_string();
            return match obj.get("id") {
                Some(id) if !id.is_null() => Some(Frame::Request {
                    id: id.clone(),
                    method,
                    params: obj.get("params").cloned().unwrap_or(Value::Null),
                }),
                _ => Some(Frame::Notification { method }),
            };
        }

        serde_json::from_value(Value::Object(obj.clone()))
            .ok()
            .map(Frame::Response)
    }
}
