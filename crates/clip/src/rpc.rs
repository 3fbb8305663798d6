//! JSON-RPC 2.0 frames for the client-facing stdio transport.

use crate::error::ClipError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    /// Absent for notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("method not found: {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }
}

impl From<&ClipError> for JsonRpcError {
    fn from(err: &ClipError) -> Self {
        match err {
            // Unknown and hidden tools, resources and prompts all answer
            // with invalid params, indistinguishably.
            ClipError::ToolNotFound(_)
            | ClipError::ResourceNotFound(_)
            | ClipError::PromptNotFound(_) => JsonRpcError::invalid_params(err.to_string()),
            ClipError::Protocol(_) => JsonRpcError::new(INVALID_REQUEST, err.to_string()),
            _ => JsonRpcError::internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn notification_has_no_id() {
        let raw = r#"{"jsonrpc": "2.0", "method": "notifications/initialized"}"#;
        let request: JsonRpcRequest = serde_json::from_str(raw).unwrap();
        assert!(request.is_notification());

        let raw = r#"{"jsonrpc": "2.0", "id": 7, "method": "ping"}"#;
        let request: JsonRpcRequest = serde_json::from_str(raw).unwrap();
        assert!(!request.is_notification());
        assert_eq!(request.id, Some(json!(7)));
    }

    #[test]
    fn responses_serialize_one_of_result_or_error() {
        let ok = JsonRpcResponse::success(json!(1), json!({"tools": []}));
        let raw = serde_json::to_string(&ok).unwrap();
        assert!(raw.contains("result"));
        assert!(!raw.contains("error"));

        let failed = JsonRpcResponse::failure(json!(1), JsonRpcError::method_not_found("x/y"));
        let raw = serde_json::to_string(&failed).unwrap();
        assert!(!raw.contains("result"));
        assert!(raw.contains("-32601"));
    }

    #[test]
    fn clip_errors_map_to_rpc_codes() {
        let not_found: JsonRpcError = (&ClipError::ToolNotFound("srv__x".into())).into();
        assert_eq!(not_found.code, INVALID_PARAMS);

        let upstream: JsonRpcError = (&ClipError::upstream("srv", "boom")).into();
        assert_eq!(upstream.code, INTERNAL_ERROR);

        let protocol: JsonRpcError = (&ClipError::Protocol("bad frame".into())).into();
        assert_eq!(protocol.code, INVALID_REQUEST);
    }
}
