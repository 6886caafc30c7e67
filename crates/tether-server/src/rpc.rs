use serde::{Deserialize, Serialize};
use tether_engine::OrchestratorError;

/// Request frame sent by a WebSocket client.
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    pub params: Option<serde_json::Value>,
    pub id: Option<serde_json::Value>,
}

/// Response frame: `{ id, success, result?, error?: { code, message } }`.
#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub id: Option<serde_json::Value>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// Error object. `code` is a stable string clients can match on.
#[derive(Debug, Serialize)]
pub struct RpcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

// Standard JSON-RPC error codes (used internally for routing)
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

pub fn error_code_to_string(code: i32) -> &'static str {
    match code {
        PARSE_ERROR => "PARSE_ERROR",
        INVALID_REQUEST => "INVALID_REQUEST",
        METHOD_NOT_FOUND => "METHOD_NOT_FOUND",
        INVALID_PARAMS => "INVALID_PARAMS",
        INTERNAL_ERROR => "INTERNAL_ERROR",
        _ => "UNKNOWN_ERROR",
    }
}

impl RpcResponse {
    pub fn success(id: Option<serde_json::Value>, result: serde_json::Value) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<serde_json::Value>, code: i32, message: impl Into<String>) -> Self {
        Self::with_code(id, error_code_to_string(code), message)
    }

    fn with_code(
        id: Option<serde_json::Value>,
        code: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(RpcError {
                code: code.to_string(),
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Map an orchestrator failure onto its stable error kind.
    pub fn from_orchestrator(id: Option<serde_json::Value>, err: &OrchestratorError) -> Self {
        let mut resp = Self::with_code(id, err.error_kind(), err.to_string());
        if let (Some(error), OrchestratorError::LimitExceeded(limit)) = (resp.error.as_mut(), err) {
            error.data = Some(serde_json::json!({ "limit": limit.limit }));
        }
        resp
    }

    pub fn method_not_found(id: Option<serde_json::Value>, method: &str) -> Self {
        Self::error(id, METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    pub fn invalid_params(id: Option<serde_json::Value>, msg: impl Into<String>) -> Self {
        Self::error(id, INVALID_PARAMS, msg)
    }

    pub fn internal_error(id: Option<serde_json::Value>, msg: impl Into<String>) -> Self {
        Self::error(id, INTERNAL_ERROR, msg)
    }

    pub fn not_available(id: Option<serde_json::Value>, msg: impl Into<String>) -> Self {
        Self::with_code(id, "NOT_AVAILABLE", msg)
    }

    pub fn parse_error() -> Self {
        Self::error(None, PARSE_ERROR, "Parse error")
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }
}

/// Extract a required string param from the RPC params object.
pub fn require_str<'a>(params: &'a serde_json::Value, key: &str) -> Result<&'a str, String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| format!("Missing required parameter: {key}"))
}

pub fn optional_str<'a>(params: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}

pub fn optional_i64(params: &serde_json::Value, key: &str) -> Option<i64> {
    params.get(key).and_then(|v| v.as_i64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::ids::{OwnerId, SessionId};
    use tether_engine::LimitExceeded;

    #[test]
    fn parse_rpc_request() {
        let json = r#"{"method":"session.create","params":{"name":"phone-A"},"id":1}"#;
        let req: RpcRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.method, "session.create");
        assert_eq!(req.params.unwrap()["name"], "phone-A");
        assert_eq!(req.id, Some(serde_json::json!(1)));
    }

    #[test]
    fn success_response_serializes() {
        let resp = RpcResponse::success(Some(serde_json::json!(1)), serde_json::json!({"ok": true}));
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"result\""));
        assert!(!json.contains("\"error\""));
        assert!(json.contains("\"success\":true"));
    }

    #[test]
    fn error_response_serializes() {
        let resp = RpcResponse::method_not_found(Some(serde_json::json!(1)), "foo.bar");
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["code"], "METHOD_NOT_FOUND");
        assert!(json["error"]["message"].as_str().unwrap().contains("foo.bar"));
        assert!(json.get("result").is_none());
    }

    #[test]
    fn error_code_maps_to_string() {
        assert_eq!(error_code_to_string(PARSE_ERROR), "PARSE_ERROR");
        assert_eq!(error_code_to_string(INVALID_REQUEST), "INVALID_REQUEST");
        assert_eq!(error_code_to_string(-99999), "UNKNOWN_ERROR");
    }

    #[test]
    fn orchestrator_errors_keep_their_kind() {
        let err = OrchestratorError::NotFound(SessionId::from_raw("sess_x"));
        let resp = RpcResponse::from_orchestrator(Some(serde_json::json!(7)), &err);
        assert_eq!(resp.error_code(), Some("NOT_FOUND"));
        assert_eq!(resp.id, Some(serde_json::json!(7)));

        let err = OrchestratorError::LimitExceeded(LimitExceeded {
            owner_id: OwnerId::from_raw("1"),
            limit: 5,
        });
        let json = serde_json::to_value(RpcResponse::from_orchestrator(None, &err)).unwrap();
        assert_eq!(json["error"]["code"], "LIMIT_EXCEEDED");
        assert_eq!(json["error"]["data"]["limit"], 5);
    }

    #[test]
    fn param_helpers() {
        let params = serde_json::json!({"name": "test", "count": 5});
        assert_eq!(require_str(&params, "name").unwrap(), "test");
        assert!(require_str(&params, "missing").is_err());
        assert!(require_str(&params, "count").is_err());
        assert_eq!(optional_str(&params, "missing"), None);
        assert_eq!(optional_i64(&params, "count"), Some(5));
    }

    #[test]
    fn parse_error_has_no_id() {
        let resp = RpcResponse::parse_error();
        assert!(resp.id.is_none());
        assert_eq!(resp.error_code(), Some("PARSE_ERROR"));
    }
}
