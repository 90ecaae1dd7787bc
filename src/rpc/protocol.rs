//! Wire types for the status RPC: JSON-RPC 2.0, one object per line.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const VERSION: &str = "2.0";

/// Error codes returned by the daemon.
///
/// The first five are reserved by JSON-RPC; the rest live in the
/// implementation-defined server range starting at -32000.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    Internal,
    JobNotFound,
    UnknownTarget,
}

impl ErrorCode {
    pub fn code(self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::Internal => -32603,
            Self::JobNotFound => -32000,
            Self::UnknownTarget => -32001,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    /// Absent for notifications.
    #[serde(default)]
    pub id: Option<Value>,
}

impl Request {
    pub fn call(method: &str, params: Option<Value>, id: u64) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            method: method.to_string(),
            params,
            id: Some(Value::from(id)),
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.jsonrpc != VERSION {
            return Err("jsonrpc must be \"2.0\"");
        }
        if self.method.is_empty() {
            return Err("method must not be empty");
        }
        Ok(())
    }

    /// Decode the params object. Missing params decode as `T::default()`.
    pub fn params_or_default<T: DeserializeOwned + Default>(&self) -> Result<T, String> {
        match &self.params {
            None | Some(Value::Null) => Ok(T::default()),
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| e.to_string()),
        }
    }

    /// Decode a params object that must be present.
    pub fn params<T: DeserializeOwned>(&self) -> Result<T, String> {
        let value = self.params.clone().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| e.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn is(&self, code: ErrorCode) -> bool {
        self.code == code.code()
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl Response {
    pub fn success(id: Value, result: impl Serialize) -> Self {
        match serde_json::to_value(result) {
            Ok(result) => Self {
                jsonrpc: VERSION.to_string(),
                result: Some(result),
                error: None,
                id,
            },
            Err(e) => Self::internal_error(id, format!("failed to encode result: {}", e)),
        }
    }

    pub fn failure(id: Value, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            result: None,
            error: Some(RpcError {
                code: code.code(),
                message: message.into(),
                data: None,
            }),
            id,
        }
    }

    /// The request could not be read, so its id is unknown.
    pub fn parse_error() -> Self {
        Self::failure(Value::Null, ErrorCode::ParseError, "Parse error")
    }

    pub fn invalid_request(id: Value, reason: &str) -> Self {
        Self::failure(id, ErrorCode::InvalidRequest, format!("Invalid request: {}", reason))
    }

    pub fn method_not_found(id: Value, method: &str) -> Self {
        Self::failure(id, ErrorCode::MethodNotFound, format!("Method not found: {}", method))
    }

    pub fn invalid_params(id: Value, details: impl Into<String>) -> Self {
        Self::failure(id, ErrorCode::InvalidParams, details)
    }

    pub fn internal_error(id: Value, details: impl Into<String>) -> Self {
        Self::failure(id, ErrorCode::Internal, details)
    }

    pub fn job_not_found(id: Value, job_id: &str) -> Self {
        Self::failure(id, ErrorCode::JobNotFound, format!("Job not found: {}", job_id))
    }

    pub fn unknown_target(id: Value, target_id: &str) -> Self {
        Self::failure(
            id,
            ErrorCode::UnknownTarget,
            format!("Unknown target: {}", target_id),
        )
    }

    /// Split into the result value or the error object.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}
