//! Rust struct definitions for the JSON-RPC envelopes this server exchanges.
//!
//! Inbound messages are classified by hand in [`crate::request`] so that every malformed envelope
//! can be answered with the right error and the right id.  Outbound responses are plain `serde`
//! structs.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::JsonValue;
use crate::{JsonRpcError, Result};
/// Re-export the parts of the JSON-RPC protocol that `jsonrpsee` already models well.
///
/// `ErrorCode` knows the reserved codes and their standard messages, and maps any other code to
/// `ErrorCode::ServerError`.
pub use jsonrpsee_types::{error::ErrorCode, params::TwoPointZero};

/// Largest integer magnitude an `f64` holds without rounding (2^53).
const MAX_EXACT_F64_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Request Id
///
/// String and numeric ids are distinct: `"1"` and `1` never compare equal and each is echoed back
/// exactly as it arrived.
#[derive(Debug, PartialEq, Clone, Hash, Eq, Deserialize, Serialize, PartialOrd, Ord)]
#[serde(untagged)]
pub enum Id {
    /// Null
    Null,
    /// Numeric id
    Number(i64),
    /// String id
    Str(String),
}

impl Id {
    /// Interpret a JSON value as a request id.
    ///
    /// Returns `None` for values JSON-RPC does not allow as an id (booleans, containers, and
    /// numbers with a fractional part).
    ///
    /// [`JsonValue`] holds numbers as `f64`, so numeric ids are only accepted here while they are
    /// exactly representable.  Use [`Id::from_number`] when the number is still available in its
    /// original form.
    pub fn from_value(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::Null => Some(Id::Null),
            JsonValue::String(s) => Some(Id::Str(s.clone())),
            JsonValue::Number(n) if value.is_integer() && n.abs() <= MAX_EXACT_F64_INTEGER => {
                Some(Id::Number(*n as i64))
            }
            _ => None,
        }
    }

    /// Interpret a number exactly as it appeared in the message text.
    ///
    /// Integers anywhere in the `i64` range keep every digit.  A number written with a fraction or
    /// an exponent is accepted only if it is integral and exactly representable as `f64`.
    pub fn from_number(number: &serde_json::Number) -> Option<Self> {
        number
            .as_i64()
            .or_else(|| {
                number
                    .as_f64()
                    .filter(|n| n.fract() == 0.0 && n.abs() <= MAX_EXACT_F64_INTEGER)
                    .map(|n| n as i64)
            })
            .map(Id::Number)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Id::Null => f.write_str("null"),
            Id::Number(n) => write!(f, "{n}"),
            Id::Str(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<&str> for Id {
    fn from(value: &str) -> Self {
        Id::Str(value.to_string())
    }
}

impl From<i64> for Id {
    fn from(value: i64) -> Self {
        Id::Number(value)
    }
}

/// A method call received from the peer.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: Id,
    pub method: String,
    pub params: Option<JsonValue>,
}

/// A notification received from the peer.  Never answered.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<JsonValue>,
}

/// JSON-RPC response object as defined in the [spec](https://www.jsonrpc.org/specification#response_object).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// JSON-RPC version.
    pub jsonrpc: TwoPointZero,
    /// Request ID
    pub id: Id,
    /// Payload which can be result or error.
    #[serde(flatten)]
    pub payload: ResponsePayload,
}

impl Response {
    pub fn new(id: Id, payload: ResponsePayload) -> Self {
        Self {
            jsonrpc: TwoPointZero,
            id,
            payload,
        }
    }

    /// Create an owned successful response
    pub fn success(id: Id, result: JsonValue) -> Self {
        Self::new(id, ResponsePayload::success(result))
    }

    /// Create an error response
    pub fn error(id: Id, details: impl Into<ErrorDetails>) -> Self {
        Self::new(id, ResponsePayload::error(details))
    }

    pub fn is_error(&self) -> bool {
        matches!(self.payload, ResponsePayload::Error(_))
    }

    /// Serialize to compact single-line JSON.
    ///
    /// Barring memory exhaustion this only fails if a custom serializer in the payload fails.
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|source| JsonRpcError::SerResponse {
            source,
            type_name: std::any::type_name::<Self>(),
        })
    }

    /// Minimal internal-error envelope, assembled without going through any serializer.
    ///
    /// Used when a response could not be serialized, so the peer still receives an answer.
    pub fn fallback_error(id: &Id) -> String {
        let id = match id {
            Id::Null => "null".to_string(),
            Id::Number(n) => n.to_string(),
            Id::Str(s) => JsonValue::string(s.as_str()).to_compact_string(),
        };
        format!(r#"{{"jsonrpc":"2.0","id":{id},"error":{{"code":-32603,"message":"Internal error"}}}}"#)
    }
}

/// Possible payloads of a JSON RPC response
///
/// This is an `untagged` enum so that serde will try to deserialize into each variant in order
/// until one succeeds.  This works because success responses should have `result` and error
/// responses should have `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponsePayload {
    /// Corresponds to failed JSON-RPC response with a error object with the field `error.
    Error(ErrorResponse),
    /// Corresponds to successful JSON-RPC response with the field `result`.
    Success(SuccessResponse),
}

impl ResponsePayload {
    /// Create a successful response payload
    pub fn success(result: JsonValue) -> Self {
        ResponsePayload::Success(SuccessResponse { result })
    }

    /// Create an error response payload
    pub fn error(details: impl Into<ErrorDetails>) -> Self {
        ResponsePayload::Error(details.into().into())
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            ResponsePayload::Error(ErrorResponse { error }) => Some(error.code),
            ResponsePayload::Success(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub result: JsonValue,
}

impl From<JsonValue> for SuccessResponse {
    fn from(result: JsonValue) -> Self {
        Self { result }
    }
}

/// [Failed JSON-RPC response object](https://www.jsonrpc.org/specification#error_object).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

impl From<ErrorDetails> for ErrorResponse {
    fn from(error: ErrorDetails) -> Self {
        Self { error }
    }
}

/// [JSON-RPC failed response error details](https://www.jsonrpc.org/specification#error_object).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Code
    pub code: ErrorCode,
    /// Message
    pub message: String,
    /// Optional data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

impl ErrorDetails {
    pub fn new(code: ErrorCode, message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self {
            code,
            message: message.into(),
            data: data.into(),
        }
    }

    pub fn parse_error(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::ParseError, message, data)
    }
    pub fn invalid_request(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message, data)
    }
    pub fn method_not_found(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::MethodNotFound, message, data)
    }
    pub fn invalid_params(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::InvalidParams, message, data)
    }
    pub fn internal_error(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::InternalError, message, data)
    }
    pub fn server_error(code: i32, message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::ServerError(code), message, data)
    }
}
