//! Turning one framed message into a JSON-RPC request, notification, or a reason to reject it.
//!
//! Parsing happens in two stages.  A cheap pre-filter looks only at the first few bytes: empty
//! messages are ignored, text that is obviously some other protocol (an HTTP client pointed at
//! the wrong port, an SSH banner) is flagged so the caller can drop the connection, and anything
//! that cannot possibly be a JSON object or array is rejected as a parse error without ever
//! reaching the JSON parser.  Only what survives is parsed into a [`JsonValue`] and checked
//! against the JSON-RPC 2.0 envelope rules.
use serde::Deserialize;
use thiserror::Error;

use crate::types::{ErrorDetails, Id, Notification, Request, Response};
use crate::value::JsonValue;
use crate::JsonRpcError;

/// Prefixes of the first line of an HTTP request or of common HTTP headers.
const HTTP_PREFIXES: &[&str] = &[
    "GET ",
    "POST ",
    "PUT ",
    "DELETE ",
    "HEAD ",
    "OPTIONS ",
    "PATCH ",
    "CONNECT ",
    "TRACE ",
    "Host:",
    "User-Agent:",
    "Accept:",
    "Accept-Encoding:",
    "Accept-Language:",
    "Connection:",
    "Cache-Control:",
    "Upgrade-Insecure-Requests:",
];

/// A well-formed message from the peer.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Request(Request),
    Notification(Notification),
    /// A response to a request we never send.  Callers only log these.
    Response { id: Id },
}

/// Why a message could not be treated as a JSON-RPC request or notification.
#[derive(Debug, Error)]
pub enum Rejection {
    #[error("Empty message")]
    Empty,

    #[error("Message looks like {protocol} traffic")]
    ForeignProtocol { protocol: &'static str },

    #[error("Message is not JSON")]
    NotJson,

    #[error("Malformed JSON")]
    Malformed { source: JsonRpcError },

    #[error("Batch requests are not supported")]
    Batch,

    #[error("Invalid request: {reason}")]
    InvalidRequest { id: Id, reason: String },
}

impl Rejection {
    /// Foreign-protocol input means the peer is not speaking JSON-RPC at all; answering it is
    /// pointless and the connection should be dropped.
    pub fn closes_connection(&self) -> bool {
        matches!(self, Rejection::ForeignProtocol { .. })
    }

    /// The error response owed to the peer, if any.
    pub fn error_response(&self) -> Option<Response> {
        match self {
            Rejection::Empty | Rejection::ForeignProtocol { .. } => None,
            Rejection::NotJson | Rejection::Malformed { .. } => {
                Some(Response::error(Id::Null, ErrorDetails::parse_error("Parse error", None)))
            }
            Rejection::Batch => Some(Response::error(
                Id::Null,
                ErrorDetails::invalid_request("Invalid Request", JsonValue::string("Batch requests are not supported")),
            )),
            Rejection::InvalidRequest { id, reason } => Some(Response::error(
                id.clone(),
                ErrorDetails::invalid_request("Invalid Request", JsonValue::string(reason.as_str())),
            )),
        }
    }
}

/// Classify the raw text of a message without parsing it.
fn prefilter(raw: &str) -> Result<(), Rejection> {
    let trimmed = raw.trim_start();
    match trimmed.as_bytes().first() {
        None => Err(Rejection::Empty),
        Some(b'{' | b'[') => Ok(()),
        Some(_) if HTTP_PREFIXES.iter().any(|prefix| trimmed.starts_with(prefix)) => {
            Err(Rejection::ForeignProtocol { protocol: "HTTP" })
        }
        Some(_) if trimmed.starts_with("SSH-") => Err(Rejection::ForeignProtocol { protocol: "SSH" }),
        Some(_) => Err(Rejection::NotJson),
    }
}

/// Parse one framed message into a JSON-RPC request or notification.
///
/// An `id` that is absent or `null` makes the message a notification, which is never answered.
pub fn parse_message(raw: &str) -> Result<Inbound, Rejection> {
    prefilter(raw)?;

    let value = JsonValue::parse(raw).map_err(|source| Rejection::Malformed { source })?;

    let object = match &value {
        JsonValue::Object(object) => object,
        JsonValue::Array(_) => return Err(Rejection::Batch),
        _ => return Err(invalid(Id::Null, "Request must be a JSON object")),
    };

    let id = match object.get("id") {
        None => None,
        Some(raw_id) => {
            let id = match raw_id {
                JsonValue::Number(_) => numeric_id(raw).or_else(|| Id::from_value(raw_id)),
                _ => Id::from_value(raw_id),
            };
            match id {
                Some(id) => Some(id),
                None => return Err(invalid(Id::Null, "'id' must be a string, an integer or null")),
            }
        }
    };
    let reply_id = id.clone().unwrap_or(Id::Null);

    match object.get("jsonrpc") {
        None => return Err(invalid(reply_id, "Missing 'jsonrpc' member")),
        Some(JsonValue::String(version)) if version == "2.0" => {}
        Some(_) => return Err(invalid(reply_id, "'jsonrpc' must be exactly \"2.0\"")),
    }

    let method = match object.get("method") {
        Some(JsonValue::String(method)) => method.clone(),
        Some(_) => return Err(invalid(reply_id, "'method' must be a string")),
        None if object.contains_key("result") || object.contains_key("error") => {
            return Ok(Inbound::Response { id: reply_id });
        }
        None => return Err(invalid(reply_id, "Missing 'method' member")),
    };

    let params = match object.get("params") {
        None => None,
        Some(params @ (JsonValue::Object(_) | JsonValue::Array(_))) => Some(params.clone()),
        Some(_) => return Err(invalid(reply_id, "'params' must be an object or an array")),
    };

    Ok(match id {
        None | Some(Id::Null) => Inbound::Notification(Notification { method, params }),
        Some(id) => Inbound::Request(Request { id, method, params }),
    })
}

/// Just the `id` member of an envelope, read straight from the message text.
#[derive(Deserialize)]
struct IdMember {
    #[serde(default)]
    id: Option<serde_json::Value>,
}

/// Re-read a numeric `id` from the raw text so that integers too large for an `f64` keep every
/// digit.  Returns `None` when the text can't be read this way (a duplicated `id` key, say).
fn numeric_id(raw: &str) -> Option<Id> {
    match serde_json::from_str::<IdMember>(raw) {
        Ok(IdMember {
            id: Some(serde_json::Value::Number(number)),
        }) => Id::from_number(&number),
        _ => None,
    }
}

fn invalid(id: Id, reason: &str) -> Rejection {
    Rejection::InvalidRequest {
        id,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use crate::types::ErrorCode;

    fn error_code(rejection: &Rejection) -> Option<ErrorCode> {
        rejection.error_response().and_then(|r| r.payload.error_code())
    }

    #[test]
    fn parses_request_with_string_id() {
        let inbound = parse_message(r#"{"jsonrpc":"2.0","id":"1","method":"initialize","params":{}}"#).unwrap();

        assert_matches!(inbound, Inbound::Request(Request { id: Id::Str(id), method, params: Some(params) }) => {
            assert_eq!(id, "1");
            assert_eq!(method, "initialize");
            assert!(params.is_object());
        });
    }

    #[test]
    fn parses_request_with_numeric_id_and_no_params() {
        let inbound = parse_message(r#"  {"jsonrpc":"2.0","id":7,"method":"ping"}"#).unwrap();
        assert_eq!(
            inbound,
            Inbound::Request(Request {
                id: Id::Number(7),
                method: "ping".into(),
                params: None
            })
        );
    }

    #[test]
    fn large_numeric_ids_are_echoed_exactly() {
        let inbound = parse_message(r#"{"jsonrpc":"2.0","id":9007199254740993,"method":"ping"}"#).unwrap();
        let Inbound::Request(request) = inbound else {
            panic!("expected a request, got {inbound:?}");
        };
        assert_eq!(request.id, Id::Number(9_007_199_254_740_993));

        let echoed = Response::success(request.id, JsonValue::object()).to_json_string().unwrap();
        assert_eq!(echoed, r#"{"jsonrpc":"2.0","id":9007199254740993,"result":{}}"#);
    }

    #[test]
    fn ids_outside_the_integer_range_are_invalid() {
        for raw in [
            r#"{"jsonrpc":"2.0","id":9223372036854775808,"method":"ping"}"#,
            r#"{"jsonrpc":"2.0","id":1.5,"method":"ping"}"#,
        ] {
            let rejection = parse_message(raw).unwrap_err();
            assert_matches!(&rejection, Rejection::InvalidRequest { id: Id::Null, .. }, "{raw}");
        }
    }

    #[test]
    fn duplicated_id_falls_back_to_the_last_value() {
        assert_matches!(
            parse_message(r#"{"jsonrpc":"2.0","id":1,"id":2,"method":"ping"}"#),
            Ok(Inbound::Request(Request { id: Id::Number(2), .. }))
        );
    }

    #[test]
    fn missing_or_null_id_is_a_notification() {
        assert_matches!(
            parse_message(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#),
            Ok(Inbound::Notification(Notification { method, .. })) if method == "notifications/initialized"
        );
        assert_matches!(
            parse_message(r#"{"jsonrpc":"2.0","id":null,"method":"ping"}"#),
            Ok(Inbound::Notification(_))
        );
    }

    #[test]
    fn responses_from_the_peer_are_recognized() {
        assert_matches!(
            parse_message(r#"{"jsonrpc":"2.0","id":3,"result":{}}"#),
            Ok(Inbound::Response { id: Id::Number(3) })
        );
    }

    #[test]
    fn http_and_ssh_traffic_close_the_connection() {
        for raw in ["GET / HTTP/1.1", "POST /mcp HTTP/1.1", "Host: device.local", "User-Agent: curl/8.0"] {
            let rejection = parse_message(raw).unwrap_err();
            assert_matches!(rejection, Rejection::ForeignProtocol { protocol: "HTTP" }, "{raw}");
            assert!(rejection.closes_connection());
            assert!(rejection.error_response().is_none());
        }

        assert_matches!(
            parse_message("SSH-2.0-OpenSSH_9.6"),
            Err(Rejection::ForeignProtocol { protocol: "SSH" })
        );
    }

    #[test]
    fn non_json_text_is_a_parse_error_without_parsing() {
        let rejection = parse_message("hello there").unwrap_err();
        assert_matches!(rejection, Rejection::NotJson);
        assert!(!rejection.closes_connection());
        assert_eq!(error_code(&rejection), Some(ErrorCode::ParseError));
    }

    #[test]
    fn malformed_json_is_a_parse_error_with_null_id() {
        let rejection = parse_message(r#"{"jsonrpc":"2.0","id":1,"method":"#).unwrap_err();
        assert_matches!(rejection, Rejection::Malformed { .. });

        let response = rejection.error_response().unwrap();
        assert_eq!(response.id, Id::Null);
        assert_eq!(response.payload.error_code(), Some(ErrorCode::ParseError));
    }

    #[test]
    fn whitespace_only_is_ignored() {
        let rejection = parse_message("  \t ").unwrap_err();
        assert_matches!(rejection, Rejection::Empty);
        assert!(rejection.error_response().is_none());
    }

    #[test]
    fn batches_are_invalid_requests() {
        let rejection = parse_message(r#"[{"jsonrpc":"2.0","id":1,"method":"ping"}]"#).unwrap_err();
        assert_matches!(rejection, Rejection::Batch);
        assert_eq!(error_code(&rejection), Some(ErrorCode::InvalidRequest));
    }

    #[test]
    fn envelope_violations_are_invalid_requests_that_keep_the_id() {
        let cases = [
            (r#"{"id":"a","method":"ping"}"#, Id::Str("a".into())),
            (r#"{"jsonrpc":"1.0","id":"b","method":"ping"}"#, Id::Str("b".into())),
            (r#"{"jsonrpc":2.0,"id":3,"method":"ping"}"#, Id::Number(3)),
            (r#"{"jsonrpc":"2.0","id":4}"#, Id::Number(4)),
            (r#"{"jsonrpc":"2.0","id":5,"method":42}"#, Id::Number(5)),
            (r#"{"jsonrpc":"2.0","id":6,"method":"ping","params":"nope"}"#, Id::Number(6)),
            (r#"{"jsonrpc":"2.0","id":true,"method":"ping"}"#, Id::Null),
            (r#"{"jsonrpc":"2.0","id":1.5,"method":"ping"}"#, Id::Null),
        ];

        for (raw, expected_id) in cases {
            let rejection = parse_message(raw).unwrap_err();
            assert_matches!(&rejection, Rejection::InvalidRequest { id, .. } if *id == expected_id, "{raw}");

            let response = rejection.error_response().unwrap();
            assert_eq!(response.id, expected_id);
            assert_eq!(response.payload.error_code(), Some(ErrorCode::InvalidRequest));
        }
    }

    #[test]
    fn arrays_and_empty_objects_are_rejected() {
        assert_matches!(
            parse_message(r#"["not", "an", "object"]"#),
            Err(Rejection::Batch)
        );
        assert_matches!(parse_message(r#"{}"#), Err(Rejection::InvalidRequest { id: Id::Null, .. }));
    }
}
