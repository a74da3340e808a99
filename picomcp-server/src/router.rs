//! Deciding what to do with a request before any handler runs.
//!
//! Routing here is a pure function of the method name and the session state: the handful of MCP
//! methods this server knows are a closed set, so there is no handler table to look things up
//! in.  A method is either dispatched to its handler or rejected with the error that explains
//! why.
use picomcp_jsonrpc::ErrorDetails;
use strum::{Display, EnumString, IntoStaticStr};

use crate::session::SessionState;

/// MCP protocol revision this server implements.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// A request other than `initialize` or `ping` arrived before the handshake completed.
pub const NOT_INITIALIZED: i32 = -32002;

/// The request was cancelled before it produced a result.
pub const REQUEST_CANCELLED: i32 = -32004;

/// The request did not finish in time.
pub const REQUEST_TIMEOUT: i32 = -32005;

pub fn not_initialized() -> ErrorDetails {
    ErrorDetails::server_error(NOT_INITIALIZED, "Server not initialized", None)
}

pub fn request_cancelled() -> ErrorDetails {
    ErrorDetails::server_error(REQUEST_CANCELLED, "Request cancelled", None)
}

pub fn request_timeout() -> ErrorDetails {
    ErrorDetails::server_error(REQUEST_TIMEOUT, "Request timeout", None)
}

/// Request methods this server answers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString, IntoStaticStr)]
pub enum McpMethod {
    #[strum(serialize = "initialize")]
    Initialize,
    #[strum(serialize = "tools/list")]
    ToolsList,
    #[strum(serialize = "tools/call")]
    ToolsCall,
    #[strum(serialize = "ping")]
    Ping,
}

impl McpMethod {
    /// Whether the method may be called before the handshake completes.
    pub fn allowed_before_initialize(self) -> bool {
        matches!(self, McpMethod::Initialize | McpMethod::Ping)
    }
}

/// Notifications this server acts on.  Any other notification is ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString, IntoStaticStr)]
pub enum McpNotification {
    #[strum(serialize = "notifications/initialized")]
    Initialized,
    #[strum(serialize = "notifications/cancelled")]
    Cancelled,
}

/// The routing decision for one request.
#[derive(Clone, Debug)]
pub enum Route {
    Dispatch(McpMethod),
    Reject(ErrorDetails),
}

/// Route a request by method name given the session's current state.
///
/// Unknown methods are always Method Not Found, whatever the state.  Known methods other than
/// `initialize` and `ping` require a completed handshake.
pub fn route(method: &str, state: SessionState) -> Route {
    let Ok(method) = method.parse::<McpMethod>() else {
        return Route::Reject(ErrorDetails::method_not_found(
            "Method not found",
            picomcp_jsonrpc::JsonValue::string(method),
        ));
    };

    if method.allowed_before_initialize() || state.is_ready() {
        Route::Dispatch(method)
    } else {
        Route::Reject(not_initialized())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use picomcp_jsonrpc::ErrorCode;

    #[test]
    fn method_names_round_trip() {
        assert_eq!("tools/call".parse::<McpMethod>().unwrap(), McpMethod::ToolsCall);
        assert_eq!(McpMethod::ToolsList.to_string(), "tools/list");
        assert_eq!(
            "notifications/initialized".parse::<McpNotification>().unwrap(),
            McpNotification::Initialized
        );
        assert!("tools/delete".parse::<McpMethod>().is_err());
    }

    #[test]
    fn unknown_method_is_not_found_in_every_state() {
        for state in [SessionState::Uninitialized, SessionState::Active] {
            assert_matches!(route("resources/list", state), Route::Reject(details) => {
                assert_eq!(details.code, ErrorCode::MethodNotFound);
                assert_eq!(details.data.as_ref().map(|d| d.as_str()), Some("resources/list"));
            });
        }
    }

    #[test]
    fn tools_require_handshake() {
        assert_matches!(route("tools/list", SessionState::Uninitialized), Route::Reject(details) => {
            assert_eq!(details.code, ErrorCode::ServerError(NOT_INITIALIZED));
            assert_eq!(details.message, "Server not initialized");
        });
        assert_matches!(route("tools/call", SessionState::Initializing), Route::Reject(_));

        assert_matches!(route("tools/list", SessionState::Initialized), Route::Dispatch(McpMethod::ToolsList));
        assert_matches!(route("tools/call", SessionState::Active), Route::Dispatch(McpMethod::ToolsCall));
    }

    #[test]
    fn initialize_and_ping_are_always_routed() {
        for state in [SessionState::Uninitialized, SessionState::Initialized, SessionState::Active] {
            assert_matches!(route("initialize", state), Route::Dispatch(McpMethod::Initialize));
            assert_matches!(route("ping", state), Route::Dispatch(McpMethod::Ping));
        }
    }
}
