//! The MCP method handlers.  Each one builds an [`Outcome`]; none of them touch the transport.
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use picomcp_jsonrpc::{ErrorDetails, Id, JsonValue, Transport};

use super::{ClientInfo, Outcome, Session, SessionState};
use crate::error::panic_err_to_string;
use crate::tools::{ToolContext, ToolError};

impl<T: Transport> Session<T> {
    /// `initialize`: validate, move to `Initializing`, build the result, and commit to
    /// `Initialized` once the result has been sent.
    ///
    /// A repeated `initialize` on a ready session gets the same answer and changes nothing.
    pub(super) fn initialize(&mut self, params: Option<&JsonValue>) -> Outcome {
        let params = match params {
            None => None,
            Some(JsonValue::Object(object)) => Some(object),
            Some(other) => {
                return Outcome::error(ErrorDetails::invalid_params(
                    format!("initialize params must be an object, got {}", other.type_name()),
                    None,
                ));
            }
        };

        let member = |key: &str| params.and_then(|p| p.get(key));
        for key in ["clientInfo", "capabilities"] {
            if let Some(value) = member(key) {
                if !value.is_object() {
                    return Outcome::error(ErrorDetails::invalid_params(
                        format!("'{key}' must be an object, got {}", value.type_name()),
                        None,
                    ));
                }
            }
        }

        let client_info = member("clientInfo");
        let client = ClientInfo {
            name: client_info.and_then(|c| c.get("name")).map(JsonValue::as_string).unwrap_or_default(),
            version: client_info
                .and_then(|c| c.get("version"))
                .map(JsonValue::as_string)
                .unwrap_or_default(),
            capabilities: member("capabilities").cloned().unwrap_or_else(JsonValue::object),
            protocol_version: member("protocolVersion").filter(|v| v.is_string()).map(JsonValue::as_string),
        };

        let state = self.handle.state();
        if state.is_ready() {
            tracing::debug!(%state, client = %client.name, "Repeated initialize; answering without changing state");
            return Outcome::ok(self.initialize_result());
        }

        tracing::info!(
            client_name = %client.name,
            client_version = %client.version,
            requested_protocol_version = ?client.protocol_version,
            "Client is initializing"
        );
        if self.handle.client_info.set(client).is_err() {
            tracing::debug!("Client info was recorded by an earlier initialize attempt");
        }

        self.transition(SessionState::Initializing);
        Outcome::ok(self.initialize_result()).committing(SessionState::Initialized)
    }

    fn initialize_result(&self) -> JsonValue {
        let config = &self.config;
        let server_info = JsonValue::object()
            .with("name", config.server_info.name.as_str())
            .with("version", config.server_info.version.as_str());
        let capabilities = JsonValue::object().with(
            "tools",
            JsonValue::object().with("listChanged", config.session.tools_list_changed),
        );

        let mut result = JsonValue::object()
            .with("protocolVersion", config.protocol_version.as_str())
            .with("serverInfo", server_info)
            .with("capabilities", capabilities);
        if let Some(instructions) = &config.instructions {
            result.set("instructions", instructions.as_str());
        }
        result
    }

    /// `tools/list`, paginated when a page size is configured.
    pub(super) fn list_tools(&self, params: Option<&JsonValue>) -> Outcome {
        let tools = self.tools.list();

        let Some(page_size) = self.config.session.tools_page_size else {
            let all = tools.iter().map(|tool| tool.to_json()).collect::<Vec<_>>();
            return Outcome::ok(JsonValue::object().with("tools", all));
        };

        let start = match params.and_then(|p| p.get("cursor")) {
            None | Some(JsonValue::Null) => 0,
            Some(JsonValue::String(cursor)) => match cursor.parse::<usize>() {
                Ok(start) if start <= tools.len() => start,
                _ => return Outcome::error(ErrorDetails::invalid_params("Invalid cursor", None)),
            },
            Some(_) => return Outcome::error(ErrorDetails::invalid_params("'cursor' must be a string", None)),
        };
        let end = start.saturating_add(page_size).min(tools.len());

        let page = tools[start..end].iter().map(|tool| tool.to_json()).collect::<Vec<_>>();
        let mut result = JsonValue::object().with("tools", page);
        if end < tools.len() {
            result.set("nextCursor", end.to_string());
        }
        Outcome::ok(result)
    }

    /// `tools/call`: find the tool, check its arguments, and run it under the tool timeout.
    pub(super) async fn call_tool(&mut self, id: &Id, params: Option<JsonValue>) -> Outcome {
        let params = params.unwrap_or_default();

        let name = match params.get("name") {
            Some(JsonValue::String(name)) => name.clone(),
            Some(other) => {
                return Outcome::error(ErrorDetails::invalid_params(
                    format!("'name' must be a string, got {}", other.type_name()),
                    None,
                ));
            }
            None => return Outcome::error(ErrorDetails::invalid_params("Missing required parameter: name", None)),
        };

        let Some(tool) = self.tools.get(&name) else {
            return Outcome::error(ErrorDetails::method_not_found(format!("Unknown tool: {name}"), None));
        };

        let arguments = match params.get("arguments") {
            None | Some(JsonValue::Null) => JsonValue::object(),
            Some(arguments) => arguments.clone(),
        };
        if let Err(e) = tool.validate_arguments(&arguments) {
            tracing::debug!(tool = %name, err = %e, "Tool arguments rejected");
            return Outcome::error(e);
        }

        let tool_timeout = self.config.session.tool_timeout;
        let cancellation_token = self.handle.cancellation_token().child_token();
        let context = ToolContext::new(id.clone(), cancellation_token.clone());

        tracing::debug!(tool = %name, "Invoking tool");
        let invocation = AssertUnwindSafe(tool.invoke(arguments, context)).catch_unwind();
        let result = match tokio::time::timeout(tool_timeout, invocation).await {
            Err(_elapsed) => {
                cancellation_token.cancel();
                Err(ToolError::TimedOut(tool_timeout))
            }
            Ok(Err(panic)) => {
                tracing::error!(tool = %name, panic = %panic_err_to_string(panic), "Tool panicked");
                Err(ToolError::failed("tool panicked"))
            }
            Ok(Ok(result)) => result,
        };

        match result {
            Ok(output) => {
                tracing::debug!(tool = %name, is_error = output.is_error, "Tool finished");
                Outcome::ok(output.to_json())
            }
            Err(e) => {
                tracing::debug!(tool = %name, err = %e, "Tool failed");
                Outcome::error(e)
            }
        }
    }
}
