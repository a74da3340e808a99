//! Tools: what they look like to a session, and the registry that holds them.
//!
//! A tool is a record, not a trait object hierarchy.  [`ToolDescriptor`] bundles a name, a
//! description, a JSON Schema for the arguments, and an async callback.  Adding a tool means
//! registering another descriptor.
//!
//! The [`ToolRegistry`] is built at startup and shared by every session through an `Arc`.  It is
//! read on every `tools/list` and `tools/call`, and only written when tools are registered or
//! removed, so it sits behind a `RwLock`.
use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use picomcp_jsonrpc::{ErrorDetails, Id, JsonValue};
use thiserror::Error;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::{Result, ServerError, router, schema};

/// Upper bound on the number of tools a registry holds by default.
pub const MAX_TOOLS: usize = 16;

/// The future a tool invocation returns.
pub type ToolFuture = BoxFuture<'static, Result<ToolOutput, ToolError>>;

type InvokeFn = dyn Fn(JsonValue, ToolContext) -> ToolFuture + Send + Sync;

/// How a tool invocation can fail.
///
/// Each variant maps onto one JSON-RPC error code; see the `From<ToolError> for ErrorDetails` impl.
#[derive(Debug, Error)]
pub enum ToolError {
    /// Arguments failed validation.  Reported as Invalid Params.
    #[error("{0}")]
    InvalidArguments(String),

    /// The tool ran and failed.  Reported as Internal Error with this detail.
    #[error("{0}")]
    Failed(String),

    /// The tool noticed cancellation and stopped.
    #[error("Request cancelled")]
    Cancelled,

    /// The tool did not finish in time and was cancelled.
    #[error("Tool did not finish within {0:?}")]
    TimedOut(Duration),
}

impl ToolError {
    pub fn failed(message: impl fmt::Display) -> Self {
        Self::Failed(message.to_string())
    }
}

impl From<ToolError> for ErrorDetails {
    fn from(error: ToolError) -> Self {
        match error {
            ToolError::InvalidArguments(message) => ErrorDetails::invalid_params(message, None),
            ToolError::Failed(detail) => {
                ErrorDetails::internal_error(format!("Tool execution failed: {detail}"), None)
            }
            ToolError::Cancelled => router::request_cancelled(),
            ToolError::TimedOut(_) => router::request_timeout(),
        }
    }
}

/// Per-call context handed to a tool.
#[derive(Clone, Debug)]
pub struct ToolContext {
    request_id: Id,
    cancellation_token: CancellationToken,
}

impl ToolContext {
    pub fn new(request_id: Id, cancellation_token: CancellationToken) -> Self {
        Self {
            request_id,
            cancellation_token,
        }
    }

    /// Id of the `tools/call` request being served.
    pub fn request_id(&self) -> &Id {
        &self.request_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Completes when the call is cancelled, either because the session is going away or because
    /// the call ran out of time.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancellation_token.cancelled()
    }

    /// A safe point for long-running tools: returns [`ToolError::Cancelled`] once cancellation has
    /// been requested.
    pub fn checkpoint(&self) -> Result<(), ToolError> {
        if self.is_cancelled() {
            Err(ToolError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// One item of a tool result's `content` array.
#[derive(Clone, Debug, PartialEq)]
pub enum Content {
    Text(String),
}

impl Content {
    pub fn to_json(&self) -> JsonValue {
        match self {
            Content::Text(text) => JsonValue::object().with("type", "text").with("text", text.as_str()),
        }
    }
}

/// What a successful tool invocation returns.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ToolOutput {
    pub content: Vec<Content>,
    /// The tool ran but wants the caller to see its output as a failure.
    pub is_error: bool,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![Content::Text(text.into())],
            is_error: false,
        }
    }

    pub fn error_text(text: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::text(text)
        }
    }

    /// The `tools/call` result object.
    pub fn to_json(&self) -> JsonValue {
        let content = self.content.iter().map(Content::to_json).collect::<Vec<_>>();
        let mut result = JsonValue::object().with("content", content);
        if self.is_error {
            result.set("isError", true);
        }
        result
    }
}

/// A registered tool.  Immutable once built.
#[derive(Clone)]
pub struct ToolDescriptor {
    name: String,
    description: String,
    input_schema: JsonValue,
    invoke: Arc<InvokeFn>,
}

impl ToolDescriptor {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: impl Into<JsonValue>,
        invoke: F,
    ) -> Self
    where
        F: Fn(JsonValue, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolOutput, ToolError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: input_schema.into(),
            invoke: Arc::new(move |args: JsonValue, context: ToolContext| invoke(args, context).boxed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn input_schema(&self) -> &JsonValue {
        &self.input_schema
    }

    /// The `tools/list` entry for this tool.
    pub fn to_json(&self) -> JsonValue {
        JsonValue::object()
            .with("name", self.name.as_str())
            .with("description", self.description.as_str())
            .with("inputSchema", self.input_schema.clone())
    }

    pub fn validate_arguments(&self, args: &JsonValue) -> Result<(), ToolError> {
        schema::validate_arguments(&self.input_schema, args).map_err(ToolError::InvalidArguments)
    }

    /// Run the tool.  Arguments are passed as-is; call [`Self::validate_arguments`] first.
    pub fn invoke(&self, args: JsonValue, context: ToolContext) -> ToolFuture {
        (self.invoke)(args, context)
    }
}

impl fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("input_schema", &self.input_schema)
            .finish_non_exhaustive()
    }
}

/// Process-wide set of tools, listed in registration order.
#[derive(Debug)]
pub struct ToolRegistry {
    max_tools: usize,
    tools: RwLock<Vec<Arc<ToolDescriptor>>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::with_max_tools(MAX_TOOLS)
    }

    pub fn with_max_tools(max_tools: usize) -> Self {
        Self {
            max_tools,
            tools: RwLock::new(Vec::new()),
        }
    }

    /// Add a tool.  Names are unique; registering a name twice is an error.
    pub fn register(&self, tool: ToolDescriptor) -> Result<()> {
        let mut tools = self.tools.write().unwrap_or_else(PoisonError::into_inner);

        if tools.iter().any(|t| t.name == tool.name) {
            return Err(ServerError::DuplicateTool { name: tool.name });
        }
        if tools.len() >= self.max_tools {
            return Err(ServerError::TooManyTools {
                name: tool.name,
                max: self.max_tools,
            });
        }

        tracing::debug!(tool = %tool.name, "Registered tool");
        tools.push(Arc::new(tool));
        Ok(())
    }

    /// Remove a tool.  Returns `false` if no tool had that name.
    pub fn unregister(&self, name: &str) -> bool {
        let mut tools = self.tools.write().unwrap_or_else(PoisonError::into_inner);
        let before = tools.len();
        tools.retain(|t| t.name != name);
        before != tools.len()
    }

    pub fn get(&self, name: &str) -> Option<Arc<ToolDescriptor>> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|t| t.name == name)
            .cloned()
    }

    /// Snapshot of every tool, in registration order.
    pub fn list(&self) -> Vec<Arc<ToolDescriptor>> {
        self.tools.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.list().iter().map(|t| t.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
