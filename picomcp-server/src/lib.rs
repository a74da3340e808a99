//! The MCP half of `picomcp`: sessions, tools, and the TCP server that ties them together.
//!
//! A [`Server`] owns a [`ServerConfig`], a shared [`ToolRegistry`], and a [`SessionRegistry`]
//! of the sessions it is running.  Each accepted connection becomes a [`Session`] running in its
//! own task, which walks the MCP lifecycle (`initialize`, then `tools/list` and `tools/call`)
//! over a [`picomcp_jsonrpc::Peer`].
//!
//! ```no_run
//! # async fn run() -> picomcp_server::Result<()> {
//! use picomcp_server::{Server, ServerConfig, ToolDescriptor, ToolOutput, ToolRegistry};
//! use picomcp_jsonrpc::JsonValue;
//!
//! let tools = ToolRegistry::new();
//! tools.register(ToolDescriptor::new(
//!     "uptime",
//!     "Seconds since boot",
//!     JsonValue::object().with("type", "object"),
//!     |_args, _context| async move { Ok(ToolOutput::text("42")) },
//! ))?;
//!
//! let server = Server::new(ServerConfig::default(), tools)?;
//! let listener = server.bind().await?;
//! server.serve(listener).await;
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod registry;
pub mod router;
mod schema;
mod server;
mod session;
#[cfg(test)]
pub mod testing;
mod tools;

pub use config::{ServerConfig, ServerInfo, SessionConfig};
pub use error::{Result, ServerError};
pub use registry::SessionRegistry;
pub use router::{McpMethod, McpNotification, PROTOCOL_VERSION};
pub use schema::validate_arguments;
pub use server::{RunningSession, Server};
pub use session::{
    BudgetExceeded, ClientInfo, CloseReason, ErrorBudget, Session, SessionHandle, SessionState,
};
pub use tools::{
    Content, MAX_TOOLS, ToolContext, ToolDescriptor, ToolError, ToolFuture, ToolOutput, ToolRegistry,
};
