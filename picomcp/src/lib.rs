//! `picomcp`: a small Model Context Protocol server speaking JSON-RPC 2.0 over raw TCP.
//!
//! This crate re-exports the protocol layer ([`jsonrpc`]) and, with the default `server` feature,
//! the MCP session and server layer ([`server`]).  The `picomcp` binary runs a server with the
//! tools in [`demo_tools`].
pub use picomcp_jsonrpc as jsonrpc;
#[cfg(feature = "server")]
pub use picomcp_server as server;

#[cfg(feature = "server")]
pub mod demo_tools;
