//! The protocol-generic half of `picomcp`: a JSON value model, JSON-RPC 2.0 envelopes, message
//! framing, and the transport abstraction a session talks over.
//!
//! Nothing in this crate knows about MCP methods, sessions, or tools.  That lives one level up in
//! `picomcp-server`.
//!
//! The data path for an inbound message is: [`Transport`] bytes are accumulated by a [`Peer`],
//! split into frames by [`FrameCodec`], and classified by [`parse_message`] into a [`Request`],
//! a [`Notification`], or a [`Rejection`] that says how to answer.  Responses travel back as
//! [`Response`] values serialized to a single line and framed by the same codec.

mod error;
mod framing;
mod request;
#[cfg(test)]
pub mod testing;
mod transport;
mod types;
mod value;

pub use error::{JsonRpcError, Result};
pub use framing::{DEFAULT_MAX_FRAME_LEN, FrameCodec, FrameError, Framing};
pub use request::{Inbound, Rejection, parse_message};
pub use transport::{Peer, READ_CHUNK_LEN, ReadOutcome, Received, StreamTransport, Transport};
pub use types::{
    ErrorCode, ErrorDetails, ErrorResponse, Id, Notification, Request, Response, ResponsePayload,
    SuccessResponse, TwoPointZero,
};
pub use value::{JsonObject, JsonValue};
