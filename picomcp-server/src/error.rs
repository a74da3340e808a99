use std::any::Any;
use std::net::SocketAddr;

use thiserror::Error;

pub type Result<T, E = ServerError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Failed to listen on {addr}")]
    Bind { addr: SocketAddr, source: std::io::Error },

    #[error("Connection limit of {max} sessions reached")]
    ConnectionLimit { max: usize },

    #[error("A tool named '{name}' is already registered")]
    DuplicateTool { name: String },

    #[error("Cannot register '{name}': the registry already holds the maximum of {max} tools")]
    TooManyTools { name: String, max: usize },

    #[error("The server is shutting down")]
    Cancelled,
}

/// Convert a panic payload into something printable.
pub(crate) fn panic_err_to_string(err: Box<dyn Any + Send>) -> String {
    if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}
