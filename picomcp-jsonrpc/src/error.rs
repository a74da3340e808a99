use std::time::Duration;

use thiserror::Error;

use crate::framing::FrameError;

pub type Result<T, E = JsonRpcError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum JsonRpcError {
    #[error("Invalid JSON")]
    ParseJson { source: serde_json::Error, json: String },

    #[error("Framing error")]
    Frame {
        #[from]
        source: FrameError,
    },

    #[error("Transport error")]
    Transport {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("Timed out after {timeout:?} sending to the remote peer")]
    SendTimeout { timeout: Duration },

    #[error("Error serializing {type_name} to JSON")]
    SerResponse {
        source: serde_json::Error,
        type_name: &'static str,
    },

    #[error("The connection to the remote peer is closed")]
    ConnectionClosed,
}
