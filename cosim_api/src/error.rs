//! Errors raised on the simulator side of the protocol.

use cosim_env::{CallError, ProtocolError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// The simulator itself rejected the request
    #[error("{0}")]
    Failed(String),

    #[error("Method {method}: bad argument {index}: {reason}")]
    BadArgument {
        method: String,
        index: usize,
        reason: String,
    },

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    /// A reverse call into the world failed
    #[error("World call failed: {0}")]
    Call(#[from] CallError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ApiError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}
