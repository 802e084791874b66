//! Error types for the cosim wire protocol.

use thiserror::Error;

/// Errors that terminate a single connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Underlying socket or stream failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame payload is not a valid `[type, id, content]` message
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Length prefix exceeds [`crate::MAX_FRAME_LEN`]
    #[error("Frame of {0} bytes exceeds the frame size limit")]
    FrameTooLarge(usize),

    /// A reply arrived for a message id with no outstanding request
    #[error("Unexpected message id: {0}")]
    UnexpectedMessageId(u64),

    /// The peer closed the connection (or it was closed locally)
    #[error("Connection closed")]
    ConnectionClosed,

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl ProtocolError {
    /// Creates a malformed-frame error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedFrame(msg.into())
    }
}

/// Outcome of a failed request issued through an [`crate::Endpoint`].
#[derive(Debug, Error)]
pub enum CallError {
    /// The peer answered with a Failure message
    #[error("Remote failure: {0}")]
    Remote(String),

    /// The peer answered with a value of the wrong shape
    #[error("Invalid reply: {0}")]
    InvalidReply(String),

    /// The connection failed before a reply arrived
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<serde_json::Error> for CallError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidReply(err.to_string())
    }
}
