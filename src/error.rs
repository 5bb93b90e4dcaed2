//! Error taxonomy for streaming sessions.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StreamError>;

/// Everything that can go wrong between accepting a viewer and pushing its frames.
///
/// Only [`StreamError::Transport`] ends the session; the others end at most the
/// running stream and leave the connection open.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Bad or missing password before a privileged command
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Capture device unavailable or permission denied
    #[error("screen capture unavailable: {0}")]
    Capture(String),

    /// Invalid dimensions/quality or codec failure
    #[error("encode failed: {0}")]
    Encode(String),

    /// The peer is gone
    #[error("transport closed: {0}")]
    Transport(String),

    /// Malformed or unrecognised input message
    #[error("{0}")]
    Protocol(String),
}

impl StreamError {
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(self, StreamError::Transport(_))
    }
}
