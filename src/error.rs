//! Error types for the WebSocket endpoint.
//!
//! Protocol violations are fatal to the connection and terminate the
//! reader; errors on individual send/receive calls surface to that call
//! only.

use thiserror::Error;

/// Result type alias for WebSocket operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during WebSocket operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The connection has been closed (by either side) and can no longer
    /// be used. Returned uniformly once shutdown has begun.
    #[error("connection closed")]
    ConnClosed,

    /// A receive expected one message kind and a different one arrived.
    /// The connection is aborted with status 1003.
    #[error("invalid message type")]
    MessageType,

    /// An invalid status code was supplied to [`close`](crate::Conn::close).
    /// Valid codes are the server-sendable set plus 1005 ("no status").
    #[error("invalid status code: {0}")]
    StatusCode(u16),

    /// A message exceeded the caller-supplied bound, or a close reason
    /// exceeded 123 bytes. For text receives the prefix that fit is
    /// attached, truncated at a character boundary.
    #[error("message too large")]
    TooLarge(Option<String>),

    /// The peer sent a malformed frame. Drives reader termination with
    /// reason [`CloseReason::ProtocolViolation`](crate::CloseReason::ProtocolViolation).
    #[error("invalid frame format: {0}")]
    FrameFormat(&'static str),

    /// Invalid UTF-8 in a text message or close reason.
    #[error("invalid UTF-8 in text payload")]
    InvalidUtf8,

    /// The opening handshake failed.
    #[error("websocket handshake failed: {0}")]
    Handshake(String),

    /// A select or broadcast operation was cancelled by its signal.
    #[error("operation cancelled")]
    Cancelled,

    /// I/O error on the underlying stream.
    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(_: std::str::Utf8Error) -> Self {
        Error::InvalidUtf8
    }
}
