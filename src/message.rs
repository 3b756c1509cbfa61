//! Message kinds, close status codes and terminal connection state.

/// Kind of a WebSocket data message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// A text message. The payload must be valid UTF-8.
    Text,
    /// A binary message. The payload is arbitrary bytes.
    Binary,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Text => write!(f, "text"),
            MessageKind::Binary => write!(f, "binary"),
        }
    }
}

/// WebSocket close status code per RFC 6455 Section 7.4.
///
/// The two pseudo-codes [`Status::NoStatus`] (1005) and
/// [`Status::Dropped`] (1006) are never sent on the wire: 1005 stands for
/// a close frame with an empty body, 1006 for a connection that was
/// dropped without a close frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[non_exhaustive]
pub enum Status {
    /// Normal closure (1000).
    #[default]
    Normal,
    /// Going away (1001). Endpoint is shutting down or navigating away.
    GoingAway,
    /// Protocol error (1002).
    ProtocolError,
    /// Unsupported data (1003). Endpoint received a kind it cannot handle.
    Unsupported,
    /// No status present (1005). Pseudo-code: close frame had no body.
    NoStatus,
    /// Abnormal closure (1006). Pseudo-code: connection dropped.
    Dropped,
    /// Invalid payload data (1007), e.g. non-UTF-8 in a text message.
    InvalidData,
    /// Policy violation (1008).
    PolicyViolation,
    /// Message too big (1009).
    TooBig,
    /// Mandatory extension (1010). Sent by clients only.
    MandatoryExtension,
    /// Internal server error (1011).
    InternalError,
    /// Any other code. Applications use 3000-4999.
    Other(u16),
}

impl Status {
    /// Create a `Status` from its numeric value.
    #[must_use]
    pub const fn from_u16(code: u16) -> Self {
        match code {
            1000 => Status::Normal,
            1001 => Status::GoingAway,
            1002 => Status::ProtocolError,
            1003 => Status::Unsupported,
            1005 => Status::NoStatus,
            1006 => Status::Dropped,
            1007 => Status::InvalidData,
            1008 => Status::PolicyViolation,
            1009 => Status::TooBig,
            1010 => Status::MandatoryExtension,
            1011 => Status::InternalError,
            other => Status::Other(other),
        }
    }

    /// Get the numeric value of this status code.
    #[must_use]
    pub const fn as_u16(&self) -> u16 {
        match self {
            Status::Normal => 1000,
            Status::GoingAway => 1001,
            Status::ProtocolError => 1002,
            Status::Unsupported => 1003,
            Status::NoStatus => 1005,
            Status::Dropped => 1006,
            Status::InvalidData => 1007,
            Status::PolicyViolation => 1008,
            Status::TooBig => 1009,
            Status::MandatoryExtension => 1010,
            Status::InternalError => 1011,
            Status::Other(code) => *code,
        }
    }

    /// Check whether a server may put this code into a close frame.
    ///
    /// Server-sendable codes are 1000-1003, 1007-1009, 1011 and the
    /// application range 3000-4999. 1010 is reserved for clients; 1004,
    /// 1012-2999 and anything at or above 5000 are invalid.
    #[must_use]
    pub const fn is_valid_to_send(&self) -> bool {
        matches!(
            self.as_u16(),
            1000..=1003 | 1007..=1009 | 1011 | 3000..=4999
        )
    }

    /// Check whether this code is acceptable inside a close frame sent by
    /// a client. Same set as [`is_valid_to_send`](Status::is_valid_to_send)
    /// plus 1010.
    #[must_use]
    pub const fn is_valid_from_peer(&self) -> bool {
        matches!(
            self.as_u16(),
            1000..=1003 | 1007..=1011 | 3000..=4999
        )
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

/// Final classification of how a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// The server initiated the close handshake.
    ServerClosed,
    /// The client sent a close frame first.
    ClientClosed,
    /// The peer violated the framing protocol.
    ProtocolViolation,
    /// A receive call encountered an unexpected message kind and the
    /// connection was aborted with status 1003.
    WrongMessageType,
    /// The connection dropped without a close frame.
    ConnDropped,
}

/// Terminal state of a connection, reported by [`wait`](crate::Conn::wait).
///
/// `peer_status` reflects the peer's close frame verbatim, or
/// [`Status::NoStatus`] if the close frame had an empty body, or
/// [`Status::Dropped`] if no close frame arrived at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Terminal {
    /// Why the connection ended.
    pub reason: CloseReason,
    /// Status code from the peer's close frame, or a pseudo-code.
    pub peer_status: Status,
    /// Reason text from the peer's close frame, if any.
    pub peer_message: String,
}
