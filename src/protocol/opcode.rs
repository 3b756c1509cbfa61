//! WebSocket frame opcodes as defined in RFC 6455.

use crate::error::{Error, Result};

/// WebSocket frame opcode.
///
/// Defines the interpretation of the payload data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation frame (0x0), extending a fragmented message.
    Continuation = 0x0,

    /// Text frame (0x1). Payload must be valid UTF-8.
    Text = 0x1,

    /// Binary frame (0x2). Payload is arbitrary binary data.
    Binary = 0x2,

    /// Close frame (0x8). May contain status code and reason.
    Close = 0x8,

    /// Ping frame (0x9). Receiver must respond with a pong.
    Ping = 0x9,

    /// Pong frame (0xA). Response to a ping.
    Pong = 0xA,
}

impl OpCode {
    /// Create an `OpCode` from the low nibble of the first header byte.
    ///
    /// # Errors
    ///
    /// Returns `Error::FrameFormat` for the reserved values 0x3-0x7 and
    /// 0xB-0xF.
    pub fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            _ => Err(Error::FrameFormat("reserved opcode")),
        }
    }

    /// Convert to the raw nibble value.
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Control frames: close, ping, pong.
    #[inline]
    #[must_use]
    pub const fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    /// Data frames: continuation, text, binary.
    #[inline]
    #[must_use]
    pub const fn is_data(self) -> bool {
        matches!(self, OpCode::Continuation | OpCode::Text | OpCode::Binary)
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OpCode::Continuation => "continuation",
            OpCode::Text => "text",
            OpCode::Binary => "binary",
            OpCode::Close => "close",
            OpCode::Ping => "ping",
            OpCode::Pong => "pong",
        };
        write!(f, "{name}")
    }
}
