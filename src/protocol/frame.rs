//! WebSocket frame headers (RFC 6455 Section 5.2).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |                 Masking key (if MASK set)                     |
//! +---------------------------------------------------------------+
//! |                       Payload data                            |
//! +---------------------------------------------------------------+
//! ```
//!
//! Payloads are pumped separately by the reader; this module only deals
//! in headers. Incoming headers are decoded straight off the stream, so
//! arbitrarily large messages never have to fit in memory.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};
use crate::protocol::OpCode;

/// Maximum encoded header size for server-sent frames (no mask key).
pub const MAX_HEADER_SIZE: usize = 10;

/// Maximum payload size for control frames (RFC 6455).
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Decoded header of a client-sent frame.
///
/// Client frames are always masked; the unmasking key is part of the
/// header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Final fragment flag.
    pub fin: bool,
    /// Frame opcode.
    pub opcode: OpCode,
    /// Payload length in bytes.
    pub length: u64,
    /// Masking key.
    pub mask: [u8; 4],
}

impl FrameHeader {
    /// Read and validate a frame header from the stream.
    ///
    /// # Errors
    ///
    /// - `Error::FrameFormat` on reserved bits, reserved opcodes, a
    ///   missing mask bit, a length with the most significant bit set, or
    ///   a fragmented/oversized control frame
    /// - `Error::Io` when the stream ends or fails mid-header
    pub async fn read_from<R>(r: &mut R) -> Result<FrameHeader>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; 8];
        r.read_exact(&mut buf[..2]).await?;

        let fin = buf[0] & 0x80 != 0;
        if buf[0] & 0x70 != 0 {
            return Err(Error::FrameFormat("reserved bits set"));
        }
        let opcode = OpCode::from_u8(buf[0] & 0x0F)?;

        if buf[1] & 0x80 == 0 {
            return Err(Error::FrameFormat("client frame not masked"));
        }

        let length = match buf[1] & 0x7F {
            len @ 0..=125 => u64::from(len),
            126 => {
                r.read_exact(&mut buf[..2]).await?;
                u64::from(u16::from_be_bytes([buf[0], buf[1]]))
            }
            _ => {
                r.read_exact(&mut buf[..8]).await?;
                let len = u64::from_be_bytes(buf);
                if len & (1 << 63) != 0 {
                    return Err(Error::FrameFormat("length high bit set"));
                }
                len
            }
        };

        if opcode.is_control() && (!fin || length > MAX_CONTROL_PAYLOAD as u64) {
            return Err(Error::FrameFormat("invalid control frame"));
        }

        let mut mask = [0u8; 4];
        r.read_exact(&mut mask).await?;

        Ok(FrameHeader {
            fin,
            opcode,
            length,
            mask,
        })
    }
}

/// Encode a server-frame header into `buf`, returning the header length.
///
/// Server frames carry `MASK=0` and no mask key, so the header is 2, 4
/// or 10 bytes depending on the payload length.
pub fn encode_header(buf: &mut [u8; MAX_HEADER_SIZE], opcode: OpCode, len: usize, fin: bool) -> usize {
    buf[0] = opcode.as_u8();
    if fin {
        buf[0] |= 0x80;
    }

    if len < 126 {
        buf[1] = len as u8;
        2
    } else if len < (1 << 16) {
        buf[1] = 126;
        buf[2..4].copy_from_slice(&(len as u16).to_be_bytes());
        4
    } else {
        buf[1] = 127;
        buf[2..10].copy_from_slice(&(len as u64).to_be_bytes());
        10
    }
}
