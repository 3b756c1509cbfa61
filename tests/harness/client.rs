//! A fake WebSocket client speaking raw frames.
//!
//! Deliberately independent of the server implementation: frames are
//! assembled by hand so tests control exactly what goes on the wire,
//! including malformed sequences.

use std::error::Error;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use wsmux::compute_accept_key;

pub const OP_CONT: u8 = 0x0;
pub const OP_TEXT: u8 = 0x1;
pub const OP_BINARY: u8 = 0x2;
pub const OP_CLOSE: u8 = 0x8;
pub const OP_PING: u8 = 0x9;
pub const OP_PONG: u8 = 0xA;

type BoxError = Box<dyn Error + Send + Sync>;

/// A frame as observed from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub opcode: u8,
    pub fin: bool,
    pub payload: Vec<u8>,
}

impl RawFrame {
    /// Close-frame status code, if the payload carries one.
    pub fn close_status(&self) -> Option<u16> {
        if self.opcode == OP_CLOSE && self.payload.len() >= 2 {
            Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
        } else {
            None
        }
    }

    pub fn close_reason(&self) -> &[u8] {
        if self.opcode == OP_CLOSE && self.payload.len() > 2 {
            &self.payload[2..]
        } else {
            &[]
        }
    }
}

/// Raw-frame client over any byte stream.
pub struct TestClient<S> {
    stream: S,
}

impl TestClient<TcpStream> {
    /// Connect over TCP and perform the opening handshake.
    pub async fn connect(addr: std::net::SocketAddr) -> Result<Self, BoxError> {
        let stream = TcpStream::connect(addr).await?;
        Self::handshake(stream, &addr.to_string(), &[]).await
    }
}

impl<S> TestClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Take an already-connected stream, send the upgrade request and
    /// verify the server's `101` response.
    pub async fn handshake(
        mut stream: S,
        host: &str,
        extra_headers: &[(&str, &str)],
    ) -> Result<Self, BoxError> {
        let key = random_key();
        let mut request = format!(
            "GET /test HTTP/1.1\r\n\
             Host: {host}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {key}\r\n\
             Sec-WebSocket-Version: 13\r\n"
        );
        for (name, value) in extra_headers {
            request.push_str(&format!("{name}: {value}\r\n"));
        }
        request.push_str("\r\n");
        stream.write_all(request.as_bytes()).await?;

        let response = read_http_head(&mut stream).await?;
        let text = String::from_utf8(response)?;
        if !text.starts_with("HTTP/1.1 101") {
            return Err(format!("unexpected response: {}", text.lines().next().unwrap_or("")).into());
        }
        let expected = format!("Sec-WebSocket-Accept: {}", compute_accept_key(&key));
        if !text.contains(&expected) {
            return Err("bad Sec-WebSocket-Accept".into());
        }

        Ok(Self { stream })
    }

    /// Take the stream without a handshake (for driving a connection
    /// created through `Negotiated::into_conn`).
    pub fn raw(stream: S) -> Self {
        Self { stream }
    }

    /// Send one masked frame.
    pub async fn send_frame(&mut self, opcode: u8, payload: &[u8], fin: bool) -> Result<(), BoxError> {
        let mut mask = [0u8; 4];
        getrandom::getrandom(&mut mask)?;

        let mut frame = Vec::with_capacity(payload.len() + 14);
        frame.push(opcode | if fin { 0x80 } else { 0 });
        let len = payload.len();
        if len < 126 {
            frame.push(len as u8 | 0x80);
        } else if len < (1 << 16) {
            frame.push(126 | 0x80);
            frame.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            frame.push(127 | 0x80);
            frame.extend_from_slice(&(len as u64).to_be_bytes());
        }
        frame.extend_from_slice(&mask);
        frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));

        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn send_text(&mut self, text: &str) -> Result<(), BoxError> {
        self.send_frame(OP_TEXT, text.as_bytes(), true).await
    }

    pub async fn send_binary(&mut self, data: &[u8]) -> Result<(), BoxError> {
        self.send_frame(OP_BINARY, data, true).await
    }

    /// Send a close frame with the given status and reason.
    pub async fn send_close(&mut self, status: u16, reason: &str) -> Result<(), BoxError> {
        let mut payload = status.to_be_bytes().to_vec();
        payload.extend_from_slice(reason.as_bytes());
        self.send_frame(OP_CLOSE, &payload, true).await
    }

    /// Send a close frame with an empty body.
    pub async fn send_close_empty(&mut self) -> Result<(), BoxError> {
        self.send_frame(OP_CLOSE, &[], true).await
    }

    /// Send arbitrary bytes, bypassing frame assembly.
    pub async fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), BoxError> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read one (unmasked) server frame.
    pub async fn read_frame(&mut self) -> Result<RawFrame, BoxError> {
        let mut head = [0u8; 2];
        self.stream.read_exact(&mut head).await?;
        let fin = head[0] & 0x80 != 0;
        let opcode = head[0] & 0x0F;
        if head[1] & 0x80 != 0 {
            return Err("server frame is masked".into());
        }
        let len = match head[1] & 0x7F {
            n @ 0..=125 => u64::from(n),
            126 => {
                let mut ext = [0u8; 2];
                self.stream.read_exact(&mut ext).await?;
                u64::from(u16::from_be_bytes(ext))
            }
            _ => {
                let mut ext = [0u8; 8];
                self.stream.read_exact(&mut ext).await?;
                u64::from_be_bytes(ext)
            }
        };
        let mut payload = vec![0u8; usize::try_from(len)?];
        self.stream.read_exact(&mut payload).await?;
        Ok(RawFrame {
            opcode,
            fin,
            payload,
        })
    }

    /// Read server frames until a complete data message has been
    /// collected, skipping interleaved control frames. Returns the
    /// opening opcode and the reassembled payload.
    pub async fn read_message(&mut self) -> Result<(u8, Vec<u8>), BoxError> {
        let mut opcode = None;
        let mut payload = Vec::new();
        loop {
            let frame = self.read_frame().await?;
            if frame.opcode >= 0x8 {
                continue;
            }
            if opcode.is_none() {
                opcode = Some(frame.opcode);
            }
            payload.extend_from_slice(&frame.payload);
            if frame.fin {
                return Ok((opcode.unwrap_or(OP_CONT), payload));
            }
        }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

async fn read_http_head<S>(stream: &mut S) -> Result<Vec<u8>, BoxError>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() > 64 * 1024 {
            return Err("response head too large".into());
        }
        stream.read_exact(&mut byte).await?;
        head.push(byte[0]);
    }
    Ok(head)
}

fn random_key() -> String {
    let mut bytes = [0u8; 16];
    let _ = getrandom::getrandom(&mut bytes);
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, bytes)
}
