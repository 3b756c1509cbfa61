//! Inbound frame multiplexing.
//!
//! The reader task owns the read half of the stream. It parses frame
//! headers, enforces the fragmentation ordering rules, answers pings,
//! records the peer's close frame, and pumps data payloads to the
//! application through per-message rendezvous channels. Payloads are
//! handed over in bounded chunks; a message is never buffered whole.
//!
//! On exit the reader runs the shutdown sequence: claim the send slot if
//! it is free and emit the close frame, close the slot, record the
//! terminal state, and fire `shutdown_complete`.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufReader, ReadHalf};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::connection::conn::Shared;
use crate::connection::signal::Signal;
use crate::connection::writer::Slot;
use crate::error::{Error, Result};
use crate::message::{CloseReason, MessageKind, Status, Terminal};
use crate::protocol::{apply_mask, apply_mask_offset, FrameHeader, OpCode, Utf8Validator};

/// Application-to-reader requests on the message hand-off channel.
pub(crate) enum ReadRequest {
    /// Deliver up to this many payload bytes.
    Pull(usize),
    /// Throw away the rest of the message.
    Discard,
}

/// Reader-to-application replies.
pub(crate) enum ReadReply {
    /// The next chunk of unmasked payload.
    Data(Bytes),
    /// The message is complete.
    End,
}

/// Hand-off for one announced message: the kind plus the channel pair
/// the payload is pumped over.
pub(crate) struct MessageStart {
    pub(crate) kind: MessageKind,
    pub(crate) req_tx: mpsc::Sender<ReadRequest>,
    pub(crate) reply_rx: mpsc::Receiver<ReadReply>,
}

/// The receive side of a connection. Exactly one exists per connection;
/// it lives in the receiver slot, so at most one application reader is
/// active at a time.
pub(crate) struct MessageSource {
    pub(crate) msg_rx: mpsc::Receiver<MessageStart>,
    /// A message announcement taken from `msg_rx` but handed back
    /// unread (select fan-in losers put theirs back here).
    pub(crate) pending: Option<MessageStart>,
}

impl MessageSource {
    pub(crate) async fn next(&mut self) -> Option<MessageStart> {
        if let Some(start) = self.pending.take() {
            return Some(start);
        }
        self.msg_rx.recv().await
    }
}

/// Streaming reader for one inbound message.
///
/// Returned by [`Conn::receive_message`](crate::Conn::receive_message).
/// The message must be read to the end (a [`read`](MessageReader::read)
/// returning `Ok(0)`) or explicitly [`discard`](MessageReader::discard)ed
/// before the next message can be received. Dropping the reader discards
/// the remainder of the message.
pub struct MessageReader {
    kind: MessageKind,
    start: Option<MessageStart>,
    source: Option<MessageSource>,
    slot: Arc<Slot<MessageSource>>,
    wrong_type: Signal,
    /// Tail of a delivered chunk that did not fit the caller's buffer
    /// (possible when a read future was cancelled and retried with a
    /// smaller buffer).
    leftover: Bytes,
    done: bool,
}

impl MessageReader {
    pub(crate) fn new(
        start: MessageStart,
        source: MessageSource,
        slot: Arc<Slot<MessageSource>>,
        wrong_type: Signal,
    ) -> Self {
        Self {
            kind: start.kind,
            start: Some(start),
            source: Some(source),
            slot,
            wrong_type,
            leftover: Bytes::new(),
            done: false,
        }
    }

    /// The kind of this message.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Read the next chunk of the message into `buf`.
    ///
    /// Returns `Ok(0)` at the end of the message. The payload arrives
    /// unmasked and in order.
    ///
    /// # Errors
    ///
    /// `Error::ConnClosed` when the connection died mid-message.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.leftover.is_empty() {
            return Ok(self.deliver(buf, self.leftover.clone()));
        }
        if self.done {
            return Ok(0);
        }
        let Some(start) = self.start.as_mut() else {
            return Err(Error::ConnClosed);
        };

        if start.req_tx.send(ReadRequest::Pull(buf.len())).await.is_err() {
            // The pump has finished with this message; a buffered End
            // may still be waiting.
            return match start.reply_rx.try_recv() {
                Ok(ReadReply::End) => {
                    self.complete();
                    Ok(0)
                }
                Ok(ReadReply::Data(bytes)) => Ok(self.deliver(buf, bytes)),
                Err(_) => {
                    self.complete();
                    Err(Error::ConnClosed)
                }
            };
        }

        match start.reply_rx.recv().await {
            Some(ReadReply::Data(bytes)) => Ok(self.deliver(buf, bytes)),
            Some(ReadReply::End) => {
                self.complete();
                Ok(0)
            }
            None => {
                self.complete();
                Err(Error::ConnClosed)
            }
        }
    }

    /// Copy a delivered chunk into `buf`, stashing any tail that does
    /// not fit.
    fn deliver(&mut self, buf: &mut [u8], bytes: Bytes) -> usize {
        let n = bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        self.leftover = bytes.slice(n..);
        n
    }

    /// Throw away the rest of the message. The reader task discards the
    /// remaining payload in the background; the connection stays usable.
    pub async fn discard(&mut self) {
        if self.done {
            return;
        }
        if let Some(start) = self.start.as_mut() {
            let _ = start.req_tx.send(ReadRequest::Discard).await;
        }
        self.complete();
    }

    /// Abort the connection because the message has the wrong kind. The
    /// reader terminates with status 1003.
    pub(crate) async fn fail(&mut self) {
        self.wrong_type.set();
        self.complete();
    }

    /// Hand the announced-but-unread message back so the next receiver
    /// sees it first. Used by select fan-in losers.
    pub(crate) fn push_back(mut self) {
        if let (Some(start), Some(mut source)) = (self.start.take(), self.source.take()) {
            source.pending = Some(start);
            self.slot.release(source);
        }
        self.done = true;
    }

    fn complete(&mut self) {
        self.done = true;
        self.start = None;
        if let Some(source) = self.source.take() {
            self.slot.release(source);
        }
    }
}

impl Drop for MessageReader {
    fn drop(&mut self) {
        // Dropping `start` closes the request channel; the pump notices
        // and discards the remainder of the message.
        if let Some(source) = self.source.take() {
            self.slot.release(source);
        }
    }
}

/// How the frame loop ended.
enum Exit {
    /// The peer sent a well-formed close frame.
    PeerClosed { status: Status, message: String },
    /// Framing or close-frame violation.
    Protocol,
    /// Invalid UTF-8 inside a text payload.
    BadUtf8,
    /// A receive call hit an unexpected message kind.
    WrongType,
    /// Read error, EOF, or forced close: no close frame goes out.
    Dropped,
}

/// Per-message pump state on the reader side.
struct Pump {
    req_rx: mpsc::Receiver<ReadRequest>,
    reply_tx: mpsc::Sender<ReadReply>,
    utf8: Option<Utf8Validator>,
    discarding: bool,
}

/// The reader task.
pub(crate) struct ReadLoop<S> {
    r: BufReader<ReadHalf<S>>,
    msg_tx: mpsc::Sender<MessageStart>,
    shared: Arc<Shared<S>>,
}

/// Wait for a reader interruption: forced close or a wrong-message-type
/// abort.
async fn interruption<S>(shared: &Shared<S>) -> Exit {
    tokio::select! {
        () = shared.force_close.wait() => Exit::Dropped,
        () = shared.wrong_type.wait() => Exit::WrongType,
    }
}

impl<S> ReadLoop<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub(crate) fn new(
        r: BufReader<ReadHalf<S>>,
        msg_tx: mpsc::Sender<MessageStart>,
        shared: Arc<Shared<S>>,
    ) -> Self {
        Self { r, msg_tx, shared }
    }

    pub(crate) async fn run(mut self) {
        let exit = self.read_loop().await;
        let shared = self.shared;

        // Emit the close frame if nobody holds the send side. If the
        // application already initiated the close, its frame was the one
        // close frame of this connection and nothing more goes out.
        if !matches!(exit, Exit::Dropped) {
            if let Some(mut sender) = shared.sender_slot.try_acquire() {
                let status = match &exit {
                    Exit::PeerClosed { status, .. } => {
                        if status.is_valid_to_send() {
                            *status
                        } else {
                            Status::NoStatus
                        }
                    }
                    Exit::BadUtf8 => Status::InvalidData,
                    Exit::WrongType => Status::Unsupported,
                    _ => Status::ProtocolError,
                };
                let _ = sender.send_close(status, b"").await;
            }
        }

        shared.sender_slot.close();

        let server_closed = shared.server_closed.load(Ordering::Acquire);
        let terminal = match exit {
            Exit::PeerClosed { status, message } => Terminal {
                reason: if server_closed {
                    CloseReason::ServerClosed
                } else {
                    CloseReason::ClientClosed
                },
                peer_status: status,
                peer_message: message,
            },
            Exit::Protocol | Exit::BadUtf8 => Terminal {
                reason: CloseReason::ProtocolViolation,
                peer_status: Status::Dropped,
                peer_message: String::new(),
            },
            Exit::WrongType => Terminal {
                reason: CloseReason::WrongMessageType,
                peer_status: Status::Dropped,
                peer_message: String::new(),
            },
            Exit::Dropped => Terminal {
                reason: if server_closed {
                    CloseReason::ServerClosed
                } else {
                    CloseReason::ConnDropped
                },
                peer_status: Status::Dropped,
                peer_message: String::new(),
            },
        };
        debug!(reason = ?terminal.reason, peer_status = %terminal.peer_status, "connection terminal");
        let _ = shared.terminal.set(terminal);
        shared.shutdown_complete.set();
        // The read half drops here; the stream closes once the write
        // half is gone as well.
    }

    async fn read_loop(&mut self) -> Exit {
        let mut pump: Option<Pump> = None;
        let mut in_fragmented = false;

        loop {
            let shared = &self.shared;
            let header = tokio::select! {
                header = FrameHeader::read_from(&mut self.r) => match header {
                    Ok(header) => header,
                    Err(Error::FrameFormat(msg)) => {
                        debug!(error = msg, "frame format violation");
                        return Exit::Protocol;
                    }
                    Err(_) => return Exit::Dropped,
                },
                exit = interruption(shared) => return exit,
            };
            trace!(opcode = %header.opcode, fin = header.fin, len = header.length, "rx frame");

            match header.opcode {
                OpCode::Text | OpCode::Binary | OpCode::Continuation => {
                    if (header.opcode == OpCode::Continuation) != in_fragmented {
                        debug!("fragmentation order violation");
                        return Exit::Protocol;
                    }

                    if header.opcode != OpCode::Continuation {
                        let kind = if header.opcode == OpCode::Text {
                            MessageKind::Text
                        } else {
                            MessageKind::Binary
                        };
                        let (req_tx, req_rx) = mpsc::channel(1);
                        let (reply_tx, reply_rx) = mpsc::channel(1);
                        let start = MessageStart {
                            kind,
                            req_tx,
                            reply_rx,
                        };
                        let shared = &self.shared;
                        tokio::select! {
                            sent = self.msg_tx.send(start) => if sent.is_err() {
                                return Exit::Dropped;
                            },
                            exit = interruption(shared) => return exit,
                        }
                        pump = Some(Pump {
                            req_rx,
                            reply_tx,
                            utf8: (kind == MessageKind::Text).then(Utf8Validator::new),
                            discarding: false,
                        });
                    }
                    in_fragmented = !header.fin;

                    let Some(p) = pump.as_mut() else {
                        return Exit::Protocol;
                    };
                    if let Some(exit) = self.pump_frame(p, &header).await {
                        return exit;
                    }

                    if header.fin {
                        let Some(mut p) = pump.take() else {
                            return Exit::Protocol;
                        };
                        if !p.discarding {
                            if let Some(v) = p.utf8.as_mut() {
                                if v.validate(&[], true).is_err() {
                                    debug!("text message ends mid-sequence");
                                    return Exit::BadUtf8;
                                }
                            }
                            let shared = &self.shared;
                            tokio::select! {
                                // Failure means the application reader is
                                // gone; nothing left to notify.
                                _ = p.reply_tx.send(ReadReply::End) => {}
                                exit = interruption(shared) => return exit,
                            }
                        }
                    }
                }
                OpCode::Close => {
                    let body = match self.read_control_body(&header).await {
                        Ok(body) => body,
                        Err(exit) => return exit,
                    };
                    return match body.len() {
                        0 => Exit::PeerClosed {
                            status: Status::NoStatus,
                            message: String::new(),
                        },
                        1 => Exit::Protocol,
                        _ => {
                            let status = Status::from_u16(u16::from_be_bytes([body[0], body[1]]));
                            if !status.is_valid_from_peer() {
                                debug!(status = %status, "peer close status not allowed");
                                return Exit::Protocol;
                            }
                            match std::str::from_utf8(&body[2..]) {
                                Ok(message) => Exit::PeerClosed {
                                    status,
                                    message: message.to_string(),
                                },
                                Err(_) => Exit::Protocol,
                            }
                        }
                    };
                }
                OpCode::Ping => {
                    let body = match self.read_control_body(&header).await {
                        Ok(body) => body,
                        Err(exit) => return exit,
                    };
                    dispatch_pong(Arc::clone(&self.shared), body).await;
                }
                OpCode::Pong => {
                    // Unsolicited or otherwise: swallow it.
                    if let Err(exit) = self.read_control_body(&header).await {
                        return exit;
                    }
                }
            }
        }
    }

    /// Pump one data frame's payload to the application, cooperating
    /// with its pull requests, or discard it when the application has
    /// walked away.
    async fn pump_frame(&mut self, p: &mut Pump, header: &FrameHeader) -> Option<Exit> {
        let len = header.length;
        let mut pos: u64 = 0;
        let r = &mut self.r;
        let shared = &self.shared;

        while pos < len {
            if p.discarding {
                if let Err(exit) = discard_payload(r, shared, len - pos).await {
                    return Some(exit);
                }
                return None;
            }

            let request = tokio::select! {
                request = p.req_rx.recv() => request,
                exit = interruption(shared) => return Some(exit),
            };

            match request {
                Some(ReadRequest::Pull(max)) => {
                    let want = max
                        .min(shared.config.read_chunk_size)
                        .min((len - pos) as usize)
                        .max(1);
                    let mut chunk = vec![0u8; want];
                    let n = tokio::select! {
                        n = r.read(&mut chunk) => match n {
                            Ok(0) | Err(_) => return Some(Exit::Dropped),
                            Ok(n) => n,
                        },
                        exit = interruption(shared) => return Some(exit),
                    };
                    chunk.truncate(n);
                    apply_mask_offset(&mut chunk, header.mask, pos);
                    pos += n as u64;

                    if let Some(v) = p.utf8.as_mut() {
                        if v.validate(&chunk, false).is_err() {
                            debug!("invalid UTF-8 in text payload");
                            return Some(Exit::BadUtf8);
                        }
                    }

                    tokio::select! {
                        sent = p.reply_tx.send(ReadReply::Data(Bytes::from(chunk))) => {
                            if sent.is_err() {
                                p.discarding = true;
                            }
                        }
                        exit = interruption(shared) => return Some(exit),
                    }
                }
                Some(ReadRequest::Discard) | None => {
                    p.discarding = true;
                }
            }
        }
        None
    }

    /// Read and unmask a control-frame body (at most 125 bytes, already
    /// enforced by the header decoder).
    async fn read_control_body(&mut self, header: &FrameHeader) -> std::result::Result<Vec<u8>, Exit> {
        let mut body = vec![0u8; header.length as usize];
        let r = &mut self.r;
        let shared = &self.shared;
        tokio::select! {
            read = r.read_exact(&mut body) => {
                if read.is_err() {
                    return Err(Exit::Dropped);
                }
            }
            exit = interruption(shared) => return Err(exit),
        }
        apply_mask(&mut body, header.mask);
        Ok(body)
    }
}

/// Answer a ping. The sender slot is claimed without blocking; if an
/// application writer holds it, a short-lived helper task delivers
/// the pong so the reader keeps consuming frames.
async fn dispatch_pong<S>(shared: Arc<Shared<S>>, body: Vec<u8>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    match shared.sender_slot.try_acquire() {
        Some(mut sender) => {
            if sender.send_frame(OpCode::Pong, &body, true).await.is_ok() {
                shared.sender_slot.release(sender);
            } else {
                shared.sender_slot.close();
            }
        }
        None if !shared.shutdown_started.is_set() => {
            tokio::spawn(async move {
                if let Ok(mut sender) = shared.sender_slot.acquire().await {
                    if sender.send_frame(OpCode::Pong, &body, true).await.is_ok() {
                        shared.sender_slot.release(sender);
                    } else {
                        shared.sender_slot.close();
                    }
                }
            });
        }
        None => {}
    }
}

/// Discard `todo` payload bytes in blocks.
async fn discard_payload<S, R>(
    r: &mut R,
    shared: &Shared<S>,
    mut todo: u64,
) -> std::result::Result<(), Exit>
where
    R: AsyncRead + Unpin,
{
    let mut scratch = [0u8; 4096];
    while todo > 0 {
        let cap = scratch.len().min(usize::try_from(todo).unwrap_or(usize::MAX));
        let n = tokio::select! {
            n = r.read(&mut scratch[..cap]) => match n {
                Ok(0) | Err(_) => return Err(Exit::Dropped),
                Ok(n) => n,
            },
            exit = interruption(shared) => return Err(exit),
        };
        todo -= n as u64;
    }
    Ok(())
}

/// Drive a limited receive into an owned buffer: used by
/// `receive_text` and the select fan-in.
pub(crate) async fn receive_text_limited(
    kind: MessageKind,
    mut reader: MessageReader,
    max_len: usize,
) -> Result<String> {
    if kind != MessageKind::Text {
        reader.fail().await;
        return Err(Error::MessageType);
    }

    let mut data = Vec::new();
    let mut chunk = [0u8; 4096];
    while data.len() < max_len {
        let want = chunk.len().min(max_len - data.len());
        let n = reader.read(&mut chunk[..want]).await?;
        if n == 0 {
            return String::from_utf8(data).map_err(|_| Error::InvalidUtf8);
        }
        data.extend_from_slice(&chunk[..n]);
    }

    let mut overflow = false;
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        overflow = true;
    }
    if overflow {
        let cut = crate::protocol::floor_char_boundary(&data);
        data.truncate(cut);
        let prefix = String::from_utf8(data).map_err(|_| Error::InvalidUtf8)?;
        Err(Error::TooLarge(Some(prefix)))
    } else {
        String::from_utf8(data).map_err(|_| Error::InvalidUtf8)
    }
}

/// Counterpart of [`receive_text_limited`] for binary messages read
/// into a caller buffer. On overflow the buffer holds the prefix, the
/// remainder is discarded, and the connection stays usable.
pub(crate) async fn receive_binary_limited(
    kind: MessageKind,
    mut reader: MessageReader,
    buf: &mut [u8],
) -> Result<usize> {
    if kind != MessageKind::Binary {
        reader.fail().await;
        return Err(Error::MessageType);
    }

    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Ok(filled);
        }
        filled += n;
    }

    let mut overflow = false;
    let mut scratch = [0u8; 4096];
    loop {
        let n = reader.read(&mut scratch).await?;
        if n == 0 {
            break;
        }
        overflow = true;
    }
    if overflow {
        Err(Error::TooLarge(None))
    } else {
        Ok(filled)
    }
}
