//! Outbound frame serialization.
//!
//! A connection has exactly one [`Sender`], which owns the write half of
//! the stream. Exclusive write access is modeled by a one-capacity slot:
//! whoever holds the `Sender` may emit frames; everyone else waits on
//! the slot. Application sends and reader-initiated control frames both
//! serialize through it. Setting the connection's shutdown signal closes
//! the slot for further acquisition.

use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter, WriteHalf};
use tokio::sync::mpsc;
use tracing::trace;

use crate::connection::signal::Signal;
use crate::error::{Error, Result};
use crate::message::{MessageKind, Status};
use crate::protocol::{encode_header, OpCode, MAX_HEADER_SIZE};

/// A one-capacity hand-off slot. Holding the stored value confers an
/// exclusive right; releasing puts it back for the next acquirer.
pub(crate) struct Slot<T> {
    tx: mpsc::Sender<T>,
    rx: tokio::sync::Mutex<mpsc::Receiver<T>>,
}

impl<T> Slot<T> {
    pub(crate) fn new(value: T) -> Self {
        let (tx, rx) = mpsc::channel(1);
        // A fresh one-capacity channel always has room.
        let _ = tx.try_send(value);
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Take the value, waiting until it is available. Cancel-safe.
    pub(crate) async fn acquire(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }

    /// Take the value only if it is immediately available and nobody
    /// else is waiting on the slot.
    pub(crate) fn try_acquire(&self) -> Option<T> {
        let mut rx = self.rx.try_lock().ok()?;
        rx.try_recv().ok()
    }

    /// Put the value back. The slot is empty whenever a value is held,
    /// so this cannot fail.
    pub(crate) fn release(&self, value: T) {
        let _ = self.tx.try_send(value);
    }
}

/// The single serialization point for outbound frames.
pub(crate) struct Sender<S> {
    w: BufWriter<WriteHalf<S>>,
    shutdown_started: Signal,
}

impl<S: AsyncWrite> Sender<S> {
    pub(crate) fn new(w: BufWriter<WriteHalf<S>>, shutdown_started: Signal) -> Self {
        Self {
            w,
            shutdown_started,
        }
    }

    /// Whether connection shutdown has begun. Writers holding the sender
    /// use this to short-circuit instead of emitting frames after the
    /// close frame.
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown_started.is_set()
    }

    /// Write one frame. Server frames are unmasked. Flushes after the
    /// final frame of a message (and therefore after every control
    /// frame); intermediate fragments stay buffered.
    pub(crate) async fn send_frame(&mut self, opcode: OpCode, body: &[u8], fin: bool) -> Result<()> {
        trace!(opcode = %opcode, len = body.len(), fin, "tx frame");
        let mut header = [0u8; MAX_HEADER_SIZE];
        let n = encode_header(&mut header, opcode, body.len(), fin);
        self.w.write_all(&header[..n]).await?;
        self.w.write_all(body).await?;
        if fin {
            self.w.flush().await?;
        }
        Ok(())
    }

    /// Write a close frame. [`Status::NoStatus`] sends an empty body;
    /// any other status is encoded as two big-endian bytes followed by
    /// the reason.
    pub(crate) async fn send_close(&mut self, status: Status, message: &[u8]) -> Result<()> {
        let body = if status == Status::NoStatus {
            Vec::new()
        } else {
            let mut body = Vec::with_capacity(2 + message.len());
            body.extend_from_slice(&status.as_u16().to_be_bytes());
            body.extend_from_slice(message);
            body
        };
        self.send_frame(OpCode::Close, &body, true).await
    }
}

/// The sender slot: a one-capacity slot for the [`Sender`] plus the
/// shutdown latch that forbids re-acquisition once the connection is
/// closing.
pub(crate) struct SenderSlot<S> {
    slot: Slot<Sender<S>>,
    shutdown_started: Signal,
}

impl<S> SenderSlot<S> {
    pub(crate) fn new(sender: Sender<S>, shutdown_started: Signal) -> Self {
        Self {
            slot: Slot::new(sender),
            shutdown_started,
        }
    }

    /// Acquire exclusive write access, or fail with `ConnClosed` once
    /// shutdown has started.
    pub(crate) async fn acquire(&self) -> Result<Sender<S>> {
        if self.shutdown_started.is_set() {
            return Err(Error::ConnClosed);
        }
        tokio::select! {
            sender = self.slot.acquire() => match sender {
                // The sender can be released into a closing slot; whoever
                // picks it up afterwards must not write, so drop it here.
                Some(sender) if !self.shutdown_started.is_set() => Ok(sender),
                _ => Err(Error::ConnClosed),
            },
            () = self.shutdown_started.wait() => Err(Error::ConnClosed),
        }
    }

    /// Non-blocking acquire: the reader's exit path claims the sender
    /// only if nobody holds it.
    pub(crate) fn try_acquire(&self) -> Option<Sender<S>> {
        if self.shutdown_started.is_set() {
            return None;
        }
        self.slot.try_acquire()
    }

    pub(crate) fn release(&self, sender: Sender<S>) {
        // Once shutdown has begun nothing may write again; dropping the
        // sender here lets go of the write half instead of parking it.
        if self.shutdown_started.is_set() {
            return;
        }
        self.slot.release(sender);
    }

    /// Close the slot: no further acquisition succeeds.
    pub(crate) fn close(&self) {
        self.shutdown_started.set();
    }
}

/// Streaming writer for one outbound message.
///
/// Returned by [`Conn::send_message`](crate::Conn::send_message). Each
/// [`write`](MessageWriter::write) emits one non-final frame;
/// [`finish`](MessageWriter::finish) emits the final frame and releases
/// the send side. Until then, other senders on the connection block.
///
/// Dropping the writer without calling `finish` releases the send side
/// but leaves the message unterminated on the wire; always call
/// `finish`.
pub struct MessageWriter<S> {
    sender: Option<Sender<S>>,
    slot: Arc<SenderSlot<S>>,
    opcode: OpCode,
}

impl<S: AsyncWrite> MessageWriter<S> {
    pub(crate) fn new(sender: Sender<S>, slot: Arc<SenderSlot<S>>, kind: MessageKind) -> Self {
        let opcode = match kind {
            MessageKind::Text => OpCode::Text,
            MessageKind::Binary => OpCode::Binary,
        };
        Self {
            sender: Some(sender),
            slot,
            opcode,
        }
    }

    /// Send `buf` as one non-final frame of the message.
    ///
    /// # Errors
    ///
    /// `Error::ConnClosed` once shutdown has begun; `Error::Io` on write
    /// failure, which also tears the connection down.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let Some(sender) = self.sender.as_mut() else {
            return Err(Error::ConnClosed);
        };
        if sender.is_shutting_down() {
            return Err(Error::ConnClosed);
        }
        match sender.send_frame(self.opcode, buf, false).await {
            Ok(()) => {
                self.opcode = OpCode::Continuation;
                Ok(buf.len())
            }
            Err(e) => {
                self.teardown();
                Err(e)
            }
        }
    }

    /// Send the final (empty) frame of the message and release the send
    /// side.
    pub async fn finish(mut self) -> Result<()> {
        let Some(mut sender) = self.sender.take() else {
            return Err(Error::ConnClosed);
        };
        if sender.is_shutting_down() {
            self.slot.release(sender);
            return Err(Error::ConnClosed);
        }
        match sender.send_frame(self.opcode, &[], true).await {
            Ok(()) => {
                self.slot.release(sender);
                Ok(())
            }
            Err(e) => {
                self.slot.close();
                Err(e)
            }
        }
    }

    fn teardown(&mut self) {
        self.slot.close();
        self.sender = None;
    }
}

impl<S> Drop for MessageWriter<S> {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            self.slot.release(sender);
        }
    }
}
