//! The connection handle and its shutdown sequencing.
//!
//! A [`Conn`] is created by the upgrader after a successful handshake.
//! Its mutable state is owned by the reader task and by whoever holds
//! the sender; the handle itself is a cheap clone that talks to both
//! through slots and signals.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::connection::reader::{
    receive_binary_limited, receive_text_limited, MessageReader, MessageSource, ReadLoop,
};
use crate::connection::signal::Signal;
use crate::connection::writer::{MessageWriter, Sender, SenderSlot, Slot};
use crate::error::{Error, Result};
use crate::message::{CloseReason, MessageKind, Status, Terminal};
use crate::protocol::{OpCode, Origin, MAX_CONTROL_PAYLOAD};

/// Application data attached to a connection by the access callback.
pub type RequestData = Box<dyn Any + Send + Sync>;

/// Connection state shared between the handle, the reader task and
/// helper tasks.
pub(crate) struct Shared<S> {
    pub(crate) resource_name: String,
    pub(crate) origin: Option<Origin>,
    pub(crate) protocol: Option<String>,
    pub(crate) remote_addr: Option<SocketAddr>,
    pub(crate) request_data: Option<RequestData>,
    pub(crate) config: Config,

    pub(crate) sender_slot: Arc<SenderSlot<S>>,
    pub(crate) receiver_slot: Arc<Slot<MessageSource>>,

    /// Set once shutdown begins; closes the sender slot.
    pub(crate) shutdown_started: Signal,
    /// Set by a receive call that hit the wrong message kind.
    pub(crate) wrong_type: Signal,
    /// Set when the close grace window expires; unblocks the reader.
    pub(crate) force_close: Signal,
    /// Set last, after the terminal state is recorded.
    pub(crate) shutdown_complete: Signal,

    pub(crate) server_closed: AtomicBool,
    pub(crate) terminal: OnceLock<Terminal>,
}

/// Connection metadata established during the handshake.
pub(crate) struct ConnMeta {
    pub(crate) resource_name: String,
    pub(crate) origin: Option<Origin>,
    pub(crate) protocol: Option<String>,
    pub(crate) remote_addr: Option<SocketAddr>,
    pub(crate) request_data: Option<RequestData>,
}

/// A server-side WebSocket connection.
///
/// Cloning is cheap and all clones refer to the same connection, so the
/// handle can be passed freely between tasks. Close the connection with
/// [`close`](Conn::close) when done; dropping the handles alone leaves
/// the connection open until the peer closes or drops it.
pub struct Conn<S> {
    pub(crate) shared: Arc<Shared<S>>,
}

impl<S> Clone for Conn<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S> Conn<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Take ownership of the raw stream and start the reader task.
    pub(crate) fn spawn(stream: S, meta: ConnMeta, config: Config) -> Conn<S> {
        let (read_half, write_half) = tokio::io::split(stream);

        let shutdown_started = Signal::new();
        let sender = Sender::new(
            BufWriter::with_capacity(config.write_buffer_size, write_half),
            shutdown_started.clone(),
        );
        let sender_slot = Arc::new(SenderSlot::new(sender, shutdown_started.clone()));

        let (msg_tx, msg_rx) = mpsc::channel(1);
        let receiver_slot = Arc::new(Slot::new(MessageSource {
            msg_rx,
            pending: None,
        }));

        let shared = Arc::new(Shared {
            resource_name: meta.resource_name,
            origin: meta.origin,
            protocol: meta.protocol,
            remote_addr: meta.remote_addr,
            request_data: meta.request_data,
            config,
            sender_slot,
            receiver_slot,
            shutdown_started,
            wrong_type: Signal::new(),
            force_close: Signal::new(),
            shutdown_complete: Signal::new(),
            server_closed: AtomicBool::new(false),
            terminal: OnceLock::new(),
        });

        let reader = ReadLoop::new(
            BufReader::with_capacity(8192, read_half),
            msg_tx,
            Arc::clone(&shared),
        );
        tokio::spawn(reader.run());

        Conn { shared }
    }

    /// Send a complete text message as a single frame.
    ///
    /// # Errors
    ///
    /// `Error::ConnClosed` once shutdown has begun.
    pub async fn send_text(&self, msg: &str) -> Result<()> {
        self.send_data(OpCode::Text, msg.as_bytes()).await
    }

    /// Send a complete binary message as a single frame.
    ///
    /// # Errors
    ///
    /// `Error::ConnClosed` once shutdown has begun.
    pub async fn send_binary(&self, data: &[u8]) -> Result<()> {
        self.send_data(OpCode::Binary, data).await
    }

    /// Start a streaming outbound message of the given kind.
    ///
    /// The returned writer holds the send side until
    /// [`finish`](MessageWriter::finish); until then other sends on this
    /// connection block.
    pub async fn send_message(&self, kind: MessageKind) -> Result<MessageWriter<S>> {
        let sender = self.shared.sender_slot.acquire().await?;
        Ok(MessageWriter::new(
            sender,
            Arc::clone(&self.shared.sender_slot),
            kind,
        ))
    }

    async fn send_data(&self, opcode: OpCode, body: &[u8]) -> Result<()> {
        let mut sender = self.shared.sender_slot.acquire().await?;
        match sender.send_frame(opcode, body, true).await {
            Ok(()) => {
                self.shared.sender_slot.release(sender);
                Ok(())
            }
            Err(e) => {
                // Write failure: tear the send side down, dropping the
                // sender so no further frames go out.
                self.shared.sender_slot.close();
                Err(e)
            }
        }
    }

    pub(crate) async fn send_acquired(
        &self,
        opcode: OpCode,
        body: &[u8],
        cancel: &Signal,
    ) -> Result<()> {
        let mut sender = tokio::select! {
            sender = self.shared.sender_slot.acquire() => sender?,
            () = cancel.wait() => return Err(Error::Cancelled),
        };
        match sender.send_frame(opcode, body, true).await {
            Ok(()) => {
                self.shared.sender_slot.release(sender);
                Ok(())
            }
            Err(e) => {
                self.shared.sender_slot.close();
                Err(e)
            }
        }
    }

    /// Wait for the next inbound message and return its kind plus a
    /// streaming reader for the payload.
    ///
    /// The reader must be drained (or discarded) before the following
    /// message can be received.
    ///
    /// # Errors
    ///
    /// `Error::ConnClosed` once the connection has shut down.
    pub async fn receive_message(&self) -> Result<(MessageKind, MessageReader)> {
        let Some(mut source) = self.shared.receiver_slot.acquire().await else {
            return Err(Error::ConnClosed);
        };
        match source.next().await {
            Some(start) => {
                let kind = start.kind;
                let reader = MessageReader::new(
                    start,
                    source,
                    Arc::clone(&self.shared.receiver_slot),
                    self.shared.wrong_type.clone(),
                );
                Ok((kind, reader))
            }
            None => {
                self.shared.receiver_slot.release(source);
                Err(Error::ConnClosed)
            }
        }
    }

    /// Receive a text message of at most `max_len` bytes.
    ///
    /// # Errors
    ///
    /// - `Error::MessageType` if the next message is not text; the
    ///   connection is aborted with status 1003
    /// - `Error::TooLarge` if the message exceeds `max_len`; the error
    ///   carries the truncated prefix, cut at a character boundary, and
    ///   the connection stays usable
    /// - `Error::ConnClosed` once the connection has shut down
    pub async fn receive_text(&self, max_len: usize) -> Result<String> {
        let (kind, reader) = self.receive_message().await?;
        receive_text_limited(kind, reader, max_len).await
    }

    /// Receive a binary message into `buf`, returning the number of
    /// bytes read.
    ///
    /// # Errors
    ///
    /// - `Error::MessageType` if the next message is not binary; the
    ///   connection is aborted with status 1003
    /// - `Error::TooLarge` if the message exceeds the buffer; `buf` then
    ///   holds the prefix, the remainder is discarded, and the
    ///   connection stays usable
    /// - `Error::ConnClosed` once the connection has shut down
    pub async fn receive_binary(&self, buf: &mut [u8]) -> Result<usize> {
        let (kind, reader) = self.receive_message().await?;
        receive_binary_limited(kind, reader, buf).await
    }

    /// Initiate the close handshake.
    ///
    /// Emits the close frame and returns immediately. A grace watcher
    /// then gives the peer [`Config::close_grace`] to answer with its
    /// own close frame before the raw stream is forcibly closed. Use
    /// [`wait`](Conn::wait) to observe the final outcome.
    ///
    /// Use [`Status::NoStatus`] to send a close frame without a status
    /// code.
    ///
    /// # Errors
    ///
    /// - `Error::StatusCode` for codes a server must not send
    /// - `Error::TooLarge` if the message exceeds 123 bytes
    /// - `Error::ConnClosed` if shutdown has already begun
    pub async fn close(&self, status: Status, message: &str) -> Result<()> {
        if !(status.is_valid_to_send() || status == Status::NoStatus) {
            return Err(Error::StatusCode(status.as_u16()));
        }
        if message.len() > MAX_CONTROL_PAYLOAD - 2 {
            return Err(Error::TooLarge(None));
        }

        let mut sender = self.shared.sender_slot.acquire().await?;
        self.shared.server_closed.store(true, Ordering::Release);
        self.shared.sender_slot.close();
        let result = sender.send_close(status, message.as_bytes()).await;
        drop(sender);

        // Grace watcher: force-close the stream if the peer neither
        // answers nor drops within the window.
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            tokio::select! {
                () = shared.shutdown_complete.wait() => {}
                () = tokio::time::sleep(shared.config.close_grace) => {
                    shared.force_close.set();
                }
            }
        });

        result
    }

    /// Block until the connection has fully shut down and return the
    /// terminal state. Never fails; can be called any number of times.
    pub async fn wait(&self) -> Terminal {
        self.shared.shutdown_complete.wait().await;
        self.shared
            .terminal
            .get()
            .cloned()
            .unwrap_or_else(|| Terminal {
                reason: CloseReason::ConnDropped,
                peer_status: Status::Dropped,
                peer_message: String::new(),
            })
    }

    /// Wait until a message is announced on this connection, for select
    /// fan-in. Returns `None` when cancelled (either signal), releasing
    /// everything acquired.
    pub(crate) async fn next_ready(
        &self,
        cancel: &Signal,
        done: &Signal,
    ) -> Option<Result<(MessageKind, MessageReader)>> {
        let mut source = tokio::select! {
            source = self.shared.receiver_slot.acquire() => source?,
            () = cancel.wait() => return None,
            () = done.wait() => return None,
        };

        let start = if let Some(start) = source.pending.take() {
            Some(start)
        } else {
            tokio::select! {
                start = source.msg_rx.recv() => start,
                () = cancel.wait() => {
                    self.shared.receiver_slot.release(source);
                    return None;
                }
                () = done.wait() => {
                    self.shared.receiver_slot.release(source);
                    return None;
                }
            }
        };

        match start {
            Some(start) => {
                let kind = start.kind;
                let reader = MessageReader::new(
                    start,
                    source,
                    Arc::clone(&self.shared.receiver_slot),
                    self.shared.wrong_type.clone(),
                );
                Some(Ok((kind, reader)))
            }
            None => {
                self.shared.receiver_slot.release(source);
                Some(Err(Error::ConnClosed))
            }
        }
    }
}

impl<S> Conn<S> {
    /// The resource name from the request URI: the path, with the query
    /// appended after an `&` if present.
    #[must_use]
    pub fn resource_name(&self) -> &str {
        &self.shared.resource_name
    }

    /// The client's `Origin`, if it sent one.
    #[must_use]
    pub fn origin(&self) -> Option<&Origin> {
        self.shared.origin.as_ref()
    }

    /// The selected sub-protocol, if any.
    #[must_use]
    pub fn protocol(&self) -> Option<&str> {
        self.shared.protocol.as_deref()
    }

    /// The peer address, when known.
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.remote_addr
    }

    /// Application data attached by the access callback during the
    /// handshake.
    #[must_use]
    pub fn request_data(&self) -> Option<&(dyn Any + Send + Sync)> {
        self.shared.request_data.as_deref()
    }
}

impl<S> std::fmt::Debug for Conn<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("resource_name", &self.shared.resource_name)
            .field("protocol", &self.shared.protocol)
            .field("remote_addr", &self.shared.remote_addr)
            .field("closed", &self.shared.shutdown_complete.is_set())
            .finish()
    }
}
