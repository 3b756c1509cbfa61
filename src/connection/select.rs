//! Fan-in over many connections: select the first connection with a
//! pending message, or broadcast one message to all of them.
//!
//! Dynamic-arity selection is emulated with one notifier task per
//! connection feeding a shared queue. A notifier that loses the race
//! hands its announced message back to its connection, so nothing is
//! consumed from the losers.

use std::collections::HashMap;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::connection::conn::Conn;
use crate::connection::reader::{
    receive_binary_limited, receive_text_limited, MessageReader,
};
use crate::connection::signal::Signal;
use crate::error::{Error, Result};
use crate::message::MessageKind;
use crate::protocol::OpCode;

/// Fan-in operations support at most this many connections, plus the
/// cancellation signal.
pub const MAX_SELECT_CONNS: usize = 65_535;

/// Wait until one of the connections has a pending message and return
/// its index together with the message kind and streaming reader.
///
/// Returns `(None, Err(Error::Cancelled))` when `cancel` fires first.
/// A connection that shuts down while waiting wins the race with
/// `(Some(index), Err(Error::ConnClosed))`; the caller should drop it
/// from the list.
///
/// # Panics
///
/// Panics if more than [`MAX_SELECT_CONNS`] connections are given.
pub async fn select_message<S>(
    clients: &[Conn<S>],
    cancel: &Signal,
) -> (Option<usize>, Result<(MessageKind, MessageReader)>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    assert!(
        clients.len() <= MAX_SELECT_CONNS,
        "select over too many connections"
    );
    if clients.is_empty() {
        cancel.wait().await;
        return (None, Err(Error::Cancelled));
    }

    let done = Signal::new();
    let (tx, mut rx) = mpsc::channel(clients.len());
    let mut handles = Vec::with_capacity(clients.len());

    for (i, conn) in clients.iter().enumerate() {
        let conn = conn.clone();
        let tx = tx.clone();
        let cancel = cancel.clone();
        let done = done.clone();
        handles.push(tokio::spawn(async move {
            if let Some(outcome) = conn.next_ready(&cancel, &done).await {
                if let Err(mpsc::error::SendError((_, Ok((_, reader))))) =
                    tx.send((i, outcome)).await
                {
                    // Queue gone: nobody will take this message.
                    reader.push_back();
                }
            }
        }));
    }
    drop(tx);

    let first = rx.recv().await;
    done.set();
    for handle in handles {
        let _ = handle.await;
    }
    // Later arrivals lost the race; hand their messages back.
    while let Ok((_, outcome)) = rx.try_recv() {
        if let Ok((_, reader)) = outcome {
            reader.push_back();
        }
    }

    match first {
        Some((i, outcome)) => (Some(i), outcome),
        None => (None, Err(Error::Cancelled)),
    }
}

/// [`select_message`] followed by a bounded text receive on the winning
/// connection, like [`Conn::receive_text`].
pub async fn select_text<S>(
    clients: &[Conn<S>],
    max_len: usize,
    cancel: &Signal,
) -> (Option<usize>, Result<String>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    match select_message(clients, cancel).await {
        (idx, Ok((kind, reader))) => (idx, receive_text_limited(kind, reader, max_len).await),
        (idx, Err(e)) => (idx, Err(e)),
    }
}

/// [`select_message`] followed by a buffered binary receive on the
/// winning connection, like [`Conn::receive_binary`].
pub async fn select_binary<S>(
    clients: &[Conn<S>],
    buf: &mut [u8],
    cancel: &Signal,
) -> (Option<usize>, Result<usize>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    match select_message(clients, cancel).await {
        (idx, Ok((kind, reader))) => (idx, receive_binary_limited(kind, reader, buf).await),
        (idx, Err(e)) => (idx, Err(e)),
    }
}

/// Send a text message to every connection in the slice. Each send
/// acquires that connection's sender slot as it becomes free. The
/// returned map holds the error for every connection that failed, keyed
/// by its index in the slice.
pub async fn broadcast_text<S>(
    clients: &[Conn<S>],
    msg: &str,
    cancel: &Signal,
) -> HashMap<usize, Error>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    broadcast(clients, OpCode::Text, Bytes::copy_from_slice(msg.as_bytes()), cancel).await
}

/// Binary counterpart of [`broadcast_text`].
pub async fn broadcast_binary<S>(
    clients: &[Conn<S>],
    msg: &[u8],
    cancel: &Signal,
) -> HashMap<usize, Error>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    broadcast(clients, OpCode::Binary, Bytes::copy_from_slice(msg), cancel).await
}

async fn broadcast<S>(
    clients: &[Conn<S>],
    opcode: OpCode,
    payload: Bytes,
    cancel: &Signal,
) -> HashMap<usize, Error>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    assert!(
        clients.len() <= MAX_SELECT_CONNS,
        "broadcast over too many connections"
    );

    let mut handles = Vec::with_capacity(clients.len());
    for conn in clients {
        let conn = conn.clone();
        let payload = payload.clone();
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            // Cancellation only guards slot acquisition; once a send has
            // started it runs to completion so no torn frame hits the
            // wire.
            conn.send_acquired(opcode, &payload, &cancel).await
        }));
    }

    let mut errors = HashMap::new();
    for (i, handle) in handles.into_iter().enumerate() {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                errors.insert(i, e);
            }
            Err(_) => {
                errors.insert(i, Error::ConnClosed);
            }
        }
    }
    errors
}
