//! # wsmux - Server-side WebSocket endpoint
//!
//! `wsmux` upgrades HTTP/1.1 connections to the WebSocket protocol
//! (RFC 6455) and multiplexes full-duplex message traffic over the
//! resulting byte stream.
//!
//! ## Design
//!
//! - **Slot-based duplex**: per connection, a reader task owns the read
//!   half of the stream and a one-capacity sender slot models exclusive
//!   write access. Application sends and reader-initiated control
//!   frames serialize through the same slot.
//! - **Streaming messages**: payloads are pumped to the application in
//!   bounded chunks; a message never has to fit in memory.
//! - **Orderly shutdown**: exactly one close frame per connection,
//!   reader shutdown → close emission → writer shutdown → socket close,
//!   with a grace timer covering unresponsive peers.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use wsmux::{Config, Status, Upgrader};
//!
//! # async fn run() -> wsmux::Result<()> {
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//! let upgrader = Upgrader::new(Config::new());
//!
//! loop {
//!     let (stream, addr) = listener.accept().await?;
//!     let conn = upgrader.accept_from(stream, addr).await?;
//!     tokio::spawn(async move {
//!         while let Ok(text) = conn.receive_text(1 << 20).await {
//!             let _ = conn.send_text(&text).await;
//!         }
//!         let _ = conn.close(Status::Normal, "").await;
//!         let terminal = conn.wait().await;
//!         println!("closed: {:?}", terminal);
//!     });
//! }
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod message;
pub mod protocol;
pub mod upgrader;

pub use config::Config;
pub use connection::{
    broadcast_binary, broadcast_text, select_binary, select_message, select_text, Conn,
    MessageReader, MessageWriter, RequestData, Signal, MAX_SELECT_CONNS,
};
pub use error::{Error, Result};
pub use message::{CloseReason, MessageKind, Status, Terminal};
pub use protocol::{
    compute_accept_key, HttpRejection, Origin, UpgradeRequest, UpgradeResponse, WS_GUID,
};
pub use upgrader::{Negotiated, Upgrader};
