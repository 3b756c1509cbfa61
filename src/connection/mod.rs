//! Per-connection frame multiplexing.
//!
//! Each connection runs a reader task alongside the application. The
//! socket halves are never shared: the reader task owns the read half,
//! and exclusive write access is a value living in a one-capacity slot.
//! Any acquirer of a slot can also observe "shutting down" through the
//! same primitive, which is what sequences shutdown: reader exit →
//! close-frame emission → slot closed → terminal state recorded →
//! `shutdown_complete`.

pub(crate) mod conn;
pub(crate) mod reader;
pub(crate) mod select;
pub(crate) mod signal;
pub(crate) mod writer;

pub use conn::{Conn, RequestData};
pub use reader::MessageReader;
pub use select::{
    broadcast_binary, broadcast_text, select_binary, select_message, select_text,
    MAX_SELECT_CONNS,
};
pub use signal::Signal;
pub use writer::MessageWriter;
