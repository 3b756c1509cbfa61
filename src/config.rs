//! Configuration for WebSocket connections.

use std::time::Duration;

/// WebSocket endpoint configuration.
///
/// The defaults are suitable for production use; the builder methods
/// allow tightening or loosening individual knobs.
#[derive(Debug, Clone)]
pub struct Config {
    /// Value of the `Server` HTTP header sent during the handshake.
    /// Nothing is sent if empty.
    pub server_name: Option<String>,

    /// Sub-protocols the server implements, in decreasing order of
    /// preference. The first entry also requested by the client is
    /// selected; none is selected otherwise.
    pub subprotocols: Vec<String>,

    /// Maximum size of the HTTP upgrade request in bytes.
    ///
    /// Default: 8 KB (8192)
    pub max_handshake_size: usize,

    /// Grace window granted to the peer to answer a server-initiated
    /// close before the raw stream is forcibly closed.
    ///
    /// Default: 3 seconds
    pub close_grace: Duration,

    /// Largest payload chunk handed from the reader task to an
    /// application reader in one step.
    ///
    /// Default: 4 KB (4096)
    pub read_chunk_size: usize,

    /// Write buffer size for the underlying stream.
    ///
    /// Default: 8 KB (8192)
    pub write_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_name: None,
            subprotocols: Vec::new(),
            max_handshake_size: 8192,
            close_grace: Duration::from_secs(3),
            read_chunk_size: 4096,
            write_buffer_size: 8192,
        }
    }
}

impl Config {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the `Server` header value.
    #[must_use]
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Set the sub-protocol preference list.
    #[must_use]
    pub fn with_subprotocols(mut self, protocols: Vec<String>) -> Self {
        self.subprotocols = protocols;
        self
    }

    /// Set the maximum upgrade-request size.
    #[must_use]
    pub const fn with_max_handshake_size(mut self, size: usize) -> Self {
        self.max_handshake_size = size;
        self
    }

    /// Set the close grace window.
    #[must_use]
    pub const fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    /// Set the reader chunk size.
    #[must_use]
    pub const fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size;
        self
    }

    /// Set the write buffer size.
    #[must_use]
    pub const fn with_write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }
}
