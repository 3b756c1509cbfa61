//! Accepting connections: handshake orchestration.
//!
//! [`Upgrader`] validates an HTTP upgrade request against RFC 6455 and
//! the configured policies, and hands back either the `101` response
//! plus a live [`Conn`], or the HTTP error response to serve instead.
//!
//! Two entry points cover the common deployments:
//!
//! - [`Upgrader::accept`] owns the whole exchange over a raw byte
//!   stream (it reads the request head and writes the response), for
//!   servers that listen on a socket themselves;
//! - [`Upgrader::negotiate`] is the pure half for use under an external
//!   HTTP server: the caller writes the response and then hands the
//!   hijacked stream to [`Negotiated::into_conn`].

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::config::Config;
use crate::connection::conn::{Conn, ConnMeta, RequestData};
use crate::error::{Error, Result};
use crate::protocol::{
    compute_accept_key, contains_token, select_subprotocol, HttpRejection, Origin,
    UpgradeRequest, UpgradeResponse,
};

type OriginFn = dyn Fn(&Origin) -> bool + Send + Sync;
type AccessFn = dyn Fn(&UpgradeRequest) -> (bool, Option<RequestData>) + Send + Sync;

/// Accepts WebSocket connections.
pub struct Upgrader {
    config: Config,
    origin_allowed: Option<Arc<OriginFn>>,
    access_allowed: Option<Arc<AccessFn>>,
}

impl Upgrader {
    /// Create an upgrader with the given configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            origin_allowed: None,
            access_allowed: None,
        }
    }

    /// Override the origin policy. Without a callback, a same-origin
    /// policy applies: the origin's host must equal the request's
    /// `Host`.
    #[must_use]
    pub fn origin_allowed<F>(mut self, f: F) -> Self
    where
        F: Fn(&Origin) -> bool + Send + Sync + 'static,
    {
        self.origin_allowed = Some(Arc::new(f));
        self
    }

    /// Install an access callback. It decides whether the request may
    /// establish a connection and can attach application data, which
    /// becomes available as [`Conn::request_data`].
    #[must_use]
    pub fn access_allowed<F>(mut self, f: F) -> Self
    where
        F: Fn(&UpgradeRequest) -> (bool, Option<RequestData>) + Send + Sync + 'static,
    {
        self.access_allowed = Some(Arc::new(f));
        self
    }

    /// Validate an upgrade request. On success the result carries the
    /// `101` response to send and everything needed to start the
    /// connection; on failure it carries the HTTP error response to
    /// serve instead.
    ///
    /// # Errors
    ///
    /// The [`HttpRejection`] names the HTTP status: 400 for a malformed
    /// upgrade, 403 for an origin or access veto, 426 for an unsupported
    /// version.
    pub fn negotiate(&self, req: &UpgradeRequest) -> std::result::Result<Negotiated, HttpRejection> {
        if req.method != "GET" || !req.http11 {
            return Err(HttpRejection::BAD_REQUEST);
        }

        if !contains_token(req.header_values("upgrade"), "websocket") {
            return Err(HttpRejection::BAD_REQUEST);
        }
        if !contains_token(req.header_values("connection"), "upgrade") {
            return Err(HttpRejection::BAD_REQUEST);
        }

        let key = match req.header_value("sec-websocket-key") {
            Some(key) if !key.is_empty() => key,
            _ => return Err(HttpRejection::BAD_REQUEST),
        };

        if req.header_value("sec-websocket-version") != Some("13") {
            return Err(HttpRejection::UPGRADE_REQUIRED);
        }

        let protocol = select_subprotocol(
            &self.config.subprotocols,
            req.header_values("sec-websocket-protocol"),
        )
        .map(str::to_string);

        // CSRF protection: browsers always send Origin.
        let mut origin = None;
        if let Some(value) = req.header_value("origin") {
            let Some(parsed) = Origin::parse(value) else {
                return Err(HttpRejection::BAD_REQUEST);
            };
            let allowed = match &self.origin_allowed {
                Some(f) => f(&parsed),
                None => {
                    let host = req.header_value("host").unwrap_or("");
                    parsed.host.eq_ignore_ascii_case(host)
                }
            };
            if !allowed {
                debug!(origin = %parsed, "origin rejected");
                return Err(HttpRejection::FORBIDDEN);
            }
            origin = Some(parsed);
        }

        let mut request_data = None;
        if let Some(f) = &self.access_allowed {
            let (ok, data) = f(req);
            if !ok {
                return Err(HttpRejection::FORBIDDEN);
            }
            request_data = data;
        }

        Ok(Negotiated {
            response: UpgradeResponse {
                accept: compute_accept_key(key),
                protocol: protocol.clone(),
                server: self.config.server_name.clone(),
            },
            resource_name: req.resource_name(),
            origin,
            protocol,
            remote_addr: None,
            request_data,
            config: self.config.clone(),
        })
    }

    /// Accept a connection over a raw byte stream: read the upgrade
    /// request, write the `101` (or error) response, and start the
    /// connection.
    ///
    /// # Errors
    ///
    /// `Error::Handshake` when the request is rejected (after the HTTP
    /// error response has been written), `Error::Io` on stream failure.
    pub async fn accept<S>(&self, stream: S) -> Result<Conn<S>>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.accept_inner(stream, None).await
    }

    /// Like [`accept`](Upgrader::accept), recording the peer address on
    /// the connection.
    ///
    /// # Errors
    ///
    /// Same as [`accept`](Upgrader::accept).
    pub async fn accept_from<S>(&self, stream: S, addr: SocketAddr) -> Result<Conn<S>>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.accept_inner(stream, Some(addr)).await
    }

    async fn accept_inner<S>(&self, mut stream: S, addr: Option<SocketAddr>) -> Result<Conn<S>>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let head = read_request_head(&mut stream, self.config.max_handshake_size).await?;

        let req = match UpgradeRequest::parse(&head) {
            Ok(req) => req,
            Err(e) => {
                reject(&mut stream, HttpRejection::BAD_REQUEST).await;
                return Err(e);
            }
        };

        let mut negotiated = match self.negotiate(&req) {
            Ok(negotiated) => negotiated,
            Err(rejection) => {
                reject(&mut stream, rejection).await;
                return Err(Error::Handshake(format!(
                    "rejected with status {}",
                    rejection.status
                )));
            }
        };

        let mut response = Vec::new();
        negotiated.response.write(&mut response);
        stream.write_all(&response).await?;
        stream.flush().await?;

        negotiated.remote_addr = addr;
        Ok(negotiated.into_conn(stream))
    }
}

/// Serve an HTTP error response on a failed handshake. The stream is
/// about to be dropped, so write errors are ignored.
async fn reject<S>(stream: &mut S, rejection: HttpRejection)
where
    S: AsyncWrite + Unpin,
{
    let mut response = Vec::new();
    rejection.write(&mut response);
    let _ = stream.write_all(&response).await;
    let _ = stream.flush().await;
}

impl std::fmt::Debug for Upgrader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upgrader")
            .field("config", &self.config)
            .field("origin_allowed", &self.origin_allowed.is_some())
            .field("access_allowed", &self.access_allowed.is_some())
            .finish()
    }
}

/// Outcome of a successful [`Upgrader::negotiate`].
pub struct Negotiated {
    /// The `101 Switching Protocols` response to send to the client.
    pub response: UpgradeResponse,
    resource_name: String,
    origin: Option<Origin>,
    protocol: Option<String>,
    remote_addr: Option<SocketAddr>,
    request_data: Option<RequestData>,
    config: Config,
}

impl Negotiated {
    /// Record the peer address on the connection-to-be.
    #[must_use]
    pub fn remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Take ownership of the raw stream and start the connection. The
    /// `101` response must already have been sent.
    pub fn into_conn<S>(self, stream: S) -> Conn<S>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Conn::spawn(
            stream,
            ConnMeta {
                resource_name: self.resource_name,
                origin: self.origin,
                protocol: self.protocol,
                remote_addr: self.remote_addr,
                request_data: self.request_data,
            },
            self.config,
        )
    }
}

/// Read the HTTP request head (up to and including the blank line) one
/// byte at a time, so no frame bytes are consumed past the handshake.
async fn read_request_head<S>(stream: &mut S, max_size: usize) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(512);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= max_size {
            return Err(Error::Handshake("upgrade request too large".into()));
        }
        stream.read_exact(&mut byte).await?;
        head.push(byte[0]);
    }
    Ok(head)
}
