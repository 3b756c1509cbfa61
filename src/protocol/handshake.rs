//! Opening handshake: upgrade-request validation and response building
//! (RFC 6455 Section 4).

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

/// The GUID appended to the client key when computing
/// `Sec-WebSocket-Accept` (RFC 6455).
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Compute the `Sec-WebSocket-Accept` value for a client key:
/// `base64(SHA1(key || GUID))`.
///
/// # Example
///
/// ```
/// use wsmux::compute_accept_key;
///
/// let accept = compute_accept_key("dGhlIHNhbXBsZSBub25jZQ==");
/// assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
/// ```
#[must_use]
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Characters allowed in an HTTP token (RFC 7230 Section 3.2.6).
fn is_token_byte(b: u8) -> bool {
    matches!(b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.'
        | b'^' | b'_' | b'`' | b'|' | b'~')
        || b.is_ascii_alphanumeric()
}

/// Whether any of the comma-separated token lists in `values` contains
/// `token`. The comparison is case-insensitive; `token` must be given in
/// lower case.
pub fn contains_token<'a>(values: impl Iterator<Item = &'a str>, token: &str) -> bool {
    for value in values {
        let found = value
            .as_bytes()
            .split(|b| !is_token_byte(*b))
            .any(|t| !t.is_empty() && t.eq_ignore_ascii_case(token.as_bytes()));
        if found {
            return true;
        }
    }
    false
}

/// Pick a sub-protocol: the first entry of the server's preference list
/// that the client also requested. Matching is exact (case-sensitive).
pub fn select_subprotocol<'a>(
    server_prefs: &'a [String],
    client_values: impl Iterator<Item = &'a str>,
) -> Option<&'a str> {
    let requested: Vec<&str> = client_values
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();

    server_prefs
        .iter()
        .map(String::as_str)
        .find(|p| requested.contains(p))
}

/// A parsed `Origin` header value (absolute URI).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    /// The full header value as sent by the client.
    pub raw: String,
    /// URI scheme, lower-cased.
    pub scheme: String,
    /// Authority (`host` or `host:port`).
    pub host: String,
}

impl Origin {
    /// Parse an Origin header value. Returns `None` unless the value is
    /// an absolute URI of the form `scheme://host[:port][/...]`.
    #[must_use]
    pub fn parse(value: &str) -> Option<Origin> {
        let (scheme, rest) = value.split_once("://")?;
        if scheme.is_empty()
            || !scheme.as_bytes()[0].is_ascii_alphabetic()
            || !scheme
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'-' | b'.'))
        {
            return None;
        }
        let host = rest.split(['/', '?', '#']).next().unwrap_or("");
        if host.is_empty() {
            return None;
        }
        Some(Origin {
            raw: value.to_string(),
            scheme: scheme.to_ascii_lowercase(),
            host: host.to_string(),
        })
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// A parsed HTTP upgrade request.
///
/// Either parsed from raw bytes with [`UpgradeRequest::parse`] (when the
/// endpoint owns the byte stream) or assembled field by field from an
/// HTTP server's request type via [`UpgradeRequest::new`] and
/// [`UpgradeRequest::header`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    /// HTTP method.
    pub method: String,
    /// Request target, e.g. `/chat?room=1`.
    pub target: String,
    /// Whether the protocol version is at least HTTP/1.1.
    pub http11: bool,
    headers: Vec<(String, String)>,
}

impl UpgradeRequest {
    /// Start building a request from pre-parsed parts.
    #[must_use]
    pub fn new(method: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            target: target.into(),
            http11: true,
            headers: Vec::new(),
        }
    }

    /// Append a header. Duplicate names are kept; token-list headers may
    /// be split across several entries.
    #[must_use]
    pub fn header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .push((name.as_ref().to_ascii_lowercase(), value.into()));
        self
    }

    /// Parse a raw HTTP/1.1 request head.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Handshake`] when the request line or a header
    /// line is malformed.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|_| Error::Handshake("request is not valid UTF-8".into()))?;
        let mut lines = text.lines();

        let request_line = lines
            .next()
            .ok_or_else(|| Error::Handshake("empty request".into()))?;
        let mut parts = request_line.split_whitespace();
        let (method, target, proto) = match (parts.next(), parts.next(), parts.next(), parts.next())
        {
            (Some(m), Some(t), Some(p), None) => (m, t, p),
            _ => return Err(Error::Handshake("malformed request line".into())),
        };

        let http11 = match proto.strip_prefix("HTTP/") {
            Some(v) => {
                let mut nums = v.splitn(2, '.');
                let major: u8 = nums.next().and_then(|n| n.parse().ok()).unwrap_or(0);
                let minor: u8 = nums.next().and_then(|n| n.parse().ok()).unwrap_or(0);
                major > 1 || (major == 1 && minor >= 1)
            }
            None => false,
        };

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| Error::Handshake("malformed header line".into()))?;
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }

        Ok(Self {
            method: method.to_string(),
            target: target.to_string(),
            http11,
            headers,
        })
    }

    /// First value of the named header, if present.
    #[must_use]
    pub fn header_value(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    /// All values of the named header, in order.
    pub fn header_values<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .filter(move |(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    /// The resource name derived from the request target: the path, with
    /// the query (if any) appended after an `&`.
    #[must_use]
    pub fn resource_name(&self) -> String {
        let (path, query) = match self.target.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (self.target.as_str(), None),
        };
        let path = if path.is_empty() { "/" } else { path };
        match query {
            Some(q) if !q.is_empty() => format!("{path}&{q}"),
            _ => path.to_string(),
        }
    }
}

/// The successful handshake response (`101 Switching Protocols`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeResponse {
    /// The `Sec-WebSocket-Accept` value.
    pub accept: String,
    /// Selected sub-protocol, if any.
    pub protocol: Option<String>,
    /// Value for the `Server` header, if configured.
    pub server: Option<String>,
}

impl UpgradeResponse {
    /// Serialize the response head, including the final empty line.
    pub fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
        buf.extend_from_slice(b"Upgrade: websocket\r\n");
        buf.extend_from_slice(b"Connection: Upgrade\r\n");
        buf.extend_from_slice(format!("Sec-WebSocket-Accept: {}\r\n", self.accept).as_bytes());
        if let Some(ref proto) = self.protocol {
            buf.extend_from_slice(format!("Sec-WebSocket-Protocol: {proto}\r\n").as_bytes());
        }
        if let Some(ref server) = self.server {
            buf.extend_from_slice(format!("Server: {server}\r\n").as_bytes());
        }
        buf.extend_from_slice(b"\r\n");
    }
}

/// An HTTP error response terminating a failed handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpRejection {
    /// HTTP status code: 400, 403, 426 or 500.
    pub status: u16,
}

impl HttpRejection {
    /// Malformed upgrade request.
    pub const BAD_REQUEST: HttpRejection = HttpRejection { status: 400 };
    /// Origin or access policy veto.
    pub const FORBIDDEN: HttpRejection = HttpRejection { status: 403 };
    /// Unsupported `Sec-WebSocket-Version`; the response advertises
    /// version 13.
    pub const UPGRADE_REQUIRED: HttpRejection = HttpRejection { status: 426 };
    /// The byte stream could not be taken over.
    pub const INTERNAL_ERROR: HttpRejection = HttpRejection { status: 500 };

    fn reason(&self) -> &'static str {
        match self.status {
            400 => "Bad Request",
            403 => "Forbidden",
            426 => "Upgrade Required",
            _ => "Internal Server Error",
        }
    }

    /// Serialize the rejection response.
    pub fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", self.status, self.reason()).as_bytes());
        if self.status == 426 {
            buf.extend_from_slice(b"Upgrade: websocket\r\n");
            buf.extend_from_slice(b"Connection: Upgrade\r\n");
            buf.extend_from_slice(b"Sec-WebSocket-Version: 13\r\n");
        }
        buf.extend_from_slice(b"Content-Length: 0\r\n\r\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    #[test]
    fn test_compute_accept_key_rfc_example() {
        // RFC 6455 Section 1.3 example.
        assert_eq!(compute_accept_key(SAMPLE_KEY), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_contains_token() {
        assert!(contains_token(["websocket"].into_iter(), "websocket"));
        assert!(contains_token(["WebSocket"].into_iter(), "websocket"));
        assert!(contains_token(["keep-alive, Upgrade"].into_iter(), "upgrade"));
        assert!(contains_token(
            ["keep-alive", "Upgrade"].into_iter(),
            "upgrade"
        ));
        assert!(!contains_token(["upgraded"].into_iter(), "upgrade"));
        assert!(!contains_token(["keep-alive"].into_iter(), "upgrade"));
        assert!(!contains_token([].into_iter(), "upgrade"));
    }

    #[test]
    fn test_select_subprotocol() {
        let prefs = vec!["chat".to_string(), "superchat".to_string()];
        assert_eq!(
            select_subprotocol(&prefs, ["superchat, chat"].into_iter()),
            Some("chat")
        );
        assert_eq!(
            select_subprotocol(&prefs, ["superchat"].into_iter()),
            Some("superchat")
        );
        assert_eq!(select_subprotocol(&prefs, ["other"].into_iter()), None);
        assert_eq!(select_subprotocol(&[], ["chat"].into_iter()), None);
        // Split across two header lines.
        assert_eq!(
            select_subprotocol(&prefs, ["other", " superchat "].into_iter()),
            Some("superchat")
        );
    }

    #[test]
    fn test_select_subprotocol_case_sensitive() {
        let prefs = vec!["chat".to_string()];
        assert_eq!(select_subprotocol(&prefs, ["Chat"].into_iter()), None);
    }

    #[test]
    fn test_origin_parse() {
        let origin = Origin::parse("https://example.com").unwrap();
        assert_eq!(origin.scheme, "https");
        assert_eq!(origin.host, "example.com");

        let origin = Origin::parse("http://example.com:8080/page").unwrap();
        assert_eq!(origin.host, "example.com:8080");

        assert!(Origin::parse("example.com").is_none());
        assert!(Origin::parse("://example.com").is_none());
        assert!(Origin::parse("https://").is_none());
        assert!(Origin::parse("1http://example.com").is_none());
    }

    #[test]
    fn test_parse_valid_request() {
        let request = b"GET /chat?room=7 HTTP/1.1\r\n\
            Host: server.example.com\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            Sec-WebSocket-Version: 13\r\n\
            Origin: http://example.com\r\n\
            Sec-WebSocket-Protocol: chat, superchat\r\n\
            \r\n";

        let req = UpgradeRequest::parse(request).unwrap();
        assert_eq!(req.method, "GET");
        assert!(req.http11);
        assert_eq!(req.header_value("host"), Some("server.example.com"));
        assert_eq!(req.header_value("sec-websocket-key"), Some(SAMPLE_KEY));
        assert_eq!(req.resource_name(), "/chat&room=7");
    }

    #[test]
    fn test_parse_header_case_insensitive() {
        let request = b"GET / HTTP/1.1\r\n\
            HOST: example.com\r\n\
            UPGRADE: WebSocket\r\n\
            \r\n";
        let req = UpgradeRequest::parse(request).unwrap();
        assert_eq!(req.header_value("Host"), Some("example.com"));
        assert_eq!(req.header_value("upgrade"), Some("WebSocket"));
    }

    #[test]
    fn test_parse_http10_flagged() {
        let req = UpgradeRequest::parse(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        assert!(!req.http11);
        let req = UpgradeRequest::parse(b"GET / HTTP/2\r\n\r\n").unwrap();
        assert!(req.http11);
    }

    #[test]
    fn test_parse_malformed() {
        assert!(UpgradeRequest::parse(b"").is_err());
        assert!(UpgradeRequest::parse(b"GET /\r\n\r\n").is_err());
        assert!(UpgradeRequest::parse(b"GET / HTTP/1.1\r\nbadheader\r\n\r\n").is_err());
        assert!(UpgradeRequest::parse(&[0xFF, 0xFE]).is_err());
    }

    #[test]
    fn test_multiple_header_values() {
        let req = UpgradeRequest::new("GET", "/")
            .header("Sec-WebSocket-Protocol", "a, b")
            .header("Sec-WebSocket-Protocol", "c");
        let values: Vec<_> = req.header_values("sec-websocket-protocol").collect();
        assert_eq!(values, vec!["a, b", "c"]);
    }

    #[test]
    fn test_resource_name_variants() {
        assert_eq!(UpgradeRequest::new("GET", "/chat").resource_name(), "/chat");
        assert_eq!(
            UpgradeRequest::new("GET", "/chat?x=1&y=2").resource_name(),
            "/chat&x=1&y=2"
        );
        assert_eq!(UpgradeRequest::new("GET", "").resource_name(), "/");
        assert_eq!(UpgradeRequest::new("GET", "/a?").resource_name(), "/a");
    }

    #[test]
    fn test_response_write() {
        let resp = UpgradeResponse {
            accept: "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=".to_string(),
            protocol: Some("chat".to_string()),
            server: Some("wsmux".to_string()),
        };

        let mut buf = Vec::new();
        resp.write(&mut buf);
        let text = String::from_utf8(buf).unwrap();

        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Upgrade: websocket\r\n"));
        assert!(text.contains("Connection: Upgrade\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(text.contains("Sec-WebSocket-Protocol: chat\r\n"));
        assert!(text.contains("Server: wsmux\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_rejection_write() {
        let mut buf = Vec::new();
        HttpRejection::UPGRADE_REQUIRED.write(&mut buf);
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("HTTP/1.1 426 Upgrade Required\r\n"));
        assert!(text.contains("Sec-WebSocket-Version: 13\r\n"));

        let mut buf = Vec::new();
        HttpRejection::BAD_REQUEST.write(&mut buf);
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(!text.contains("Sec-WebSocket-Version"));
    }
}
