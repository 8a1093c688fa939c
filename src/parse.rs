//! Request-head parsing and raw HTTP/1.1 response emission.
//!
//! The proxy hand-frames HTTP on the TLS stream: the CONNECT success block
//! must go out byte-exact and everything after it is opaque, so there is no
//! server framework between the socket and the handlers. Bytes the parser
//! read past the header terminator are handed back to the caller untouched.

use std::fmt;
use std::io;
use std::str::FromStr;

use bytes::{Bytes, BytesMut};
use http::{Method, StatusCode};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::HEADER_SECTION_MAX_LENGTH;

const MAX_HOST_LENGTH: usize = 253;

/// A validated `host:port` pair. Never constructed from unchecked input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authority {
    host: String,
    port: u16,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthorityError {
    #[error("empty host")]
    EmptyHost,
    #[error("host exceeds {MAX_HOST_LENGTH} characters")]
    HostTooLong,
    #[error("host contains forbidden characters")]
    BadHostCharset,
    #[error("port out of range")]
    BadPort,
}

impl Authority {
    pub fn new(host: &str, port: u16) -> Result<Self, AuthorityError> {
        let host = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
        if host.is_empty() {
            return Err(AuthorityError::EmptyHost);
        }
        if host.len() > MAX_HOST_LENGTH {
            return Err(AuthorityError::HostTooLong);
        }
        let ipv6ish = host.contains(':');
        let valid = if ipv6ish {
            host.bytes().all(|b| b.is_ascii_hexdigit() || b == b':' || b == b'.')
        } else {
            host.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-')
        };
        if !valid {
            return Err(AuthorityError::BadHostCharset);
        }
        if port == 0 {
            return Err(AuthorityError::BadPort);
        }
        Ok(Self { host: host.to_string(), port })
    }

    /// Parses a CONNECT request target. A bare host without a port defaults
    /// to 443.
    pub fn from_connect_target(target: &str) -> Result<Self, AuthorityError> {
        let target = target.trim();
        if let Some(rest) = target.strip_prefix('[') {
            // Bracketed IPv6: `[::1]:443` or `[::1]`.
            let end = rest.find(']').ok_or(AuthorityError::BadHostCharset)?;
            let host = &rest[..end];
            let port = match rest[end + 1..].strip_prefix(':') {
                Some(p) => p.parse::<u16>().map_err(|_| AuthorityError::BadPort)?,
                None if rest[end + 1..].is_empty() => 443,
                None => return Err(AuthorityError::BadHostCharset),
            };
            return Self::new(host, port);
        }
        match target.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| AuthorityError::BadPort)?;
                Self::new(host, port)
            }
            None => Self::new(target, 443),
        }
    }

    /// Hostname without brackets, as used for connecting and SNI.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl FromStr for Authority {
    type Err = AuthorityError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_connect_target(s)
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Request-target classification per RFC 9110.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestTarget {
    /// CONNECT authority-form, unvalidated as received.
    Tunnel(String),
    /// Absolute-form proxy request.
    Absolute(String),
    /// Origin-form: the client is talking to the proxy itself.
    Origin(String),
}

/// One parsed request head. Lives only for the duration of the request.
#[derive(Debug)]
pub struct RequestEnvelope {
    pub method: Method,
    pub target: RequestTarget,
    /// Headers with their original casing, in arrival order.
    pub headers: Vec<(String, String)>,
}

impl RequestEnvelope {
    /// Case-insensitive single-header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("i/o while reading request head: {0}")]
    Io(#[from] io::Error),
    #[error("malformed request: {0}")]
    Malformed(httparse::Error),
    #[error("invalid method token")]
    BadMethod,
    #[error("request head exceeds {HEADER_SECTION_MAX_LENGTH} bytes")]
    TooLarge,
    #[error("connection closed before a complete request")]
    Truncated,
}

impl ParseError {
    /// True when the failure deserves a 400 rather than a silent close.
    pub fn wants_response(&self) -> bool {
        matches!(self, ParseError::Malformed(_) | ParseError::BadMethod | ParseError::TooLarge)
    }
}

/// Reads one request head from the stream.
///
/// Returns the envelope plus any bytes read past the header terminator;
/// those belong to whatever follows (tunnel payload or request body) and
/// must be forwarded before further reads from `reader`.
pub async fn read_request_head<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<(RequestEnvelope, Bytes), ParseError> {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        let remaining = HEADER_SECTION_MAX_LENGTH - buf.len();
        if remaining == 0 {
            return Err(ParseError::TooLarge);
        }
        let n = (&mut *reader).take(remaining as u64).read_buf(&mut buf).await?;
        if n == 0 {
            return Err(ParseError::Truncated);
        }

        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(&buf) {
            Ok(httparse::Status::Complete(head_len)) => {
                let envelope = envelope_from(&req)?;
                let _ = buf.split_to(head_len);
                return Ok((envelope, buf.freeze()));
            }
            Ok(httparse::Status::Partial) => continue,
            Err(err) => return Err(ParseError::Malformed(err)),
        }
    }
}

fn envelope_from(req: &httparse::Request<'_, '_>) -> Result<RequestEnvelope, ParseError> {
    let method_token = req.method.ok_or(ParseError::BadMethod)?;
    let method = Method::from_bytes(method_token.as_bytes()).map_err(|_| ParseError::BadMethod)?;
    let path = req.path.unwrap_or("/").to_string();

    let target = if method == Method::CONNECT {
        RequestTarget::Tunnel(path)
    } else if path.contains("://") {
        RequestTarget::Absolute(path)
    } else {
        RequestTarget::Origin(path)
    };

    let headers = req
        .headers
        .iter()
        .filter(|h| !h.name.is_empty())
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
        .collect();

    Ok(RequestEnvelope { method, target, headers })
}

/// The byte-exact CONNECT success block.
pub fn connect_established() -> String {
    format!(
        "HTTP/1.1 200 Connection Established\r\n\
         Proxy-agent: {}/{}\r\n\
         Connection: keep-alive\r\n\
         Keep-Alive: timeout=60, max=1000\r\n\
         Proxy-Connection: keep-alive\r\n\
         \r\n",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
    )
}

/// Writes a plain-text error response and flushes it.
pub async fn write_plain_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: StatusCode,
    body: &str,
) -> io::Result<()> {
    let reason = status.canonical_reason().unwrap_or("");
    let head = format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n",
        status.as_u16(),
        reason,
        body.len(),
    );
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(body.as_bytes()).await?;
    writer.flush().await
}

/// Writes the informational HTML page served for origin-form requests.
pub async fn write_html_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    body: &str,
) -> io::Result<()> {
    let head = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/html\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n",
        body.len(),
    );
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(body.as_bytes()).await?;
    writer.flush().await
}

/// Answers an OPTIONS pre-flight with permissive CORS headers.
pub async fn write_cors_preflight<W: AsyncWrite + Unpin>(writer: &mut W) -> io::Result<()> {
    writer
        .write_all(
            b"HTTP/1.1 200 OK\r\n\
              Access-Control-Allow-Origin: *\r\n\
              Access-Control-Allow-Methods: *\r\n\
              Access-Control-Allow-Headers: *\r\n\
              Content-Length: 0\r\n\
              Connection: close\r\n\
              \r\n",
        )
        .await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_connect_with_leftover() {
        let raw = b"CONNECT example.test:443 HTTP/1.1\r\nHost: example.test:443\r\n\r\n\x16\x03\x01";
        let mut cursor = std::io::Cursor::new(&raw[..]);
        let (envelope, leftover) = read_request_head(&mut cursor).await.unwrap();
        assert_eq!(envelope.method, Method::CONNECT);
        assert_eq!(envelope.target, RequestTarget::Tunnel("example.test:443".into()));
        assert_eq!(envelope.header("host"), Some("example.test:443"));
        assert_eq!(&leftover[..], b"\x16\x03\x01");
    }

    #[tokio::test]
    async fn classifies_absolute_and_origin_forms() {
        let raw = b"GET http://origin.test/ping HTTP/1.1\r\nHost: proxy\r\n\r\n";
        let mut cursor = std::io::Cursor::new(&raw[..]);
        let (envelope, leftover) = read_request_head(&mut cursor).await.unwrap();
        assert_eq!(envelope.target, RequestTarget::Absolute("http://origin.test/ping".into()));
        assert!(leftover.is_empty());

        let raw = b"GET /status HTTP/1.1\r\nHost: proxy\r\n\r\n";
        let mut cursor = std::io::Cursor::new(&raw[..]);
        let (envelope, _) = read_request_head(&mut cursor).await.unwrap();
        assert_eq!(envelope.target, RequestTarget::Origin("/status".into()));
    }

    #[tokio::test]
    async fn header_case_is_preserved() {
        let raw = b"GET http://o.test/ HTTP/1.1\r\nX-CuStOm: v\r\n\r\n";
        let mut cursor = std::io::Cursor::new(&raw[..]);
        let (envelope, _) = read_request_head(&mut cursor).await.unwrap();
        assert_eq!(envelope.headers[0].0, "X-CuStOm");
        assert_eq!(envelope.header("x-custom"), Some("v"));
    }

    #[tokio::test]
    async fn garbage_is_malformed() {
        let raw = b"\x16\x03\x01\x02\x00garbage\r\n\r\n";
        let mut cursor = std::io::Cursor::new(&raw[..]);
        let err = read_request_head(&mut cursor).await.unwrap_err();
        assert!(matches!(err, ParseError::Malformed(_)));
        assert!(err.wants_response());
    }

    #[tokio::test]
    async fn early_eof_is_truncated() {
        let raw = b"GET /inco";
        let mut cursor = std::io::Cursor::new(&raw[..]);
        let err = read_request_head(&mut cursor).await.unwrap_err();
        assert!(matches!(err, ParseError::Truncated));
        assert!(!err.wants_response());
    }

    #[test]
    fn authority_accepts_and_rejects() {
        assert!(Authority::from_connect_target("example.test:443").is_ok());
        assert!(Authority::from_connect_target("example.test").is_ok());
        assert_eq!(Authority::from_connect_target("example.test").unwrap().port(), 443);
        assert!(Authority::from_connect_target("[2001:db8::1]:8443").is_ok());
        assert!(Authority::from_connect_target("[2001:db8::1]").is_ok());

        assert_eq!(
            Authority::from_connect_target("bad|host:443"),
            Err(AuthorityError::BadHostCharset)
        );
        assert_eq!(Authority::from_connect_target(":443"), Err(AuthorityError::EmptyHost));
        assert_eq!(Authority::from_connect_target("host:0"), Err(AuthorityError::BadPort));
        assert_eq!(Authority::from_connect_target("host:99999"), Err(AuthorityError::BadPort));
        let long = format!("{}:443", "a".repeat(254));
        assert_eq!(Authority::from_connect_target(&long), Err(AuthorityError::HostTooLong));
    }

    #[test]
    fn authority_display_rebrackets_ipv6() {
        let authority = Authority::from_connect_target("[::1]:8443").unwrap();
        assert_eq!(authority.host(), "::1");
        assert_eq!(authority.to_string(), "[::1]:8443");
    }

    #[test]
    fn connect_established_block_shape() {
        let block = connect_established();
        assert!(block.starts_with("HTTP/1.1 200 Connection Established\r\nProxy-agent: "));
        assert!(block.contains("\r\nConnection: keep-alive\r\n"));
        assert!(block.contains("\r\nKeep-Alive: timeout=60, max=1000\r\n"));
        assert!(block.contains("\r\nProxy-Connection: keep-alive\r\n"));
        assert!(block.ends_with("\r\n\r\n"));
    }
}
