//! Builds outbound byte-streams: direct TCP, CONNECT through an HTTP or
//! HTTPS upstream, or SOCKS4/SOCKS5 negotiation, with an optional TLS wrap
//! toward the target for forward-fetched `https:` origins.
//!
//! Callers receive a single opaque stream; nothing downstream knows what
//! wraps it.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::StatusCode;
use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_socks::tcp::{Socks4Stream, Socks5Stream};
use tracing::debug;

use crate::parse::Authority;
use crate::upstream::{Credentials, UpstreamDescriptor};
use crate::HEADER_SECTION_MAX_LENGTH;

/// Object-safe alias for anything the dialer can hand back.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

pub type BoxedStream = Box<dyn ByteStream>;

/// What the caller intends to do with the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialUsage {
    /// CONNECT tunnel; the client speaks end-to-end through it.
    Tunnel,
    /// Forward-fetch of an `http:` URL; the caller writes the request.
    ForwardHttp,
    /// Forward-fetch of an `https:` URL; the stream is TLS to the origin.
    ForwardHttps,
}

/// How the caller must frame a forward-fetch request on the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardLeg {
    /// Talking to the origin: origin-form request target.
    Origin,
    /// Talking to an HTTP proxy: absolute-form target, plus our own
    /// Proxy-Authorization when the upstream wants one.
    ViaHttpProxy { proxy_auth: Option<String> },
}

/// An established outbound stream.
pub struct Dialed {
    pub stream: BoxedStream,
    /// Bytes the upstream sent past its CONNECT response; they belong to
    /// the tunnel payload and must reach the client before anything else.
    pub early: Bytes,
    pub leg: ForwardLeg,
}

impl std::fmt::Debug for Dialed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialed")
            .field("early", &self.early)
            .field("leg", &self.leg)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum DialError {
    #[error("connect to {0} timed out")]
    Timeout(String),
    #[error("i/o during dial: {0}")]
    Io(#[from] io::Error),
    #[error("upstream proxy rejected CONNECT: {0}")]
    UpstreamRefused(String),
    #[error("upstream proxy sent an unparseable CONNECT response")]
    UpstreamGarbled,
    #[error("socks negotiation failed: {0}")]
    Socks(#[from] tokio_socks::Error),
    #[error("{0} is not a valid TLS server name")]
    ServerName(String),
    #[error("tls to {host} failed: {source}")]
    Tls {
        host: String,
        #[source]
        source: io::Error,
    },
}

impl DialError {
    /// Status to surface when the client can still be told.
    pub fn status(&self) -> StatusCode {
        match self {
            DialError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

pub struct Dialer {
    upstream: UpstreamDescriptor,
    connect_timeout: Duration,
    connector: TlsConnector,
    attempts: AtomicU64,
}

impl Dialer {
    pub fn new(upstream: UpstreamDescriptor, connect_timeout: Duration, connector: TlsConnector) -> Self {
        Self { upstream, connect_timeout, connector, attempts: AtomicU64::new(0) }
    }

    pub fn upstream(&self) -> &UpstreamDescriptor {
        &self.upstream
    }

    /// Number of dials attempted since startup.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Opens a stream to `target` according to the upstream descriptor and
    /// the intended usage. Partial sockets are dropped on failure.
    pub async fn dial(&self, target: &Authority, usage: DialUsage) -> Result<Dialed, DialError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        debug!(%target, ?usage, upstream = %self.upstream.describe(), "dialing");
        match tokio::time::timeout(self.connect_timeout, self.dial_inner(target, usage)).await {
            Ok(result) => result,
            Err(_) => Err(DialError::Timeout(target.to_string())),
        }
    }

    async fn dial_inner(&self, target: &Authority, usage: DialUsage) -> Result<Dialed, DialError> {
        match &self.upstream {
            UpstreamDescriptor::Direct => {
                let tcp = tcp_connect(target.host(), target.port()).await?;
                self.finish(Box::new(tcp), Bytes::new(), ForwardLeg::Origin, target, usage).await
            }
            UpstreamDescriptor::Http { host, port, creds } => {
                let tcp = tcp_connect(host, *port).await?;
                self.through_http_proxy(Box::new(tcp), creds.as_ref(), target, usage).await
            }
            UpstreamDescriptor::Https { host, port, creds } => {
                let tcp = tcp_connect(host, *port).await?;
                let tls = self.wrap_tls(Box::new(tcp), host).await?;
                self.through_http_proxy(tls, creds.as_ref(), target, usage).await
            }
            UpstreamDescriptor::Socks5 { host, port, creds } => {
                let stream = match creds {
                    Some(c) => {
                        Socks5Stream::connect_with_password(
                            (host.as_str(), *port),
                            (target.host(), target.port()),
                            &c.user,
                            &c.pass,
                        )
                        .await?
                    }
                    None => {
                        Socks5Stream::connect((host.as_str(), *port), (target.host(), target.port()))
                            .await?
                    }
                };
                let tcp = stream.into_inner();
                hygiene(&tcp);
                self.finish(Box::new(tcp), Bytes::new(), ForwardLeg::Origin, target, usage).await
            }
            UpstreamDescriptor::Socks4 { host, port } => {
                let stream =
                    Socks4Stream::connect((host.as_str(), *port), (target.host(), target.port()))
                        .await?;
                let tcp = stream.into_inner();
                hygiene(&tcp);
                self.finish(Box::new(tcp), Bytes::new(), ForwardLeg::Origin, target, usage).await
            }
        }
    }

    /// Continues on a stream already connected to an HTTP(S) proxy: either
    /// hands it back for an absolute-form request, or tunnels through it
    /// with CONNECT.
    async fn through_http_proxy(
        &self,
        mut stream: BoxedStream,
        creds: Option<&Credentials>,
        target: &Authority,
        usage: DialUsage,
    ) -> Result<Dialed, DialError> {
        if usage == DialUsage::ForwardHttp {
            return Ok(Dialed {
                stream,
                early: Bytes::new(),
                leg: ForwardLeg::ViaHttpProxy { proxy_auth: creds.map(Credentials::basic) },
            });
        }
        let early = connect_through(&mut stream, target, creds).await?;
        self.finish(stream, early, ForwardLeg::Origin, target, usage).await
    }

    /// Applies the final TLS wrap for forward-fetched `https:` origins.
    async fn finish(
        &self,
        stream: BoxedStream,
        early: Bytes,
        leg: ForwardLeg,
        target: &Authority,
        usage: DialUsage,
    ) -> Result<Dialed, DialError> {
        if usage != DialUsage::ForwardHttps {
            return Ok(Dialed { stream, early, leg });
        }
        // Any bytes the upstream already produced belong to the origin's
        // handshake; feed them back in front of the stream.
        let rewound = Rewound::new(early, stream);
        let tls = self.wrap_tls(Box::new(rewound), target.host()).await?;
        Ok(Dialed { stream: tls, early: Bytes::new(), leg })
    }

    async fn wrap_tls(&self, stream: BoxedStream, host: &str) -> Result<BoxedStream, DialError> {
        let name = ServerName::try_from(host.to_string())
            .map_err(|_| DialError::ServerName(host.to_string()))?;
        let tls = self
            .connector
            .connect(name, stream)
            .await
            .map_err(|source| DialError::Tls { host: host.to_string(), source })?;
        Ok(Box::new(tls))
    }
}

async fn tcp_connect(host: &str, port: u16) -> Result<TcpStream, DialError> {
    let tcp = TcpStream::connect((host, port)).await?;
    hygiene(&tcp);
    Ok(tcp)
}

/// Per-socket hygiene applied to every outbound TCP connection.
pub fn hygiene(tcp: &TcpStream) {
    let _ = tcp.set_nodelay(true);
    let keepalive = socket2::TcpKeepalive::new().with_time(Duration::from_secs(30));
    let _ = socket2::SockRef::from(tcp).set_tcp_keepalive(&keepalive);
}

/// Performs the CONNECT exchange on an open proxy stream. Returns whatever
/// the proxy sent past its response head.
async fn connect_through(
    stream: &mut BoxedStream,
    target: &Authority,
    creds: Option<&Credentials>,
) -> Result<Bytes, DialError> {
    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some(creds) = creds {
        request.push_str(&format!("Proxy-Authorization: {}\r\n", creds.basic()));
    }
    request.push_str("Proxy-Connection: Keep-Alive\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if buf.len() >= HEADER_SECTION_MAX_LENGTH {
            return Err(DialError::UpstreamGarbled);
        }
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(DialError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "upstream proxy closed during CONNECT",
            )));
        }

        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(&buf) {
            Ok(httparse::Status::Complete(head_len)) => {
                let code = response.code.ok_or(DialError::UpstreamGarbled)?;
                if !(200..300).contains(&code) {
                    let reason = response.reason.unwrap_or("").trim();
                    return Err(DialError::UpstreamRefused(format!("{code} {reason}")));
                }
                let _ = buf.split_to(head_len);
                return Ok(buf.freeze());
            }
            Ok(httparse::Status::Partial) => continue,
            Err(_) => return Err(DialError::UpstreamGarbled),
        }
    }
}

/// A stream with a chunk of already-read bytes stitched back in front.
struct Rewound<S> {
    buffered: Bytes,
    inner: S,
}

impl<S> Rewound<S> {
    fn new(buffered: Bytes, inner: S) -> Self {
        Self { buffered, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewound<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.buffered.is_empty() {
            let n = self.buffered.len().min(buf.remaining());
            let chunk = self.buffered.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewound<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
