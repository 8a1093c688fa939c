//! Listener ownership, per-connection dispatch, and the counters that prove
//! every accepted connection is cleaned up exactly once.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use http::Method;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classify::{classify, emit_hint};
use crate::config::{ServerConfig, TlsIdentity};
use crate::dial::{self, Dialer};
use crate::parse::{self, ParseError, RequestTarget};
use crate::upstream::UpstreamDescriptor;
use crate::{forward, tls, tunnel};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const STATS_INTERVAL: Duration = Duration::from_secs(60);

const STATUS_PAGE: &str = concat!(
    "<!DOCTYPE html>\n<html>\n<head><title>",
    env!("CARGO_PKG_NAME"),
    "</title></head>\n<body>\n<h1>",
    env!("CARGO_PKG_NAME"),
    " ",
    env!("CARGO_PKG_VERSION"),
    "</h1>\n<p>This is a TLS-terminating forward proxy. Configure it as your \
     HTTPS proxy and issue CONNECT or absolute-URI requests.</p>\n</body>\n</html>\n",
);

/// Lifecycle and traffic counters. Doubles as the test hook proving that
/// opened == closed at the end of every scenario.
#[derive(Debug, Default)]
pub struct Stats {
    opened: AtomicU64,
    closed: AtomicU64,
    active: AtomicU64,
    tunnels: AtomicU64,
    forwards: AtomicU64,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

impl Stats {
    pub fn opened(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }
    pub fn closed(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }
    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    pub(crate) fn tunnels_opened(&self) {
        self.tunnels.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn forwards_opened(&self) {
        self.forwards.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn add_transfer(&self, up: u64, down: u64) {
        self.bytes_up.fetch_add(up, Ordering::Relaxed);
        self.bytes_down.fetch_add(down, Ordering::Relaxed);
    }

    fn log_line(&self) {
        info!(
            opened = self.opened(),
            active = self.active(),
            tunnels = self.tunnels.load(Ordering::Relaxed),
            forwards = self.forwards.load(Ordering::Relaxed),
            bytes_up = self.bytes_up.load(Ordering::Relaxed),
            bytes_down = self.bytes_down.load(Ordering::Relaxed),
            "proxy stats",
        );
    }
}

/// Ties connection accounting to scope exit so cleanup is observed exactly
/// once per accepted connection, panics included.
struct ConnectionGuard {
    stats: Arc<Stats>,
}

impl ConnectionGuard {
    fn new(stats: Arc<Stats>) -> Self {
        stats.opened.fetch_add(1, Ordering::Relaxed);
        stats.active.fetch_add(1, Ordering::Relaxed);
        Self { stats }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.stats.closed.fetch_add(1, Ordering::Relaxed);
        self.stats.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Everything a connection task needs; immutable after startup.
pub struct ServerState {
    pub config: ServerConfig,
    pub dialer: Dialer,
    pub stats: Arc<Stats>,
}

pub struct Proxy {
    state: Arc<ServerState>,
    acceptor: TlsAcceptor,
}

impl Proxy {
    pub fn new(
        config: ServerConfig,
        upstream: UpstreamDescriptor,
        identity: TlsIdentity,
    ) -> anyhow::Result<Self> {
        let acceptor = tls::acceptor(identity).context("invalid TLS identity")?;
        let dialer = Dialer::new(upstream, config.dial_timeout, tls::connector());
        let state = Arc::new(ServerState {
            config,
            dialer,
            stats: Arc::new(Stats::default()),
        });
        Ok(Self { state, acceptor })
    }

    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    /// Accepts connections until `shutdown` fires, then drains in-flight
    /// connections for a short grace period.
    pub async fn run(&self, listener: TcpListener, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!(
            upstream = %self.state.dialer.upstream().describe(),
            "accepting proxied connections"
        );

        let stats = Arc::clone(&self.state.stats);
        let stats_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATS_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                stats.log_line();
            }
        });

        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        // The listener itself survives accept faults; back
                        // off briefly so a persistent fault cannot spin.
                        if classify(&err).is_quiet() {
                            debug!(%err, "accept error");
                        } else {
                            warn!(%err, "accept failed, backing off");
                        }
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        continue;
                    }
                },
                _ = shutdown.cancelled() => break,
            };

            let state = Arc::clone(&self.state);
            let acceptor = self.acceptor.clone();
            tokio::spawn(async move {
                let _guard = ConnectionGuard::new(Arc::clone(&state.stats));
                handle_connection(stream, peer, acceptor, state).await;
            });
        }

        stats_task.abort();
        self.drain().await;
        Ok(())
    }

    async fn drain(&self) {
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while self.state.stats.active() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let leftover = self.state.stats.active();
        if leftover > 0 {
            warn!(connections = leftover, "grace period expired, closing remaining connections");
        }
        info!("listener stopped");
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    state: Arc<ServerState>,
) {
    dial::hygiene(&stream);

    let handshake = tokio::time::timeout(state.config.handshake_timeout, acceptor.accept(stream));
    let mut client = match handshake.await {
        Ok(Ok(client)) => client,
        Ok(Err(err)) => {
            let class = classify(&err);
            emit_hint(class);
            if class.is_quiet() {
                debug!(%peer, %err, "inbound TLS handshake failed");
            } else {
                warn!(%peer, %err, "inbound TLS handshake failed");
            }
            return;
        }
        Err(_) => {
            debug!(%peer, "inbound TLS handshake timed out");
            return;
        }
    };

    let head = tokio::time::timeout(
        state.config.request_timeout,
        parse::read_request_head(&mut client),
    );
    let (envelope, leftover) = match head.await {
        Ok(Ok(parsed)) => parsed,
        Ok(Err(err)) => {
            if err.wants_response() {
                debug!(%peer, %err, "rejecting malformed request");
                let body = format!("{err}\n");
                let _ =
                    parse::write_plain_response(&mut client, http::StatusCode::BAD_REQUEST, &body)
                        .await;
                let _ = client.shutdown().await;
            } else if let ParseError::Io(io_err) = &err {
                if !classify(io_err).is_quiet() {
                    warn!(%peer, %err, "request read failed");
                }
            } else {
                debug!(%peer, %err, "client left before sending a request");
            }
            return;
        }
        Err(_) => {
            debug!(%peer, "timed out waiting for a request");
            return;
        }
    };

    match &envelope.target {
        RequestTarget::Tunnel(raw) => {
            let raw = raw.clone();
            tunnel::serve_connect(&mut client, &raw, leftover, &state).await;
        }
        RequestTarget::Absolute(raw) => {
            let raw = raw.clone();
            forward::serve_forward(&mut client, &envelope, leftover, &raw, &state).await;
        }
        RequestTarget::Origin(path) => {
            // The client is talking to the proxy itself.
            debug!(%peer, %path, method = %envelope.method, "origin-form request");
            if envelope.method == Method::OPTIONS {
                let _ = parse::write_cors_preflight(&mut client).await;
            } else {
                let _ = parse::write_html_response(&mut client, STATUS_PAGE).await;
            }
        }
    }

    // Close cleanly so well-behaved TLS clients see close_notify rather
    // than a bare FIN. Redundant after a completed splice, harmless then.
    let _ = client.shutdown().await;
}
