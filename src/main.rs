use std::net::SocketAddr;

use anyhow::Context as _;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use tlsgate::config::{load_identity, ServerConfig};
use tlsgate::server::Proxy;
use tlsgate::upstream::UpstreamDescriptor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    // Install the ring crypto provider for rustls before any TLS operations.
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    // A panicking connection task must never take the process down; log it
    // and move on.
    std::panic::set_hook(Box::new(|panic| {
        error!(%panic, "panic in connection task");
    }));

    let config = ServerConfig::from_env();
    let upstream = UpstreamDescriptor::resolve_from_env();
    let identity = load_identity("certs").context("loading TLS identity from certs/")?;

    let addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, upstream = %upstream.describe(), "starting proxy");

    let proxy = Proxy::new(config, upstream, identity)?;

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    proxy.run(listener, shutdown).await
}

fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut terminate = match signal(SignalKind::terminate()) {
                Ok(terminate) => terminate,
                Err(err) => {
                    error!(%err, "failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    shutdown.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                _ = terminate.recv() => info!("received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("received interrupt");
        }
        shutdown.cancel();
    });
}
