//! TLS configuration for both legs.
//!
//! Inbound: one preloaded identity presented to every client regardless of
//! SNI, no client-certificate verification. rustls negotiates the protocol
//! version and always honors server cipher preference, so no explicit
//! version pinning happens here.
//!
//! Outbound: origin and upstream certificates are verified against the
//! system trust store. Verification is not relaxed for convenience.

use std::sync::Arc;

use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::warn;

use crate::config::TlsIdentity;

/// Builds the acceptor for the listening side.
pub fn acceptor(identity: TlsIdentity) -> Result<TlsAcceptor, rustls::Error> {
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(identity.cert_chain, identity.key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Builds the connector used for outbound TLS (forward-fetch to `https:`
/// origins and `https://` upstream proxy legs).
pub fn connector() -> TlsConnector {
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_certs())
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

fn root_certs() -> rustls::RootCertStore {
    let mut store = rustls::RootCertStore::empty();
    let loaded = rustls_native_certs::load_native_certs();

    if let Some(err) = loaded.errors.first() {
        warn!(%err, "some system certificates failed to load");
    }
    for cert in loaded.certs {
        if let Err(err) = store.add(cert) {
            warn!(%err, "skipping unusable system certificate");
        }
    }
    store
}
