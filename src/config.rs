use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;
use tracing::warn;

const DEFAULT_LISTEN_PORT: u16 = 10443;
const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Immutable per-process configuration, built once at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_port: u16,
    /// Deadline for the inbound TLS handshake.
    pub handshake_timeout: Duration,
    /// Deadline for establishing an outbound transport.
    pub dial_timeout: Duration,
    /// Inactivity bound for a forward-fetch exchange.
    pub request_timeout: Duration,
    /// Inactivity bound for a spliced tunnel.
    pub idle_timeout: Duration,
    /// Inactivity bound for tunnels expected to stay quiet for long
    /// stretches (WebSocket-ish targets).
    pub long_idle_timeout: Duration,
    /// Hostname substrings that select `long_idle_timeout`.
    pub long_idle_hosts: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_LISTEN_PORT,
            handshake_timeout: Duration::from_secs(45),
            dial_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            request_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            idle_timeout: Duration::from_secs(60),
            long_idle_timeout: Duration::from_secs(120),
            long_idle_hosts: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary variable lookup. Unparseable values
    /// fall back to the defaults with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(raw) = lookup("HTTPS_PROXY_PORT").filter(|v| !v.is_empty()) {
            match raw.parse::<u16>() {
                Ok(port) => cfg.listen_port = port,
                Err(_) => warn!(value = %raw, "ignoring unparseable HTTPS_PROXY_PORT"),
            }
        }

        if let Some(raw) = lookup("PROXY_TIMEOUT").filter(|v| !v.is_empty()) {
            match raw.parse::<u64>() {
                Ok(ms) if ms > 0 => {
                    cfg.dial_timeout = Duration::from_millis(ms);
                    cfg.request_timeout = Duration::from_millis(ms);
                }
                _ => warn!(value = %raw, "ignoring unparseable PROXY_TIMEOUT"),
            }
        }

        if let Some(raw) = lookup("PROXY_LONG_IDLE_HOSTS") {
            cfg.long_idle_hosts = raw
                .split(',')
                .map(|s| s.trim().to_ascii_lowercase())
                .filter(|s| !s.is_empty())
                .collect();
        }

        cfg
    }

    /// Picks the splice inactivity window for a tunnel target.
    pub fn splice_idle_for(&self, host: &str, port: u16) -> Duration {
        let host = host.to_ascii_lowercase();
        if port == 443 || self.long_idle_hosts.iter().any(|p| host.contains(p.as_str())) {
            self.long_idle_timeout
        } else {
            self.idle_timeout
        }
    }
}

/// The preloaded TLS identity presented to every inbound client.
pub struct TlsIdentity {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no private key found in {0}")]
    MissingKey(PathBuf),
    #[error("no certificates found in {0}")]
    MissingCerts(PathBuf),
}

/// Loads the server identity from a certificate directory.
///
/// The key is read from `server.key`. The chain comes from `fullchain.crt`
/// when present, otherwise from `server.crt` with `ca.crt` appended if it
/// exists.
pub fn load_identity(dir: impl AsRef<Path>) -> Result<TlsIdentity, IdentityError> {
    let dir = dir.as_ref();

    let key_path = dir.join("server.key");
    let key = rustls_pemfile::private_key(&mut open(&key_path)?)
        .map_err(|source| IdentityError::Read { path: key_path.clone(), source })?
        .ok_or_else(|| IdentityError::MissingKey(key_path.clone()))?;

    let fullchain = dir.join("fullchain.crt");
    let mut cert_chain = if fullchain.is_file() {
        read_certs(&fullchain)?
    } else {
        let mut chain = read_certs(&dir.join("server.crt"))?;
        let ca = dir.join("ca.crt");
        if ca.is_file() {
            chain.extend(read_certs(&ca)?);
        }
        chain
    };
    cert_chain.dedup();

    if cert_chain.is_empty() {
        return Err(IdentityError::MissingCerts(dir.to_path_buf()));
    }
    Ok(TlsIdentity { cert_chain, key })
}

fn open(path: &Path) -> Result<BufReader<File>, IdentityError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| IdentityError::Read { path: path.to_path_buf(), source })
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, IdentityError> {
    rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| IdentityError::Read { path: path.to_path_buf(), source })
}
