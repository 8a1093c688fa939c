//! A local TLS-terminating forward proxy.
//!
//! Clients connect to a single TLS port and speak proxy-style HTTP/1.1 over
//! that channel: `CONNECT host:port` opens an opaque tunnel, absolute-URI
//! requests (`GET http://…`) are fetched on the client's behalf. Outbound
//! traffic goes directly to the origin or through a chained upstream proxy
//! (HTTP, HTTPS, SOCKS4, SOCKS5) resolved once at startup from the usual
//! environment variables.

pub mod classify;
pub mod config;
pub mod dial;
pub mod forward;
pub mod parse;
pub mod server;
pub mod splice;
pub mod tls;
pub mod tunnel;
pub mod upstream;

pub use config::{ServerConfig, TlsIdentity};
pub use dial::{DialUsage, Dialer};
pub use parse::{Authority, RequestEnvelope, RequestTarget};
pub use server::{Proxy, ServerState, Stats};
pub use upstream::UpstreamDescriptor;

/// Upper bound on an HTTP request or response header section.
pub(crate) const HEADER_SECTION_MAX_LENGTH: usize = 8192;
