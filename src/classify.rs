//! Maps low-level I/O and TLS failures to a small set of tags that decide
//! log verbosity everywhere else. Clients probing the TLS port with plain
//! HTTP, or dropping mid-handshake, are background noise and must never
//! reach error-level logs.

use std::collections::HashMap;
use std::io;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use rustls::AlertDescription;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Expected client churn: resets, broken pipes, mid-handshake drops.
    BenignDrop,
    /// Worth a log line, nothing more.
    Report,
    /// The peer did not speak the TLS version we expected, or did not speak
    /// TLS at all.
    SslVersionMismatch,
    /// The client refused our certificate.
    SslUnknownCa,
    Timeout,
    /// The listener or process itself is in trouble.
    Fatal,
}

/// Classifies an I/O error, looking through to an embedded rustls error
/// when one is present.
pub fn classify(err: &io::Error) -> ErrorClass {
    if let Some(tls) = err.get_ref().and_then(|e| e.downcast_ref::<rustls::Error>()) {
        return classify_tls(tls);
    }
    match err.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotConnected
        | io::ErrorKind::UnexpectedEof => ErrorClass::BenignDrop,
        io::ErrorKind::TimedOut => ErrorClass::Timeout,
        io::ErrorKind::OutOfMemory => ErrorClass::Fatal,
        _ => classify_message(&err.to_string()),
    }
}

pub fn classify_tls(err: &rustls::Error) -> ErrorClass {
    match err {
        rustls::Error::AlertReceived(AlertDescription::UnknownCA)
        | rustls::Error::AlertReceived(AlertDescription::BadCertificate)
        | rustls::Error::AlertReceived(AlertDescription::CertificateUnknown) => {
            ErrorClass::SslUnknownCa
        }
        // Garbage where a ClientHello should be, or a legacy protocol
        // version we do not implement.
        rustls::Error::InvalidMessage(_)
        | rustls::Error::PeerIncompatible(_)
        | rustls::Error::PeerSentOversizedRecord => ErrorClass::SslVersionMismatch,
        rustls::Error::AlertReceived(_) => ErrorClass::BenignDrop,
        _ => ErrorClass::Report,
    }
}

/// Substring fallback for errors that only carry a message. The phrasings
/// cover the disconnect noise produced by common client stacks.
fn classify_message(message: &str) -> ErrorClass {
    const BENIGN: &[&str] = &[
        "ECONNRESET",
        "EPIPE",
        "ENOTCONN",
        "socket hang up",
        "Client network socket disconnected",
        "before secure TLS connection",
    ];
    if BENIGN.iter().any(|needle| message.contains(needle)) {
        ErrorClass::BenignDrop
    } else {
        ErrorClass::Report
    }
}

impl ErrorClass {
    /// True when the error should be swallowed (at most a debug line).
    pub fn is_quiet(self) -> bool {
        matches!(
            self,
            ErrorClass::BenignDrop
                | ErrorClass::SslVersionMismatch
                | ErrorClass::SslUnknownCa
                | ErrorClass::Timeout
        )
    }
}

static HINT_STATE: Lazy<Mutex<HashMap<ErrorClass, Instant>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

const HINT_INTERVAL: Duration = Duration::from_secs(60);

/// Emits the operator hint for a classification, at most once a minute per
/// class. Anything without a hint is a no-op.
pub fn emit_hint(class: ErrorClass) {
    let hint = match class {
        ErrorClass::SslVersionMismatch => {
            "clients are sending non-TLS or legacy-TLS data to the TLS port; \
             likely a client configured with an http:// proxy URL, or a client \
             too old to speak TLS 1.2"
        }
        ErrorClass::SslUnknownCa => {
            "clients are rejecting the proxy certificate; either disable \
             verification in the client, point it at the certificate file, or \
             install the certificate in the system trust store"
        }
        _ => return,
    };

    let mut state = match HINT_STATE.lock() {
        Ok(state) => state,
        Err(_) => return,
    };
    let now = Instant::now();
    let due = state
        .get(&class)
        .map(|last| now.duration_since(*last) >= HINT_INTERVAL)
        .unwrap_or(true);
    if due {
        state.insert(class, now);
        warn!("{hint}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_kinds_map_to_benign() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::NotConnected,
            io::ErrorKind::ConnectionAborted,
        ] {
            let err = io::Error::new(kind, "boom");
            assert_eq!(classify(&err), ErrorClass::BenignDrop, "{kind:?}");
        }
    }

    #[test]
    fn timeout_maps_to_timeout() {
        let err = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert_eq!(classify(&err), ErrorClass::Timeout);
    }

    #[test]
    fn message_substrings_are_benign() {
        for msg in [
            "read ECONNRESET",
            "write EPIPE",
            "socket hang up",
            "Client network socket disconnected before secure TLS connection was established",
        ] {
            let err = io::Error::other(msg);
            assert_eq!(classify(&err), ErrorClass::BenignDrop, "{msg}");
        }
    }

    #[test]
    fn unknown_errors_report() {
        let err = io::Error::other("some novel failure");
        assert_eq!(classify(&err), ErrorClass::Report);
    }

    #[test]
    fn wrapped_tls_garbage_is_version_mismatch() {
        let tls = rustls::Error::InvalidMessage(rustls::InvalidMessage::InvalidContentType);
        let err = io::Error::new(io::ErrorKind::InvalidData, tls);
        assert_eq!(classify(&err), ErrorClass::SslVersionMismatch);
    }

    #[test]
    fn unknown_ca_alert_is_classified() {
        let tls = rustls::Error::AlertReceived(AlertDescription::UnknownCA);
        assert_eq!(classify_tls(&tls), ErrorClass::SslUnknownCa);
    }

    #[test]
    fn quiet_covers_noise_classes() {
        assert!(ErrorClass::BenignDrop.is_quiet());
        assert!(ErrorClass::SslVersionMismatch.is_quiet());
        assert!(!ErrorClass::Report.is_quiet());
        assert!(!ErrorClass::Fatal.is_quiet());
    }
}
