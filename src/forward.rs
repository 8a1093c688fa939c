//! Services absolute-URI proxy requests: the proxy performs the fetch on
//! the client's behalf, streaming both bodies without buffering them.

use bytes::Bytes;
use http::{Method, StatusCode};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use url::Url;

use crate::classify::classify;
use crate::dial::{ByteStream, DialUsage, ForwardLeg};
use crate::parse::{self, Authority, RequestEnvelope};
use crate::server::ServerState;
use crate::splice;

const ALLOWED_METHODS: [Method; 7] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::HEAD,
    Method::OPTIONS,
    Method::PATCH,
];

/// Headers never copied into the outbound request. `sec-websocket-*` is
/// matched by prefix alongside these.
const STRIPPED_HEADERS: [&str; 5] =
    ["host", "proxy-connection", "proxy-authorization", "connection", "upgrade"];

const MAX_HOST_HEADER: usize = 255;

pub async fn serve_forward<S>(
    client: &mut S,
    envelope: &RequestEnvelope,
    leftover: Bytes,
    raw_url: &str,
    state: &ServerState,
) where
    S: ByteStream,
{
    let url = match Url::parse(raw_url) {
        Ok(url) if url.scheme() == "http" || url.scheme() == "https" => url,
        _ => {
            debug!(url = %raw_url, "rejecting forward request target");
            let _ = parse::write_plain_response(
                client,
                StatusCode::BAD_REQUEST,
                "only http: and https: URLs can be forwarded\n",
            )
            .await;
            return;
        }
    };

    if !ALLOWED_METHODS.contains(&envelope.method) {
        let _ = parse::write_plain_response(
            client,
            StatusCode::METHOD_NOT_ALLOWED,
            "method not allowed\n",
        )
        .await;
        return;
    }

    // TLS records misread as HTTP produce absurd Host values; catch them
    // before anything goes outbound.
    if !host_header_is_sane(envelope.header("host")) {
        let _ = parse::write_plain_response(
            client,
            StatusCode::BAD_REQUEST,
            "missing or malformed Host header; use CONNECT for TLS targets\n",
        )
        .await;
        return;
    }

    let https = url.scheme() == "https";
    let default_port = if https { 443 } else { 80 };
    let port = url.port().unwrap_or(default_port);
    let host = url.host_str().unwrap_or("");
    let target = match Authority::new(host, port) {
        Ok(target) => target,
        Err(err) => {
            debug!(url = %raw_url, %err, "rejecting forward URL authority");
            let body = format!("invalid URL authority: {err}\n");
            let _ = parse::write_plain_response(client, StatusCode::BAD_REQUEST, &body).await;
            return;
        }
    };

    let usage = if https { DialUsage::ForwardHttps } else { DialUsage::ForwardHttp };
    let dialed = match state.dialer.dial(&target, usage).await {
        Ok(dialed) => dialed,
        Err(err) => {
            info!(%target, %err, "forward dial failed");
            let body = format!("{err}\n");
            let _ = parse::write_plain_response(client, err.status(), &body).await;
            return;
        }
    };
    let mut outbound = dialed.stream;

    let head = build_outbound_head(envelope, &url, port == default_port, &dialed.leg);
    if let Err(err) = outbound.write_all(head.as_bytes()).await {
        info!(%target, %err, "failed to send forward request");
        let body = format!("upstream write failed: {err}\n");
        let _ = parse::write_plain_response(client, StatusCode::BAD_GATEWAY, &body).await;
        return;
    }
    // Body bytes that arrived behind the request head.
    if !leftover.is_empty() {
        if let Err(err) = outbound.write_all(&leftover).await {
            info!(%target, %err, "failed to send forward request body");
            let body = format!("upstream write failed: {err}\n");
            let _ = parse::write_plain_response(client, StatusCode::BAD_GATEWAY, &body).await;
            return;
        }
    }

    state.stats.forwards_opened();
    // Once response bytes start flowing the client owns the framing; a
    // mid-stream failure closes both sides and the truncation is the
    // client's signal.
    match splice::splice(&mut *client, outbound, state.config.request_timeout).await {
        Ok(totals) => {
            state.stats.add_transfer(totals.a_to_b, totals.b_to_a);
            debug!(%target, sent = totals.a_to_b, received = totals.b_to_a, "forward closed");
        }
        Err(err) => {
            let class = classify(&err);
            if class.is_quiet() {
                debug!(%target, %err, "forward ended");
            } else {
                warn!(%target, %err, "forward error");
            }
        }
    }
}

fn host_header_is_sane(value: Option<&str>) -> bool {
    match value {
        None => false,
        Some(host) => {
            !host.is_empty()
                && host.len() <= MAX_HOST_HEADER
                && host.bytes().all(|b| (0x20..0x7f).contains(&b))
        }
    }
}

/// Builds the sanitized outbound request head.
///
/// The target is origin-form toward an origin and absolute-form toward an
/// HTTP upstream proxy; `Host` always names the URL authority, omitting
/// default ports.
fn build_outbound_head(
    envelope: &RequestEnvelope,
    url: &Url,
    default_port: bool,
    leg: &ForwardLeg,
) -> String {
    let host = url.host_str().unwrap_or("");
    let host_value = if default_port {
        host.to_string()
    } else {
        format!("{}:{}", host, url.port().unwrap_or(0))
    };

    let request_target = match leg {
        ForwardLeg::Origin => {
            let mut target = url.path().to_string();
            if let Some(query) = url.query() {
                target.push('?');
                target.push_str(query);
            }
            target
        }
        ForwardLeg::ViaHttpProxy { .. } => url.as_str().to_string(),
    };

    let mut head = format!("{} {} HTTP/1.1\r\n", envelope.method, request_target);
    head.push_str(&format!("Host: {host_value}\r\n"));
    for (name, value) in &envelope.headers {
        let lower = name.to_ascii_lowercase();
        if STRIPPED_HEADERS.contains(&lower.as_str()) || lower.starts_with("sec-websocket-") {
            continue;
        }
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    if let ForwardLeg::ViaHttpProxy { proxy_auth: Some(auth) } = leg {
        head.push_str(&format!("Proxy-Authorization: {auth}\r\n"));
    }
    head.push_str("Connection: close\r\n\r\n");
    head
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::RequestTarget;

    fn envelope(method: Method, headers: &[(&str, &str)]) -> RequestEnvelope {
        RequestEnvelope {
            method,
            target: RequestTarget::Absolute("http://origin.test/ping".into()),
            headers: headers
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn strips_forbidden_headers_and_sets_host() {
        let envelope = envelope(
            Method::GET,
            &[
                ("Host", "proxy"),
                ("Proxy-Connection", "keep-alive"),
                ("Proxy-Authorization", "Basic abc"),
                ("Connection", "upgrade"),
                ("Upgrade", "websocket"),
                ("Sec-WebSocket-Key", "xyz"),
                ("Accept", "*/*"),
            ],
        );
        let url = Url::parse("http://origin.test/ping").unwrap();
        let head = build_outbound_head(&envelope, &url, true, &ForwardLeg::Origin);

        assert!(head.starts_with("GET /ping HTTP/1.1\r\n"));
        assert!(head.contains("Host: origin.test\r\n"));
        assert!(head.contains("Accept: */*\r\n"));
        assert!(head.ends_with("Connection: close\r\n\r\n"));

        let lower = head.to_ascii_lowercase();
        assert!(!lower.contains("proxy-connection"));
        assert!(!lower.contains("proxy-authorization"));
        assert!(!lower.contains("upgrade"));
        assert!(!lower.contains("sec-websocket"));
        // Exactly one Host line and one Connection line survive.
        assert_eq!(lower.matches("host:").count(), 1);
        assert_eq!(lower.matches("\r\nconnection:").count(), 1);
    }

    #[test]
    fn host_keeps_non_default_port_and_query_survives() {
        let envelope = envelope(Method::GET, &[("Host", "proxy")]);
        let url = Url::parse("http://origin.test:8080/a/b?x=1&y=2").unwrap();
        let head = build_outbound_head(&envelope, &url, false, &ForwardLeg::Origin);
        assert!(head.starts_with("GET /a/b?x=1&y=2 HTTP/1.1\r\n"));
        assert!(head.contains("Host: origin.test:8080\r\n"));
    }

    #[test]
    fn via_proxy_uses_absolute_form_and_own_credentials() {
        let envelope = envelope(Method::POST, &[("Host", "proxy")]);
        let url = Url::parse("http://origin.test/submit").unwrap();
        let leg = ForwardLeg::ViaHttpProxy { proxy_auth: Some("Basic dTpw".into()) };
        let head = build_outbound_head(&envelope, &url, true, &leg);
        assert!(head.starts_with("POST http://origin.test/submit HTTP/1.1\r\n"));
        assert!(head.contains("Proxy-Authorization: Basic dTpw\r\n"));
    }

    #[test]
    fn host_header_guard() {
        assert!(host_header_is_sane(Some("origin.test")));
        assert!(!host_header_is_sane(None));
        assert!(!host_header_is_sane(Some("")));
        assert!(!host_header_is_sane(Some("\u{0}\u{1}\u{2}")));
        assert!(!host_header_is_sane(Some("héllo.example")));
        let long = "a".repeat(256);
        assert!(!host_header_is_sane(Some(&long)));
    }
}
