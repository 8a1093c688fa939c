//! Services CONNECT requests: validate the authority, dial, acknowledge,
//! flush any bytes either side produced ahead of the tunnel, then splice.

use bytes::Bytes;
use http::StatusCode;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::classify::{classify, emit_hint};
use crate::dial::{ByteStream, DialUsage};
use crate::parse::{self, Authority};
use crate::server::ServerState;
use crate::splice;

pub async fn serve_connect<S>(client: &mut S, raw_target: &str, leftover: Bytes, state: &ServerState)
where
    S: ByteStream,
{
    // No dial happens until the target survives validation.
    let target = match Authority::from_connect_target(raw_target) {
        Ok(target) => target,
        Err(err) => {
            debug!(target = %raw_target, %err, "rejecting CONNECT target");
            let body = format!("invalid CONNECT target: {err}\n");
            let _ = parse::write_plain_response(client, StatusCode::BAD_REQUEST, &body).await;
            return;
        }
    };

    let dialed = match state.dialer.dial(&target, DialUsage::Tunnel).await {
        Ok(dialed) => dialed,
        Err(err) => {
            info!(%target, %err, "tunnel dial failed");
            let body = format!("{err}\n");
            let _ = parse::write_plain_response(client, err.status(), &body).await;
            return;
        }
    };
    let mut outbound = dialed.stream;

    // From here on the client is in tunnel mode; failures are logged, never
    // reported over the wire.
    if let Err(err) = client.write_all(parse::connect_established().as_bytes()).await {
        debug!(%target, %err, "client went away before tunnel acknowledgement");
        return;
    }

    // The client may have optimistically sent the start of its handshake
    // right behind the CONNECT head; it must reach the target before any
    // target bytes reach the client, and vice versa for anything the
    // upstream produced past its own response.
    if !leftover.is_empty() {
        if let Err(err) = outbound.write_all(&leftover).await {
            debug!(%target, %err, "failed to flush client preamble");
            return;
        }
    }
    if !dialed.early.is_empty() {
        if let Err(err) = client.write_all(&dialed.early).await {
            debug!(%target, %err, "failed to flush upstream preamble");
            return;
        }
    }

    state.stats.tunnels_opened();
    let idle = state.config.splice_idle_for(target.host(), target.port());
    match splice::splice(&mut *client, outbound, idle).await {
        Ok(totals) => {
            state.stats.add_transfer(totals.a_to_b, totals.b_to_a);
            debug!(%target, sent = totals.a_to_b, received = totals.b_to_a, "tunnel closed");
        }
        Err(err) => {
            let class = classify(&err);
            emit_hint(class);
            if class.is_quiet() {
                debug!(%target, %err, "tunnel ended");
            } else {
                warn!(%target, %err, "tunnel error");
            }
        }
    }
}
