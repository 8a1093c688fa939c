//! The bidirectional byte pump coupling two open streams.
//!
//! Each direction is a linear read-then-write loop. EOF on one side
//! half-closes the peer's write side while the opposite direction keeps
//! flowing; the splice ends when both directions are done, when either side
//! errors, or when no bytes move in either direction for the idle window.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const COPY_BUF_SIZE: usize = 16 * 1024;
const WATCHDOG_TICK: Duration = Duration::from_millis(500);

/// Byte totals for a completed splice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpliceTotals {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Pumps bytes between `a` and `b` until both directions finish.
///
/// Returns the per-direction totals, or the first error observed. On any
/// exit path both streams are dropped, which forcibly closes whatever the
/// peer half-close left open.
pub async fn splice<A, B>(a: A, b: B, idle_timeout: Duration) -> io::Result<SpliceTotals>
where
    A: AsyncRead + AsyncWrite + Send + Unpin,
    B: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let started = Instant::now();
    let last_activity = AtomicU64::new(0);

    let a_to_b = pump(&mut a_read, &mut b_write, started, &last_activity);
    let b_to_a = pump(&mut b_read, &mut a_write, started, &last_activity);
    tokio::pin!(a_to_b, b_to_a);

    let mut forward_done: Option<u64> = None;
    let mut backward_done: Option<u64> = None;

    loop {
        tokio::select! {
            result = &mut a_to_b, if forward_done.is_none() => {
                forward_done = Some(result?);
            }
            result = &mut b_to_a, if backward_done.is_none() => {
                backward_done = Some(result?);
            }
            _ = tokio::time::sleep(WATCHDOG_TICK) => {
                let last = Duration::from_millis(last_activity.load(Ordering::Relaxed));
                if started.elapsed().saturating_sub(last) >= idle_timeout {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "splice idle timeout"));
                }
            }
        }
        if let (Some(a_to_b), Some(b_to_a)) = (forward_done, backward_done) {
            return Ok(SpliceTotals { a_to_b, b_to_a });
        }
    }
}

/// One direction: copy until EOF, then half-close the destination.
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    started: Instant,
    last_activity: &AtomicU64,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
        last_activity.store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
    }
}
