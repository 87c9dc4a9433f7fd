//! Bidirectional relay engine (C3).
//!
//! Two concurrent copy tasks bridge two byte streams, one per direction.
//! When either task terminates for any reason the other is cancelled; the
//! relay returns only once both have joined. This mirrors the original
//! implementation's two-goroutine-plus-shared-cancellable-context pattern
//! (`vlessTCP` in the reference server, and `pipeTcp` in the reference
//! client) rather than `common/buffer.rs`'s single-future greedy scheduler —
//! that scheduler optimizes allocation pressure for a
//! single task, which is the wrong shape for a design whose core
//! correctness property is mutual cancellation between two independent
//! tasks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

const COPY_BUF_SIZE: usize = 8 * 1024;

/// Outcome of a single relay run.
pub struct RelayStats {
    /// Total bytes observed across both directions (for C6 accounting).
    pub total_bytes: u64,
}

/// Bridge `a` and `b` until either direction terminates, then cancel the
/// other and join. `prefix_b_to_a` is written, at most once, strictly
/// before any other byte sent from `b` to `a` — used to carry the VLESS
/// response header on the node side (I2).
///
/// `per_read_timeout` bounds every individual read on both directions; a
/// timeout is treated like a normal EOF (§4.3: "Read timeout -> cancel peer,
/// treat as normal"). `parent` lets the caller enforce a session-wide
/// deadline or shutdown signal from outside.
pub async fn relay<A, B>(
    a: A,
    b: B,
    prefix_b_to_a: Option<Vec<u8>>,
    per_read_timeout: Duration,
    parent: CancellationToken,
) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let token = parent.child_token();
    let counter = Arc::new(AtomicU64::new(0));

    let (mut ar, mut aw) = tokio::io::split(a);
    let (mut br, mut bw) = tokio::io::split(b);

    let token_a = token.clone();
    let counter_a = counter.clone();
    let a_to_b = tokio::spawn(async move {
        pump(&mut ar, &mut bw, None, per_read_timeout, &token_a, &counter_a, "a->b").await;
        token_a.cancel();
    });

    let token_b = token.clone();
    let counter_b = counter.clone();
    let b_to_a = tokio::spawn(async move {
        pump(
            &mut br,
            &mut aw,
            prefix_b_to_a,
            per_read_timeout,
            &token_b,
            &counter_b,
            "b->a",
        )
        .await;
        token_b.cancel();
    });

    let _ = tokio::join!(a_to_b, b_to_a);

    RelayStats {
        total_bytes: counter.load(Ordering::Relaxed),
    }
}

async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    mut prefix: Option<Vec<u8>>,
    per_read_timeout: Duration,
    token: &CancellationToken,
    counter: &Arc<AtomicU64>,
    label: &'static str,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if let Some(p) = prefix.take() {
        if !p.is_empty() && writer.write_all(&p).await.is_err() {
            debug!(label, "prefix write failed");
            return;
        }
    }

    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!(label, "cancelled, exiting without further IO");
                return;
            }
            result = tokio::time::timeout(per_read_timeout, reader.read(&mut buf)) => {
                let n = match result {
                    Err(_) => {
                        debug!(label, "read timeout, treated as normal termination");
                        return;
                    }
                    Ok(Err(e)) => {
                        error!(label, error = %e, "read error");
                        return;
                    }
                    Ok(Ok(0)) => {
                        debug!(label, "EOF");
                        return;
                    }
                    Ok(Ok(n)) => n,
                };

                counter.fetch_add(n as u64, Ordering::Relaxed);

                if let Err(e) = writer.write_all(&buf[..n]).await {
                    error!(label, error = %e, "peer write failed");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn cross_cancel_on_eof() {
        let (a_near, mut a_far) = duplex(1024);
        let (b_near, mut b_far) = duplex(1024);

        let token = CancellationToken::new();
        let relay_fut = relay(a_near, b_near, None, Duration::from_secs(5), token.clone());

        a_far.write_all(b"hello").await.unwrap();
        drop(a_far); // EOF on a's far end propagates as read-EOF on a_near

        let mut buf = [0u8; 5];
        b_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        drop(b_far);

        let stats = tokio::time::timeout(Duration::from_secs(2), relay_fut).await.unwrap();
        assert_eq!(stats.total_bytes, 5);
    }

    #[tokio::test]
    async fn response_prefix_precedes_other_bytes() {
        let (a_near, mut a_far) = duplex(1024);
        let (b_near, mut b_far) = duplex(1024);

        let token = CancellationToken::new();
        let relay_fut = relay(
            a_near,
            b_near,
            Some(vec![0x00, 0x00]),
            Duration::from_secs(5),
            token,
        );
        let handle = tokio::spawn(relay_fut);

        b_far.write_all(b"payload").await.unwrap();
        drop(b_far);

        let mut out = Vec::new();
        a_far.read_to_end(&mut out).await.unwrap();
        assert_eq!(&out[..2], &[0x00, 0x00]);
        assert_eq!(&out[2..], b"payload");

        drop(a_far);
        handle.await.unwrap();
    }
}
