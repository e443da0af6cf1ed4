//! Bidirectional forwarding between two byte channels

use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinSet;

/// Pump bytes both ways between `a` and `b` until either direction stops
///
/// Each direction runs as its own task. As soon as one finishes, by EOF or by
/// error, the other is cancelled and both channels are dropped before this
/// returns. The first direction's error, if any, is the result.
pub async fn relay<A, B>(a: A, b: B) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let mut directions = JoinSet::new();
    directions.spawn(async move { tokio::io::copy(&mut a_read, &mut b_write).await });
    directions.spawn(async move { tokio::io::copy(&mut b_read, &mut a_write).await });

    let first = directions.join_next().await;
    directions.shutdown().await;

    match first {
        Some(Ok(Ok(_))) | None => Ok(()),
        Some(Ok(Err(e))) => Err(e),
        Some(Err(e)) => Err(io::Error::other(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream, ReadBuf};

    /// Duplex endpoint that counts how often it is closed
    struct MockChannel {
        inner: DuplexStream,
        closes: Arc<AtomicUsize>,
        fail_reads: bool,
    }

    impl MockChannel {
        fn new(inner: DuplexStream) -> (Self, Arc<AtomicUsize>) {
            let closes = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    inner,
                    closes: closes.clone(),
                    fail_reads: false,
                },
                closes,
            )
        }
    }

    impl Drop for MockChannel {
        fn drop(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl AsyncRead for MockChannel {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.fail_reads {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "peer reset")));
            }
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for MockChannel {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    #[tokio::test]
    async fn test_forwards_both_ways() {
        let (a, mut a_peer) = duplex(1024);
        let (b, mut b_peer) = duplex(1024);

        let bridge = tokio::spawn(relay(a, b));

        a_peer.write_all(b"to b").await.unwrap();
        let mut buf = [0u8; 4];
        b_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"to b");

        b_peer.write_all(b"to a").await.unwrap();
        a_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"to a");

        drop(a_peer);
        bridge.await.unwrap().unwrap();

        // b was closed by the bridge
        let mut rest = Vec::new();
        b_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_eof_closes_both_channels_once() {
        let (a_inner, a_peer) = duplex(1024);
        let (b_inner, _b_peer) = duplex(1024);
        let (a, a_closes) = MockChannel::new(a_inner);
        let (b, b_closes) = MockChannel::new(b_inner);

        // b never produces data, the b -> a direction stays blocked
        drop(a_peer);

        tokio::time::timeout(Duration::from_secs(5), relay(a, b))
            .await
            .expect("relay must not wait for the blocked direction")
            .unwrap();

        assert_eq!(a_closes.load(Ordering::SeqCst), 1);
        assert_eq!(b_closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_first_error_is_returned() {
        let (a_inner, _a_peer) = duplex(1024);
        let (b_inner, _b_peer) = duplex(1024);
        let (mut a, a_closes) = MockChannel::new(a_inner);
        let (b, b_closes) = MockChannel::new(b_inner);
        a.fail_reads = true;

        let err = tokio::time::timeout(Duration::from_secs(5), relay(a, b))
            .await
            .unwrap()
            .unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(a_closes.load(Ordering::SeqCst), 1);
        assert_eq!(b_closes.load(Ordering::SeqCst), 1);
    }
}
