//! A socket wrapper that replays already-consumed prelude bytes.
//!
//! `tokio_rustls::TlsAcceptor::accept` reads the `ClientHello` itself; it has
//! no way to be told "these bytes were already read off the wire." Both
//! prelude-reading paths consume bytes via `try_read`, so before the
//! handshake can begin those bytes need to be served back to it first.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Wraps `S`, serving `prefix` on the first `poll_read` calls before
/// delegating to `S`. Writes pass straight through.
pub struct PeekedStream<S> {
    prefix: Vec<u8>,
    prefix_pos: usize,
    inner: S,
}

impl<S> PeekedStream<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            prefix_pos: 0,
            inner,
        }
    }

    fn remaining_prefix(&self) -> &[u8] {
        &self.prefix[self.prefix_pos..]
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let remaining = this.remaining_prefix();
        if remaining.is_empty() {
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        }
        let n = remaining.len().min(buf.remaining());
        buf.put_slice(&remaining[..n]);
        this.prefix_pos += n;
        if this.prefix_pos == this.prefix.len() {
            // Drop the buffer once drained; we never peek again.
            this.prefix = Vec::new();
            this.prefix_pos = 0;
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn replays_prefix_before_inner_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut peeked = PeekedStream::new(b"hello ".to_vec(), stream);
            let mut buf = vec![0u8; 11];
            peeked.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"world").await.unwrap();

        let received = server.await.unwrap();
        assert_eq!(&received, b"hello world");
    }

    #[tokio::test]
    async fn empty_prefix_reads_straight_through() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut peeked = PeekedStream::new(Vec::new(), stream);
            let mut buf = vec![0u8; 5];
            peeked.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"abcde").await.unwrap();

        let received = server.await.unwrap();
        assert_eq!(&received, b"abcde");
    }
}
