//! Duplex byte stream over an established TLS session.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use rustls::pki_types::CertificateDer;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::error::GateError;
use crate::peeked_stream::PeekedStream;

pub const DEFAULT_WRITE_QUEUE_CAP: usize = 256 * 1024;
const STALL_WRITE_ATTEMPTS: u32 = 16;
/// How many times `poll_shutdown` re-polls a non-empty write queue (each
/// `Pending` re-registers the waker via the inner writer) before giving up
/// and discarding whatever is left unsent.
const SHUTDOWN_DRAIN_ATTEMPTS: u32 = 5;

/// An accepted, handshake-complete TLS connection handed to application code.
pub struct SecureConnection {
    pub peer_addr: SocketAddr,
    pub alpn_protocol: Option<Vec<u8>>,
    /// The client's certificate chain, if one was presented. Always `None`
    /// while the server is configured with `with_no_client_auth` (the only
    /// mode `Server::bind` builds today); populated from whatever the TLS
    /// engine negotiated so client-auth support can be added later without
    /// changing this type.
    pub peer_certificate_chain: Option<Vec<CertificateDer<'static>>>,
    pub stream: SecureStream,
}

/// Runs `TlsAcceptor::accept` over a socket primed with already-consumed
/// prelude bytes, producing a [`SecureConnection`] on success.
pub(crate) async fn accept(
    acceptor: &TlsAcceptor,
    raw: tokio::net::TcpStream,
    peer_addr: SocketAddr,
    prelude: Vec<u8>,
) -> io::Result<SecureConnection> {
    let peeked = PeekedStream::new(prelude, raw);
    let tls_stream = acceptor.accept(peeked).await?;
    let (_, server_conn) = tls_stream.get_ref();
    let alpn_protocol = server_conn.alpn_protocol().map(|p| p.to_vec());
    let peer_certificate_chain = server_conn.peer_certificates().map(|certs| certs.to_vec());
    Ok(SecureConnection {
        peer_addr,
        alpn_protocol,
        peer_certificate_chain,
        stream: SecureStream::new(tls_stream),
    })
}

/// FIFO outbound byte queue with a byte cap and stall detection, generic
/// over the writer it ultimately drains into so it can be driven in tests
/// against a fake writer instead of a live TLS stream.
struct WriteQueue {
    fragments: VecDeque<Vec<u8>>,
    queued_bytes: usize,
    stalled_attempts: u32,
    cap: usize,
}

impl WriteQueue {
    fn new(cap: usize) -> Self {
        Self {
            fragments: VecDeque::new(),
            queued_bytes: 0,
            stalled_attempts: 0,
            cap,
        }
    }

    fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.fragments.len()
    }

    fn has_room_for(&self, additional: usize) -> bool {
        self.queued_bytes + additional <= self.cap
    }

    fn enqueue(&mut self, buf: &[u8]) {
        self.fragments.push_back(buf.to_vec());
        self.queued_bytes += buf.len();
    }

    fn clear(&mut self) {
        self.fragments.clear();
        self.queued_bytes = 0;
        self.stalled_attempts = 0;
    }

    /// Drains as much of the queue as possible into `writer`. Returns
    /// `Ready(Err(PeerStalled))` once `STALL_WRITE_ATTEMPTS` consecutive
    /// no-progress attempts have been made.
    fn drain_into<W: AsyncWrite + Unpin>(
        &mut self,
        cx: &mut Context<'_>,
        mut writer: Pin<&mut W>,
    ) -> Poll<io::Result<()>> {
        while let Some(front) = self.fragments.front() {
            match writer.as_mut().poll_write(cx, front) {
                Poll::Ready(Ok(0)) => return self.record_stall(),
                Poll::Ready(Ok(n)) => {
                    self.stalled_attempts = 0;
                    self.queued_bytes -= n;
                    if n == front.len() {
                        self.fragments.pop_front();
                    } else {
                        let remaining = front[n..].to_vec();
                        *self.fragments.front_mut().unwrap() = remaining;
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return self.record_stall(),
            }
        }
        Poll::Ready(Ok(()))
    }

    fn record_stall(&mut self) -> Poll<io::Result<()>> {
        self.stalled_attempts += 1;
        if self.stalled_attempts >= STALL_WRITE_ATTEMPTS {
            return Poll::Ready(Err(io::Error::other(GateError::PeerStalled {
                attempts: self.stalled_attempts,
            })));
        }
        Poll::Pending
    }

    /// Drains with a bounded retry budget instead of `STALL_WRITE_ATTEMPTS`:
    /// used by `poll_shutdown`, where giving up should discard the queue
    /// and let shutdown proceed rather than surface `PeerStalled`.
    /// `attempts` is caller-owned so it survives across repeated polls.
    fn drain_with_retry_budget<W: AsyncWrite + Unpin>(
        &mut self,
        cx: &mut Context<'_>,
        writer: Pin<&mut W>,
        attempts: &mut u32,
        max_attempts: u32,
    ) -> Poll<io::Result<()>> {
        if self.is_empty() {
            return Poll::Ready(Ok(()));
        }
        match self.drain_into(cx, writer) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            Poll::Ready(Err(e)) => {
                self.clear();
                Poll::Ready(Err(e))
            }
            Poll::Pending => {
                *attempts += 1;
                if *attempts < max_attempts {
                    Poll::Pending
                } else {
                    self.clear();
                    Poll::Ready(Ok(()))
                }
            }
        }
    }
}

/// `AsyncRead`/`AsyncWrite` wrapper exposing an ordinary duplex byte channel
/// on top of a `tokio_rustls` server-side TLS stream, with a bounded
/// outbound write queue.
pub struct SecureStream {
    inner: TlsStream<PeekedStream<tokio::net::TcpStream>>,
    write_queue: WriteQueue,
    shutdown_drain_attempts: u32,
    closed_for_write: bool,
}

impl SecureStream {
    fn new(inner: TlsStream<PeekedStream<tokio::net::TcpStream>>) -> Self {
        Self {
            inner,
            write_queue: WriteQueue::new(DEFAULT_WRITE_QUEUE_CAP),
            shutdown_drain_attempts: 0,
            closed_for_write: false,
        }
    }
}

impl AsyncRead for SecureStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for SecureStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.closed_for_write {
            return Poll::Ready(Ok(buf.len()));
        }

        match this.write_queue.drain_into(cx, Pin::new(&mut this.inner)) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => {
                if !this.write_queue.has_room_for(buf.len()) {
                    return Poll::Pending;
                }
                this.write_queue.enqueue(buf);
                return Poll::Ready(Ok(buf.len()));
            }
        }

        // Queue is empty: try a direct write first.
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(result) => Poll::Ready(result),
            Poll::Pending => {
                if !this.write_queue.has_room_for(buf.len()) {
                    Poll::Pending
                } else {
                    this.write_queue.enqueue(buf);
                    Poll::Ready(Ok(buf.len()))
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.write_queue.drain_into(cx, Pin::new(&mut this.inner)) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_flush(cx),
            other => other,
        }
    }

    /// Gives the outbound queue up to `SHUTDOWN_DRAIN_ATTEMPTS` re-polls to
    /// drain before giving up and discarding whatever is left. Each `Pending`
    /// from `drain_into` re-registers this task's waker against the inner
    /// writer's readiness, so the retries are genuinely driven by the
    /// executor rather than a fixed sleep.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this
            .write_queue
            .drain_with_retry_budget(
                cx,
                Pin::new(&mut this.inner),
                &mut this.shutdown_drain_attempts,
                SHUTDOWN_DRAIN_ATTEMPTS,
            )
            .is_pending()
        {
            return Poll::Pending;
        }
        this.closed_for_write = true;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
