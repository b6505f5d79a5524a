//! Owns the listening socket, the accept loop, and the server lifecycle.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustls::ServerConfig;
use socket2::{Domain, Socket, Type};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

use crate::dispatcher::dispatch;
use crate::error::GateError;
use crate::resolver::{ContextResolver, GateCertResolver};
use crate::security_context::SecurityContext;
use crate::stream::SecureConnection;

const DEFAULT_MAX_CONNECTIONS: usize = 10_000;
const DEFAULT_OUTPUT_CHANNEL_CAPACITY: usize = 256;
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);
const LISTENER_BACKLOG: i32 = 1024;

/// Programmatic configuration for [`Server::bind`].
pub struct ServerOptions {
    pub supported_protocols: Vec<Vec<u8>>,
    pub default_security_context: Option<Arc<SecurityContext>>,
    pub resolver: Option<Arc<dyn ContextResolver>>,
    pub require_hostname: bool,
    pub validate_public_domain_format: bool,
    pub max_connections: usize,
    /// Whether to set `SO_REUSEADDR` on the listening socket before binding
    /// (Unix only; see `bind_listener`).
    pub reuse_address: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            supported_protocols: Vec::new(),
            default_security_context: None,
            resolver: None,
            require_hostname: false,
            validate_public_domain_format: false,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            reuse_address: true,
        }
    }
}

/// Builds the listening socket by hand instead of via `TcpListener::bind` so
/// `SO_REUSEADDR` can be set before `bind(2)`.
///
/// `SO_REUSEADDR` means different things across platforms: on Unix it lets a
/// process rebind a recently-closed address; on Windows it additionally
/// allows multiple listeners on the same address, which is not what callers
/// of this flag want, so it's only applied on Unix.
fn bind_listener(addr: SocketAddr, reuse_address: bool) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    if reuse_address {
        socket.set_reuse_address(cfg!(unix))?;
    }
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTENER_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

/// A bound, running TLS front end. Owns the listening socket and the accept
/// loop; yields accepted, handshake-complete connections on `accept()`.
pub struct Server {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
    output: mpsc::Receiver<SecureConnection>,
    closed: Arc<AtomicBool>,
}

impl Server {
    pub async fn bind(addr: SocketAddr, opts: ServerOptions) -> Result<Self, GateError> {
        let listener = bind_listener(addr, opts.reuse_address)
            .map_err(|source| GateError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| GateError::Bind { addr, source })?;

        // Idempotent: rustls only allows installing the process-wide default once,
        // and every other `Server::bind` call (or test) after the first would
        // otherwise panic inside `ServerConfig::builder()`.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let cert_resolver = Arc::new(GateCertResolver::new(
            opts.resolver,
            opts.default_security_context,
            opts.validate_public_domain_format,
        ));
        let mut tls_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(cert_resolver);
        tls_config.alpn_protocols = opts.supported_protocols;
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));

        let (output_tx, output_rx) = mpsc::channel(DEFAULT_OUTPUT_CHANNEL_CAPACITY);
        let closed = Arc::new(AtomicBool::new(false));
        let semaphore = Arc::new(Semaphore::new(opts.max_connections));

        info!(bind_addr = %local_addr, max_connections = opts.max_connections, "server bound");

        let accept_task = tokio::spawn(accept_loop(
            listener,
            acceptor,
            opts.require_hostname,
            opts.validate_public_domain_format,
            Arc::clone(&closed),
            output_tx,
            semaphore,
        ));

        Ok(Self {
            local_addr,
            accept_task,
            output: output_rx,
            closed,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Receive the next accepted, handshake-complete connection.
    ///
    /// Returns `None` once the server has been closed, even if connections
    /// were still in flight at the time.
    pub async fn accept(&mut self) -> Option<SecureConnection> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        self.output.recv().await
    }

    /// Idempotent: aborts the accept loop and drops the listener. In-flight
    /// prelude reads and handshakes are not force-cancelled; their results
    /// are silently dropped once `closed` is observed.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.accept_task.abort();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.close();
    }
}

#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    require_hostname: bool,
    validate_public_domain: bool,
    closed: Arc<AtomicBool>,
    output: mpsc::Sender<SecureConnection>,
    semaphore: Arc<Semaphore>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                    warn!(peer_addr = %peer_addr, "connection rejected: max connections reached");
                    continue;
                };

                let acceptor = acceptor.clone();
                let closed = Arc::clone(&closed);
                let output = output.clone();

                tokio::spawn(async move {
                    dispatch(
                        stream,
                        peer_addr,
                        acceptor,
                        require_hostname,
                        validate_public_domain,
                        closed,
                        output,
                    )
                    .await;
                    drop(permit);
                });
            }
            Err(e) => {
                error!(error = %e, "accept error");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed_context(hostname: &str) -> Arc<SecurityContext> {
        let cert = rcgen::generate_simple_self_signed([hostname.to_string()]).unwrap();
        Arc::new(
            SecurityContext::from_pem(
                cert.cert.pem().as_bytes(),
                cert.key_pair.serialize_pem().as_bytes(),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn bind_listener_binds_and_listens_with_reuse_address() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), true).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn bind_listener_rebinds_a_closed_address_when_reuse_address_is_set() {
        let first = bind_listener("127.0.0.1:0".parse().unwrap(), true).unwrap();
        let addr = first.local_addr().unwrap();
        drop(first);
        // On a freshly-closed address this would intermittently fail with
        // reuse disabled; with it enabled (Unix), rebinding must succeed.
        let second = bind_listener(addr, true);
        assert!(
            second.is_ok(),
            "expected rebind to succeed with reuse_address set"
        );
    }

    #[tokio::test]
    async fn bind_yields_a_local_addr_and_close_is_idempotent() {
        let opts = ServerOptions {
            default_security_context: Some(self_signed_context("localhost")),
            ..Default::default()
        };
        let server = Server::bind("127.0.0.1:0".parse().unwrap(), opts)
            .await
            .unwrap();
        assert_ne!(server.local_addr().port(), 0);
        server.close();
        server.close();
    }

    #[tokio::test]
    async fn no_emission_after_close() {
        let opts = ServerOptions {
            default_security_context: Some(self_signed_context("localhost")),
            ..Default::default()
        };
        let mut server = Server::bind("127.0.0.1:0".parse().unwrap(), opts)
            .await
            .unwrap();
        server.close();
        assert!(server.accept().await.is_none());
    }
}
