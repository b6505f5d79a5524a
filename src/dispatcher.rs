//! Per-connection task body: prelude, hostname policy, handshake, publish.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn, Instrument};

use crate::prelude::read_prelude;
use crate::stream::{self, SecureConnection};

pub(crate) async fn dispatch(
    raw: TcpStream,
    peer_addr: SocketAddr,
    acceptor: TlsAcceptor,
    require_hostname: bool,
    validate_public_domain: bool,
    closed: Arc<AtomicBool>,
    output: mpsc::Sender<SecureConnection>,
) {
    let span = tracing::info_span!("connection", peer = %peer_addr);
    async move {
        handle_connection(
            raw,
            peer_addr,
            acceptor,
            require_hostname,
            validate_public_domain,
            closed,
            output,
        )
        .await;
    }
    .instrument(span)
    .await
}

async fn handle_connection(
    mut raw: TcpStream,
    peer_addr: SocketAddr,
    acceptor: TlsAcceptor,
    require_hostname: bool,
    validate_public_domain: bool,
    closed: Arc<AtomicBool>,
    output: mpsc::Sender<SecureConnection>,
) {
    let prelude_result = match read_prelude(&mut raw, validate_public_domain).await {
        Ok(result) => result,
        Err(e) => {
            warn!(error = %e.0, "socket read error while extracting SNI");
            return;
        }
    };

    debug!(hostname = ?prelude_result.hostname, "prelude read complete");

    if require_hostname && prelude_result.hostname.is_none() {
        debug!("closing connection: no SNI hostname and require_hostname is set");
        return;
    }

    let accept_result = stream::accept(&acceptor, raw, peer_addr, prelude_result.prelude).await;

    let connection = match accept_result {
        Ok(connection) => connection,
        Err(e) => {
            warn!(error = %e, "TLS handshake failed");
            return;
        }
    };

    if closed.load(Ordering::SeqCst) {
        debug!("server closed while handshake was in flight; dropping connection");
        return;
    }

    if output.send(connection).await.is_err() {
        debug!("output channel closed; dropping accepted connection");
    }
}
