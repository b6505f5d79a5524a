//! Error taxonomy for the library's public API.
//!
//! Connection-scoped failures (handshake failure, no resolvable context,
//! prelude I/O error) are logged internally by the dispatcher and never
//! constructed as a `GateError` — nothing downstream would observe them.

use std::io;

/// Errors returned from the library's public entry points.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("invalid security context: {0}")]
    InvalidSecurityContext(String),

    #[error("failed to build TLS server configuration: {0}")]
    TlsConfig(#[source] rustls::Error),

    #[error("peer stalled: write queue has made no progress in {attempts} attempts")]
    PeerStalled { attempts: u32 },
}
