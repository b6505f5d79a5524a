//! Manual-testing demo: binds a `sni_gate::Server` with a directory-backed
//! resolver and echoes a byte back on every accepted connection.
//!
//! Env-driven configuration (`SNI_GATE_DEMO_*`), demo-only — not part of the
//! library's public API.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sni_gate::{FileResolver, Server, ServerOptions};

struct DemoConfig {
    bind_addr: SocketAddr,
    cert_dir: PathBuf,
    log_level: String,
}

impl DemoConfig {
    fn from_env() -> Result<Self> {
        let bind_addr = std::env::var("SNI_GATE_DEMO_BIND")
            .unwrap_or_else(|_| "127.0.0.1:8443".to_string())
            .parse()
            .context("SNI_GATE_DEMO_BIND must be a valid socket address")?;

        let cert_dir = std::env::var("SNI_GATE_DEMO_CERT_DIR")
            .map(PathBuf::from)
            .context("SNI_GATE_DEMO_CERT_DIR must point at a directory of <hostname>/{fullchain.pem,privkey.pem} pairs")?;

        let log_level =
            std::env::var("SNI_GATE_DEMO_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            bind_addr,
            cert_dir,
            log_level,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install default CryptoProvider");

    let config = DemoConfig::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(bind_addr = %config.bind_addr, cert_dir = %config.cert_dir.display(), "starting sni-gate demo");

    let resolver = Arc::new(
        FileResolver::watch(config.cert_dir, Duration::from_secs(30))
            .await
            .context("failed to load security context directory")?,
    );

    let opts = ServerOptions {
        resolver: Some(resolver),
        require_hostname: true,
        ..Default::default()
    };

    let mut server = Server::bind(config.bind_addr, opts)
        .await
        .context("failed to bind server")?;

    info!(bind_addr = %server.local_addr(), "listening");

    while let Some(mut connection) = server.accept().await {
        tokio::spawn(async move {
            info!(peer = %connection.peer_addr, "accepted secure connection");
            if let Err(e) = connection.stream.write_all(b"sni-gate demo\n").await {
                warn!(peer = %connection.peer_addr, error = %e, "write failed");
            }
        });
    }

    Ok(())
}
