//! Per-hostname certificate/key bundles handed to the TLS engine.

use std::sync::Arc;

use rustls::crypto::ring::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;

use crate::error::GateError;

/// A certificate chain plus private key, ready to hand to `rustls`.
///
/// Constructed once per hostname (or once for a default context) and shared
/// across connections behind an `Arc`.
#[derive(Clone)]
pub struct SecurityContext {
    certified_key: Arc<CertifiedKey>,
}

impl std::fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityContext").finish_non_exhaustive()
    }
}

impl SecurityContext {
    /// Parse a PEM-encoded certificate chain and private key.
    ///
    /// The chain must list the leaf certificate first. Keys of any type
    /// `rustls`'s `ring` crypto provider supports (RSA, ECDSA, Ed25519) are
    /// accepted.
    pub fn from_pem(cert_chain_pem: &[u8], private_key_pem: &[u8]) -> Result<Self, GateError> {
        let certs = parse_cert_chain(cert_chain_pem)?;
        let key = parse_private_key(private_key_pem)?;
        let signing_key = any_supported_type(&key).map_err(|e| {
            GateError::InvalidSecurityContext(format!("unsupported private key: {e}"))
        })?;
        Ok(Self {
            certified_key: Arc::new(CertifiedKey::new(certs, signing_key)),
        })
    }

    /// Build directly from an already-assembled `rustls` certified key, for
    /// callers that source their material from something other than PEM
    /// files (an HSM, a secrets manager client, etc.).
    pub fn from_certified_key(certified_key: Arc<CertifiedKey>) -> Self {
        Self { certified_key }
    }

    pub(crate) fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.certified_key)
    }
}

fn parse_cert_chain(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, GateError> {
    let mut reader: &[u8] = pem;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            GateError::InvalidSecurityContext(format!("malformed certificate PEM: {e}"))
        })?;
    if certs.is_empty() {
        return Err(GateError::InvalidSecurityContext(
            "no certificates found in PEM input".into(),
        ));
    }
    Ok(certs)
}

fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, GateError> {
    let mut reader: &[u8] = pem;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| GateError::InvalidSecurityContext(format!("malformed private key PEM: {e}")))?
        .ok_or_else(|| {
            GateError::InvalidSecurityContext("no private key found in PEM input".into())
        })
}
