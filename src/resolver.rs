//! Hostname to security-context resolution.

use std::fmt;
use std::sync::Arc;

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tracing::warn;

use crate::hostname::is_public_domain;
use crate::security_context::SecurityContext;

/// Caller-supplied, per-hostname certificate lookup.
///
/// Implementations may be stateful (a directory watcher, a database-backed
/// cache); `resolve` is called at most once per accepted connection.
pub trait ContextResolver: Send + Sync {
    fn resolve(&self, hostname: Option<&str>) -> Option<Arc<SecurityContext>>;
}

impl<F> ContextResolver for F
where
    F: Fn(Option<&str>) -> Option<Arc<SecurityContext>> + Send + Sync,
{
    fn resolve(&self, hostname: Option<&str>) -> Option<Arc<SecurityContext>> {
        self(hostname)
    }
}

/// Adapts a [`ContextResolver`] (plus an optional default) to `rustls`'s
/// `ResolvesServerCert`, implementing the resolver-then-default fallback.
pub struct GateCertResolver {
    resolver: Option<Arc<dyn ContextResolver>>,
    default_context: Option<Arc<SecurityContext>>,
    validate_public_domain_format: bool,
}

impl fmt::Debug for GateCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GateCertResolver")
            .field("has_resolver", &self.resolver.is_some())
            .field("has_default", &self.default_context.is_some())
            .field(
                "validate_public_domain_format",
                &self.validate_public_domain_format,
            )
            .finish()
    }
}

impl GateCertResolver {
    pub fn new(
        resolver: Option<Arc<dyn ContextResolver>>,
        default_context: Option<Arc<SecurityContext>>,
        validate_public_domain_format: bool,
    ) -> Self {
        Self {
            resolver,
            default_context,
            validate_public_domain_format,
        }
    }

    fn resolve_context(&self, hostname: Option<&str>) -> Option<Arc<SecurityContext>> {
        if let Some(resolver) = &self.resolver {
            if let Some(ctx) = resolver.resolve(hostname) {
                return Some(ctx);
            }
        }
        self.default_context.clone()
    }
}

/// Applies the same public-domain coercion the prelude reader uses, so a
/// connection rejected there is also rejected here — `rustls` hands the
/// resolver its own, uncoerced `server_name()`, independent of whatever the
/// prelude parser already decided.
fn coerce(hostname: Option<&str>, validate_public_domain_format: bool) -> Option<&str> {
    match hostname {
        Some(h) if validate_public_domain_format && !is_public_domain(h) => None,
        other => other,
    }
}

impl ResolvesServerCert for GateCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let raw_hostname = client_hello.server_name();
        let hostname = coerce(raw_hostname, self.validate_public_domain_format);
        match self.resolve_context(hostname) {
            Some(ctx) => Some(ctx.certified_key()),
            None => {
                warn!(hostname = ?hostname, raw_hostname = ?raw_hostname, "no security context resolved for connection");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_context() -> Arc<SecurityContext> {
        let cert = rcgen::generate_simple_self_signed(["localhost".to_string()]).unwrap();
        Arc::new(
            SecurityContext::from_pem(
                cert.cert.pem().as_bytes(),
                cert.key_pair.serialize_pem().as_bytes(),
            )
            .unwrap(),
        )
    }

    #[test]
    fn falls_through_to_default_when_resolver_returns_none() {
        let default_ctx = dummy_context();
        let resolver: Arc<dyn ContextResolver> = Arc::new(|_: Option<&str>| None);
        let gate = GateCertResolver::new(Some(resolver), Some(default_ctx.clone()), false);
        assert!(gate.resolve_context(Some("anything")).is_some());
    }

    #[test]
    fn prefers_resolver_result_over_default() {
        let resolver_ctx = dummy_context();
        let default_ctx = dummy_context();
        let captured = resolver_ctx.clone();
        let resolver: Arc<dyn ContextResolver> =
            Arc::new(move |_: Option<&str>| Some(captured.clone()));
        let gate = GateCertResolver::new(Some(resolver), Some(default_ctx), false);
        let resolved = gate.resolve_context(Some("example.com")).unwrap();
        assert!(Arc::ptr_eq(&resolved, &resolver_ctx));
    }

    #[test]
    fn no_resolver_no_default_yields_none() {
        let gate = GateCertResolver::new(None, None, false);
        assert!(gate.resolve_context(Some("example.com")).is_none());
    }

    #[test]
    fn coerce_rejects_bare_label_only_when_validation_is_on() {
        assert_eq!(coerce(Some("localhost"), true), None);
        assert_eq!(coerce(Some("localhost"), false), Some("localhost"));
        assert_eq!(coerce(Some("example.com"), true), Some("example.com"));
        assert_eq!(coerce(None, true), None);
    }
}
