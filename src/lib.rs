//! A TLS front end that terminates connections for many hostnames on a
//! single listening socket, selecting the per-connection certificate/key
//! bundle from the `ClientHello`'s SNI field.

mod dispatcher;
pub mod error;
pub mod file_resolver;
pub mod hostname;
mod peeked_stream;
pub mod prelude;
pub mod resolver;
pub mod security_context;
pub mod server;
pub mod sni;
mod stream;

pub use error::GateError;
pub use file_resolver::FileResolver;
pub use resolver::{ContextResolver, GateCertResolver};
pub use security_context::SecurityContext;
pub use server::{Server, ServerOptions};
pub use stream::SecureConnection;
