//! Non-blocking, timeout-bounded read loop that accumulates bytes from a
//! freshly accepted connection until the SNI parser yields a hostname or a
//! limit fires.

use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tracing::error;

use crate::sni::{parse_sni_safe, SniOutcome};

pub const MAX_PRELUDE_BYTES: usize = 16 * 1024;
const TOTAL_DEADLINE: Duration = Duration::from_secs(30);
const FAST_PATH_READ_CAP: usize = 1024;
const SLOW_PATH_READ_CAP: usize = 1024;
const FORCED_WAIT_TIMEOUT: Duration = Duration::from_millis(100);
const SPIN_WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CONSECUTIVE_SPINS: u32 = 16;

/// Outcome of running the Prelude Reader against one accepted connection.
pub struct PreludeResult {
    pub hostname: Option<String>,
    pub prelude: Vec<u8>,
}

/// A socket-level I/O error encountered while accumulating the prelude.
#[derive(Debug)]
pub struct PreludeError(pub std::io::Error);

/// Read until the SNI parser yields a hostname, the peer half-closes, the
/// 16 KiB bound is hit, or 30 seconds elapse — whichever comes first.
///
/// `validate_public_domain` coerces a parsed hostname failing the
/// public-domain predicate to `None`, per RFC 6066 §3 there is at most one
/// `server_name` extension, so there is nothing further worth scanning for
/// once that rejection happens.
pub async fn read_prelude(
    stream: &mut TcpStream,
    validate_public_domain: bool,
) -> Result<PreludeResult, PreludeError> {
    let mut prelude = Vec::new();

    if let Some(result) = fast_path(stream, &mut prelude, validate_public_domain).await? {
        return Ok(result);
    }

    slow_path(stream, prelude, validate_public_domain).await
}

fn coerce(hostname: String, validate_public_domain: bool) -> Option<String> {
    if validate_public_domain && !crate::hostname::is_public_domain(&hostname) {
        None
    } else {
        Some(hostname)
    }
}

async fn fast_path(
    stream: &mut TcpStream,
    prelude: &mut Vec<u8>,
    validate_public_domain: bool,
) -> Result<Option<PreludeResult>, PreludeError> {
    let mut buf = [0u8; FAST_PATH_READ_CAP];
    match stream.try_read(&mut buf) {
        Ok(0) => Ok(None),
        Ok(n) => {
            prelude.extend_from_slice(&buf[..n]);
            if let SniOutcome::Found(hostname) = parse_sni_safe(prelude) {
                return Ok(Some(PreludeResult {
                    hostname: coerce(hostname, validate_public_domain),
                    prelude: std::mem::take(prelude),
                }));
            }
            Ok(None)
        }
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(PreludeError(e)),
    }
}

async fn slow_path(
    stream: &mut TcpStream,
    mut prelude: Vec<u8>,
    validate_public_domain: bool,
) -> Result<PreludeResult, PreludeError> {
    let deadline = Instant::now() + TOTAL_DEADLINE;
    let mut force_wait = false;
    let mut no_yield_count: u32 = 0;

    loop {
        if Instant::now() >= deadline || prelude.len() >= MAX_PRELUDE_BYTES {
            return Ok(PreludeResult {
                hostname: None,
                prelude,
            });
        }

        if force_wait || no_yield_count >= MAX_CONSECUTIVE_SPINS {
            let _ = tokio::time::timeout(FORCED_WAIT_TIMEOUT, stream.readable()).await;
            force_wait = false;
            no_yield_count = 0;
        }

        let mut buf = [0u8; SLOW_PATH_READ_CAP];
        match stream.try_read(&mut buf) {
            Ok(0) => {
                return Ok(PreludeResult {
                    hostname: None,
                    prelude,
                });
            }
            Ok(n) => {
                prelude.extend_from_slice(&buf[..n]);
                if let SniOutcome::Found(hostname) = parse_sni_safe(&prelude) {
                    return Ok(PreludeResult {
                        hostname: coerce(hostname, validate_public_domain),
                        prelude,
                    });
                }
                no_yield_count += 1;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                let _ = tokio::time::timeout(SPIN_WAIT_TIMEOUT, stream.readable()).await;
                force_wait = true;
            }
            Err(e) => {
                error!(error = %e, "socket read error while reading connection prelude");
                return Err(PreludeError(e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream as TokioTcpStream};

    const CLIENT_HELLO_EXAMPLE_COM: &[u8] = &[
        0x16, 0x03, 0x01, 0x00, 0x5f, 0x01, 0x00, 0x00, 0x5b, 0x03, 0x03, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x02, 0x00, 0x2f, 0x01, 0x00, 0x00, 0x28, 0x00, 0x00, 0x00, 0x10, 0x00, 0x0e,
        0x00, 0x00, 0x0b, b'e', b'x', b'a', b'm', b'p', b'l', b'e', b'.', b'c', b'o', b'm', 0x00,
        0x15, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00,
    ];

    async fn connected_pair() -> (TcpStream, TokioTcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted, connected) = tokio::join!(listener.accept(), TokioTcpStream::connect(addr));
        (accepted.unwrap().0, connected.unwrap())
    }

    #[tokio::test]
    async fn fast_path_finds_sni_in_one_read() {
        let (mut server, mut client) = connected_pair().await;
        client.write_all(CLIENT_HELLO_EXAMPLE_COM).await.unwrap();

        let result = read_prelude(&mut server, false).await.unwrap();
        assert_eq!(result.hostname.as_deref(), Some("example.com"));
    }

    #[tokio::test]
    async fn tolerates_fragmented_delivery() {
        let (mut server, mut client) = connected_pair().await;

        let reader = tokio::spawn(async move { read_prelude(&mut server, false).await });

        for chunk in CLIENT_HELLO_EXAMPLE_COM.chunks(7) {
            // The reader may already have what it needs and close its end
            // before every chunk goes out; a write failing past that point
            // is expected, not a test bug.
            if client.write_all(chunk).await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let result = reader.await.unwrap().unwrap();
        assert_eq!(result.hostname.as_deref(), Some("example.com"));
    }

    #[tokio::test]
    async fn half_close_with_no_sni_yields_none() {
        let (mut server, client) = connected_pair().await;
        drop(client);

        let result = read_prelude(&mut server, false).await.unwrap();
        assert_eq!(result.hostname, None);
    }

    #[test]
    fn public_domain_validation_coerces_bare_label_to_none() {
        assert_eq!(coerce("localhost".to_string(), true), None);
        assert_eq!(
            coerce("example.com".to_string(), true),
            Some("example.com".to_string())
        );
    }
}
