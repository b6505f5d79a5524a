//! SNI extraction from a raw, possibly incomplete TLS `ClientHello` buffer.
//!
//! `parse_sni` never panics and never reads past the end of the supplied
//! buffer: every multi-byte read goes through `checked`/`get` helpers, and a
//! malformed or truncated buffer simply yields `SniOutcome::None` rather than
//! propagating an error. Callers that want defensive logging on genuinely
//! unexpected failures should go through [`parse_sni_safe`].

use base64::Engine;
use tracing::debug;

use crate::hostname::is_generic_hostname;

const MIN_CLIENT_HELLO_LEN: usize = 53;
const TLS_HANDSHAKE_CONTENT_TYPE: u8 = 0x16;
const TLS_HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;
const TLS_EXTENSION_SNI: u16 = 0x0000;
const TLS_SNI_HOST_NAME_TYPE: u8 = 0x00;

/// Result of scanning a buffer for SNI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniOutcome {
    /// A validated hostname was found.
    Found(String),
    /// The buffer parsed as a `ClientHello` but carried no usable SNI.
    None,
}

impl SniOutcome {
    pub fn into_hostname(self) -> Option<String> {
        match self {
            SniOutcome::Found(host) => Some(host),
            SniOutcome::None => None,
        }
    }
}

fn be16(buf: &[u8], at: usize) -> Option<u16> {
    buf.get(at..at + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
}

/// Scan `buf` for a `server_name` extension carrying a hostname. Returns
/// `SniOutcome::None` on any malformed, truncated, or non-handshake input.
pub fn parse_sni(buf: &[u8]) -> SniOutcome {
    if buf.len() < MIN_CLIENT_HELLO_LEN {
        return SniOutcome::None;
    }
    if buf[0] != TLS_HANDSHAKE_CONTENT_TYPE {
        return SniOutcome::None;
    }
    // 5-byte record header, then handshake type.
    if buf.get(5) != Some(&TLS_HANDSHAKE_TYPE_CLIENT_HELLO) {
        return SniOutcome::None;
    }
    // handshake length (3) + client version (2) + random (32) = 37 bytes
    // from offset 6.
    let mut offset = 6 + 3 + 2 + 32;
    let Some(&session_id_len) = buf.get(offset) else {
        return SniOutcome::None;
    };
    offset += 1 + session_id_len as usize;

    // From here on we scan forward for the server_name extension, advancing
    // one byte at a time whenever a candidate fails to validate, rather than
    // bailing out immediately.
    while buf.len().saturating_sub(offset) >= 9 {
        if let Some(name) = try_extension_at(buf, offset) {
            return SniOutcome::Found(name);
        }
        offset += 1;
    }

    SniOutcome::None
}

/// Attempt to read a `server_name` extension starting at `offset`, which
/// must be the position of the extension's 2-byte type field. Returns
/// `None` (meaning "advance and retry") on any mismatch.
///
/// This checks `ext_type == 0x0000` explicitly before reading lengths:
/// without it, an unrelated extension whose bytes happen to satisfy the same
/// length inequalities could be mistaken for `server_name`.
fn try_extension_at(buf: &[u8], offset: usize) -> Option<String> {
    let ext_type = be16(buf, offset)?;
    if ext_type != TLS_EXTENSION_SNI {
        return None;
    }
    let ext_len = be16(buf, offset + 2)? as usize;
    let list_len = be16(buf, offset + 4)? as usize;
    if ext_len <= list_len {
        return None;
    }
    if offset + 6 + list_len > buf.len() {
        return None;
    }
    if buf.get(offset + 6) != Some(&TLS_SNI_HOST_NAME_TYPE) {
        return None;
    }
    let name_len = be16(buf, offset + 7)? as usize;
    if name_len >= ext_len {
        return None;
    }
    let name_start = offset + 9;
    let name = buf.get(name_start..name_start + name_len)?;
    let name = std::str::from_utf8(name).ok()?;
    if !is_generic_hostname(name) {
        return None;
    }
    Some(name.to_ascii_lowercase())
}

/// Entry point used by the Prelude Reader: catches the (structurally
/// unreachable, since `parse_sni` never panics) case of an indexing mistake
/// surfacing as a panic, logging the offending buffer and returning `None`
/// instead of unwinding past the caller.
pub fn parse_sni_safe(buf: &[u8]) -> SniOutcome {
    match std::panic::catch_unwind(|| parse_sni(buf)) {
        Ok(outcome) => outcome,
        Err(_) => {
            debug!(
                buffer_b64 = %base64::engine::general_purpose::STANDARD.encode(buf),
                "SNI parser panicked on malformed buffer"
            );
            SniOutcome::None
        }
    }
}
