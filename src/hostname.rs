//! Hostname validation.
//!
//! Two total predicates: a generic hostname form (accepts bare labels like
//! `localhost`) and a stricter public-domain form (requires a TLD). Both
//! reject purely numeric names (IPv4 literals) by requiring at least one
//! ASCII letter somewhere in the string.

const MAX_HOSTNAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

fn is_label_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-'
}

/// A label is `[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?`: 1-63 bytes,
/// alphanumeric-or-hyphen, never starting or ending with a hyphen.
fn is_valid_label(label: &[u8]) -> bool {
    if label.is_empty() || label.len() > MAX_LABEL_LEN {
        return false;
    }
    if !label.iter().all(|&b| is_label_byte(b)) {
        return false;
    }
    label[0] != b'-' && *label.last().unwrap() != b'-'
}

fn has_letter(s: &str) -> bool {
    s.bytes().any(|b| b.is_ascii_alphabetic())
}

fn split_labels(s: &str) -> Option<Vec<&[u8]>> {
    if s.is_empty() || s.len() > MAX_HOSTNAME_LEN {
        return None;
    }
    // Reject a leading or trailing dot, and "..", by requiring every split
    // segment (including a final empty one from a trailing dot) be
    // non-empty.
    let bytes = s.as_bytes();
    if bytes.first() == Some(&b'.') || bytes.last() == Some(&b'.') {
        return None;
    }
    Some(s.split('.').map(str::as_bytes).collect())
}

/// Accepts a single label (`localhost`) or a dotted name whose last label is
/// either alphanumeric or a pure-letter TLD. Rejects IPv4 literals and any
/// string with no letters at all.
pub fn is_generic_hostname(hostname: &str) -> bool {
    if !has_letter(hostname) {
        return false;
    }
    let Some(labels) = split_labels(hostname) else {
        return false;
    };
    if labels.is_empty() {
        return false;
    }
    labels.iter().all(|label| is_valid_label(label))
}

/// Requires a TLD: the last label must be 1-63 ASCII letters, and there must
/// be at least two labels total (a base label plus the TLD).
pub fn is_public_domain(hostname: &str) -> bool {
    if !has_letter(hostname) {
        return false;
    }
    let Some(labels) = split_labels(hostname) else {
        return false;
    };
    if labels.len() < 2 {
        return false;
    }
    let (tld, rest) = labels.split_last().expect("checked len >= 2 above");
    if tld.len() < 2 || tld.len() > MAX_LABEL_LEN || !tld.iter().all(|b| b.is_ascii_alphabetic()) {
        return false;
    }
    rest.iter().all(|label| is_valid_label(label))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_accepts_bare_label_and_ipv4_rejected() {
        assert!(is_generic_hostname("localhost"));
        assert!(!is_generic_hostname("192.168.0.1"));
        assert!(!is_generic_hostname(""));
    }

    #[test]
    fn letter_requirement_rejects_digits_and_dots() {
        assert!(!is_generic_hostname("127.0.0.1"));
        assert!(!is_public_domain("127.0.0.1"));
        assert!(!is_generic_hostname("...."));
    }

    #[test]
    fn public_domain_strictness_is_a_subset_of_generic() {
        let candidates = [
            "localhost",
            "example.com.br",
            "xn--exmple-cua.com",
            "a.x",
            "192.168.0.1",
            "-example.com",
            "example..com",
            "example.c",
            ".com",
        ];
        for host in candidates {
            if is_public_domain(host) {
                assert!(
                    is_generic_hostname(host),
                    "{host} accepted by public-domain but rejected by generic"
                );
            }
        }
    }

    #[test]
    fn scenario_s6_table() {
        let generic_accept = [
            "localhost",
            "example.com.br",
            "xn--exmple-cua.com",
            "a.x",
            "example.c",
        ];
        let generic_reject = ["192.168.0.1", "-example.com", "example..com", ".com"];
        for host in generic_accept {
            assert!(is_generic_hostname(host), "expected generic accept: {host}");
        }
        for host in generic_reject {
            assert!(
                !is_generic_hostname(host),
                "expected generic reject: {host}"
            );
        }

        let public_accept = ["example.com.br", "xn--exmple-cua.com"];
        let public_reject = [
            "localhost",
            "a.x",
            "192.168.0.1",
            "-example.com",
            "example..com",
            "example.c",
            ".com",
        ];
        for host in public_accept {
            assert!(
                is_public_domain(host),
                "expected public-domain accept: {host}"
            );
        }
        for host in public_reject {
            assert!(
                !is_public_domain(host),
                "expected public-domain reject: {host}"
            );
        }
    }
}
