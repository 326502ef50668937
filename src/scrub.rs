//! HTML-normalising content digest.
//!
//! Pages frequently embed volatile markup (CSRF tokens aside, mostly
//! formatting churn) that would make a plain body hash useless for change
//! detection. The scrubber normalises the markup before hashing: HTML
//! comments are dropped, tag names are lowercased, and whitespace runs both
//! inside and outside tags collapse to a single space. The monitor id is
//! folded into the digest after the scrubbed body so identical pages on
//! different monitors never alias.

use sha2::{Digest, Sha256};

use crate::types::MonitorId;

/// Digest of a scrubbed HTML body, keyed by the owning monitor.
pub fn smart_digest(monitor_id: MonitorId, body: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(scrub(body));
    hasher.update(monitor_id.to_le_bytes());
    hasher.finalize().into()
}

/// Normalises an HTML byte stream for hashing.
fn scrub(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    let mut i = 0;
    let mut in_tag = false;
    let mut pending_space = false;

    while i < body.len() {
        // Drop comments wholesale, including unterminated trailers.
        if body[i..].starts_with(b"<!--") {
            match find_subslice(&body[i + 4..], b"-->") {
                Some(end) => i += 4 + end + 3,
                None => break,
            }
            continue;
        }

        let b = body[i];
        match b {
            b'<' => {
                in_tag = true;
                pending_space = false;
                out.push(b'<');
            }
            b'>' => {
                in_tag = false;
                pending_space = false;
                out.push(b'>');
            }
            _ if b.is_ascii_whitespace() => {
                pending_space = true;
            }
            _ => {
                if pending_space && !out.is_empty() {
                    out.push(b' ');
                }
                pending_space = false;
                if in_tag {
                    out.push(b.to_ascii_lowercase());
                } else {
                    out.push(b);
                }
            }
        }
        i += 1;
    }

    out
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
