//! REST authentication primitive shared by the inbound and outbound APIs.
//!
//! Both directions authenticate with a time-bucketed HMAC-SHA256: the key is
//! the 56-byte shared secret with the little-endian 30-second time bucket
//! appended. JSON payloads travel wrapped in a `{"data", "hash"}` envelope
//! (both fields base64); binary payloads carry the raw 32-byte digest
//! appended to the message. Verification accepts the neighbouring buckets so
//! modest clock skew does not reject traffic; finer skew is handled by the
//! external time-delta endpoint, which is outside this crate.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

/// Required raw secret length (hash block size minus the 8-byte bucket).
pub const SECRET_LENGTH: usize = 56;

const TIME_BUCKET_SECONDS: u64 = 30;

type HmacSha256 = Hmac<Sha256>;

/// Signed JSON envelope, as sent on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub data: String,
    pub hash: String,
}

/// The 30-second bucket a timestamp falls into, adjusted by the negotiated
/// time delta.
pub fn time_bucket(unix_seconds: u64, time_delta_seconds: i64) -> u64 {
    let adjusted = unix_seconds as i64 + time_delta_seconds;
    (adjusted.max(0) as u64) / TIME_BUCKET_SECONDS
}

fn digest(secret: &[u8], bucket: u64, message: &[u8]) -> [u8; 32] {
    let mut key = Vec::with_capacity(secret.len() + 8);
    key.extend_from_slice(secret);
    key.extend_from_slice(&bucket.to_le_bytes());

    let mut mac = HmacSha256::new_from_slice(&key).expect("HMAC accepts keys of any length");
    mac.update(message);
    mac.finalize().into_bytes().into()
}

/// Wraps a raw JSON payload in the signed envelope.
pub fn sign_json(secret: &[u8], payload: &[u8], unix_seconds: u64, time_delta: i64) -> SignedEnvelope {
    let bucket = time_bucket(unix_seconds, time_delta);
    let hash = digest(secret, bucket, payload);
    SignedEnvelope {
        data: BASE64.encode(payload),
        hash: BASE64.encode(hash),
    }
}

/// Appends the binary trailer digest to a payload.
pub fn sign_binary(secret: &[u8], mut payload: Vec<u8>, unix_seconds: u64, time_delta: i64) -> Vec<u8> {
    let bucket = time_bucket(unix_seconds, time_delta);
    let hash = digest(secret, bucket, &payload);
    payload.extend_from_slice(&hash);
    payload
}

/// Verifies an inbound envelope and returns the raw payload on success.
///
/// The current bucket and its two neighbours are accepted.
pub fn verify_json(secret: &[u8], envelope: &SignedEnvelope, unix_seconds: u64) -> Option<Vec<u8>> {
    let payload = BASE64.decode(&envelope.data).ok()?;
    let presented = BASE64.decode(&envelope.hash).ok()?;
    if presented.len() != 32 {
        return None;
    }

    let bucket = time_bucket(unix_seconds, 0);
    for candidate in [bucket, bucket.wrapping_sub(1), bucket.wrapping_add(1)] {
        let expected = digest(secret, candidate, &payload);
        if expected.ct_eq(presented.as_slice()).into() {
            return Some(payload);
        }
    }
    None
}
