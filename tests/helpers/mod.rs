//! Shared helpers for the integration tests.

#![allow(dead_code)]

use pollwatch::auth::{self, SECRET_LENGTH};
use pollwatch::types::now_secs;
use serde_json::Value;

/// Deterministic inbound/outbound test secret.
pub fn test_secret() -> Vec<u8> {
    (0..SECRET_LENGTH as u8).collect()
}

/// Signs a JSON payload the way the controller would.
pub fn signed_envelope(secret: &[u8], payload: &Value) -> Value {
    let raw = serde_json::to_vec(payload).unwrap();
    let envelope = auth::sign_json(secret, &raw, now_secs(), 0);
    serde_json::to_value(envelope).unwrap()
}

/// Signs an empty payload for the body-less endpoints.
pub fn signed_empty(secret: &[u8]) -> Value {
    let envelope = auth::sign_json(secret, b"", now_secs(), 0);
    serde_json::to_value(envelope).unwrap()
}
