//! Authenticated client for the central controller.
//!
//! All outbound reports go through here: JSON payloads travel in the signed
//! envelope, binary payloads carry the trailer digest. Responses are JSON
//! objects with a single `status` field; anything else is surfaced to the
//! caller as an error so the channel-specific retry policies can run.

use std::sync::RwLock;

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use url::Url;

use crate::auth;
use crate::types::now_secs;

/// Reloadable connection settings.
struct Settings {
    base_url: Url,
    secret: Vec<u8>,
    /// Clock offset negotiated by the external time-delta primitive.
    time_delta_seconds: i64,
}

pub struct OutboundClient {
    client: reqwest::Client,
    settings: RwLock<Settings>,
}

impl OutboundClient {
    pub fn new(base_url: Url, secret: Vec<u8>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .context("building outbound HTTP client")?;

        Ok(Self {
            client,
            settings: RwLock::new(Settings {
                base_url,
                secret,
                time_delta_seconds: 0,
            }),
        })
    }

    /// Applies reloaded configuration.
    pub fn reconfigure(&self, base_url: Url, secret: Vec<u8>) {
        if let Ok(mut settings) = self.settings.write() {
            settings.base_url = base_url;
            settings.secret = secret;
        }
    }

    fn endpoint(&self, path: &str) -> Result<(Url, Vec<u8>, i64)> {
        let settings = self
            .settings
            .read()
            .map_err(|_| anyhow!("outbound settings lock poisoned"))?;
        let url = settings
            .base_url
            .join(path.trim_start_matches('/'))
            .with_context(|| format!("joining outbound path {path}"))?;
        Ok((url, settings.secret.clone(), settings.time_delta_seconds))
    }

    /// Posts a JSON payload in the signed envelope and returns the parsed
    /// JSON response object.
    pub async fn post_json(&self, path: &str, payload: &Value) -> Result<Value> {
        let (url, secret, delta) = self.endpoint(path)?;
        let raw = serde_json::to_vec(payload).context("encoding outbound payload")?;
        let envelope = auth::sign_json(&secret, &raw, now_secs(), delta);

        let response = self
            .client
            .post(url)
            .json(&envelope)
            .send()
            .await
            .with_context(|| format!("posting to {path}"))?;

        Self::parse_response(path, response).await
    }

    /// Posts a binary payload with the trailer digest appended.
    pub async fn post_binary(&self, path: &str, payload: Vec<u8>) -> Result<Value> {
        let (url, secret, delta) = self.endpoint(path)?;
        let signed = auth::sign_binary(&secret, payload, now_secs(), delta);

        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(signed)
            .send()
            .await
            .with_context(|| format!("posting to {path}"))?;

        Self::parse_response(path, response).await
    }

    async fn parse_response(path: &str, response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("{path} returned HTTP {status}"));
        }

        let body: Value = response
            .json()
            .await
            .with_context(|| format!("{path} response was not JSON"))?;
        if !body.is_object() {
            return Err(anyhow!("{path} response was not a JSON object"));
        }
        Ok(body)
    }
}

/// Extracts the `status` field from a controller response.
pub fn response_status(body: &Value) -> Option<&str> {
    body.get("status").and_then(Value::as_str)
}

/// True when the controller accepted the report.
pub fn is_accepted(body: &Value) -> bool {
    response_status(body) == Some("OK")
}
