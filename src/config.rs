//! Configuration loading, validation, and hot reload.
//!
//! The configuration is a JSON document. It is loaded once at start-up and
//! re-applied whenever the file changes; a failure at either point is fatal
//! by design — a polling server with a broken configuration must not keep
//! running on stale keys.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use figment::providers::{Format, Json};
use figment::Figment;
use notify::{EventKind, RecursiveMode, Watcher};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use url::Url;

use crate::auth::SECRET_LENGTH;

const DEFAULT_PINGER_NAME: &str = "Pinger";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    inbound_api_key: String,
    outbound_api_key: String,
    database_server: String,
    inbound_port: u16,
    server_identifier: String,
    #[serde(default = "default_pinger")]
    pinger: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

fn default_pinger() -> String {
    DEFAULT_PINGER_NAME.to_string()
}

/// Validated configuration with decoded secrets.
#[derive(Debug, Clone)]
pub struct Config {
    pub inbound_api_key: Vec<u8>,
    pub outbound_api_key: Vec<u8>,
    pub database_server: Url,
    pub inbound_port: u16,
    pub server_identifier: String,
    pub pinger: String,
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    NotFound(PathBuf),
    #[error("invalid configuration: {0}")]
    Parse(#[from] figment::Error),
    #[error("invalid {0} API key length, expected {SECRET_LENGTH} bytes")]
    InvalidKey(&'static str),
    #[error("invalid database server URL")]
    InvalidDatabaseServer,
    #[error("invalid inbound port")]
    InvalidPort,
    #[error("invalid server identifier")]
    InvalidIdentifier,
    #[error("could not watch configuration file: {0}")]
    Watch(#[from] notify::Error),
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let raw: RawConfig = Figment::new().merge(Json::file(path)).extract()?;

        let inbound_api_key = decode_key(&raw.inbound_api_key, "inbound")?;
        let outbound_api_key = decode_key(&raw.outbound_api_key, "outbound")?;

        let database_server =
            Url::parse(&raw.database_server).map_err(|_| ConfigError::InvalidDatabaseServer)?;

        if raw.inbound_port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if raw.server_identifier.is_empty() {
            return Err(ConfigError::InvalidIdentifier);
        }

        Ok(Config {
            inbound_api_key,
            outbound_api_key,
            database_server,
            inbound_port: raw.inbound_port,
            server_identifier: raw.server_identifier,
            pinger: raw.pinger,
            headers: raw.headers,
        })
    }
}

fn decode_key(encoded: &str, which: &'static str) -> Result<Vec<u8>, ConfigError> {
    let key = BASE64
        .decode(encoded)
        .map_err(|_| ConfigError::InvalidKey(which))?;
    if key.len() != SECRET_LENGTH {
        return Err(ConfigError::InvalidKey(which));
    }
    Ok(key)
}

/// Watches the configuration file and re-applies it on every change. A
/// reload failure terminates the process with exit code 1, same as a failed
/// initial load.
pub fn spawn_watcher(
    path: PathBuf,
    mut shutdown: watch::Receiver<()>,
    on_reload: impl Fn(Config) + Send + 'static,
) -> Result<(), ConfigError> {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut watcher = notify::recommended_watcher(move |result: Result<notify::Event, notify::Error>| {
        if let Ok(event) = result {
            if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                let _ = tx.send(());
            }
        }
    })?;
    watcher.watch(&path, RecursiveMode::NonRecursive)?;

    tokio::spawn(async move {
        // Keeps the watcher registered for the life of the task.
        let _watcher = watcher;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                changed = rx.recv() => {
                    if changed.is_none() {
                        break;
                    }
                    match Config::load(&path) {
                        Ok(config) => {
                            info!(path = %path.display(), "configuration reloaded");
                            on_reload(config);
                        }
                        Err(config_error) => {
                            error!(
                                path = %path.display(),
                                error = %config_error,
                                "configuration reload failed"
                            );
                            std::process::exit(1);
                        }
                    }
                }
            }
        }
    });

    Ok(())
}
