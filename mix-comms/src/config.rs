//! Load comms config from file and environment.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use mix_core::{PeerId, PublicKey, SignatureError, DEFAULT_CHUNK_SIZE, DEFAULT_TOKEN_TTL};
use serde::Deserialize;

use crate::connection::{TlsError, TlsIdentity};
use crate::host::{Host, HostParams};
use crate::registry::HostRegistry;

/// Comms configuration. File: `$MIXCOMMS_CONFIG`, ~/.config/mixcomms/config.toml or
/// /etc/mixcomms/config.toml.
/// Env overrides: MIXCOMMS_LISTEN_ADDRESS, MIXCOMMS_TOKEN_TTL_SECS, MIXCOMMS_CHUNK_SIZE.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommsConfig {
    /// Server listen address (default 0.0.0.0:11420).
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Lifetime of issued tokens, in milliseconds (default 180 s).
    #[serde(default = "default_token_ttl", with = "duration_ms")]
    pub token_ttl: Duration,
    /// Bytes per chunk in streamed responses (default 1 MiB).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default)]
    pub cert_pem: Option<String>,
    #[serde(default)]
    pub key_pem: Option<String>,
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
}

/// One `[[hosts]]` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    /// Peer ID, hex.
    pub id: String,
    pub address: String,
    #[serde(default)]
    pub cert_pem: Option<String>,
    /// Ed25519 public key, hex.
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub params: HostParams,
}

fn default_listen_address() -> String {
    "0.0.0.0:11420".to_string()
}
fn default_token_ttl() -> Duration {
    DEFAULT_TOKEN_TTL
}
fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

impl Default for CommsConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            token_ttl: default_token_ttl(),
            chunk_size: default_chunk_size(),
            cert_pem: None,
            key_pem: None,
            hosts: Vec::new(),
        }
    }
}

impl CommsConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|source| ConfigError::Parse {
            path: None,
            source,
        })
    }

    /// Server TLS identity, if both certificate and key are configured.
    pub fn tls_identity(&self) -> Result<Option<TlsIdentity>, TlsError> {
        match (&self.cert_pem, &self.key_pem) {
            (Some(cert), Some(key)) => {
                TlsIdentity::from_pem(cert.as_bytes(), key.as_bytes()).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Add every configured host to `registry`.
    pub fn register_hosts(&self, registry: &HostRegistry) -> Result<Vec<Arc<Host>>, ConfigError> {
        self.hosts
            .iter()
            .map(|h| -> Result<Arc<Host>, ConfigError> {
                let id: PeerId = h.id.parse().map_err(|source| ConfigError::InvalidHostId {
                    id: h.id.clone(),
                    source,
                })?;
                let public_key = h
                    .public_key
                    .as_deref()
                    .map(str::parse::<PublicKey>)
                    .transpose()
                    .map_err(|source| ConfigError::InvalidPublicKey {
                        id: h.id.clone(),
                        source,
                    })?;
                Ok(registry.add_host(
                    id,
                    h.address.clone(),
                    h.cert_pem.as_ref().map(|p| p.as_bytes().to_vec()),
                    public_key,
                    h.params.clone(),
                ))
            })
            .collect()
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(s) = var("MIXCOMMS_LISTEN_ADDRESS") {
            self.listen_address = s;
        }
        if let Some(s) = var("MIXCOMMS_TOKEN_TTL_SECS") {
            let secs = s.parse::<u64>().map_err(|_| ConfigError::InvalidEnv {
                var: "MIXCOMMS_TOKEN_TTL_SECS",
                value: s.clone(),
            })?;
            self.token_ttl = Duration::from_secs(secs);
        }
        if let Some(s) = var("MIXCOMMS_CHUNK_SIZE") {
            self.chunk_size = s.parse::<usize>().map_err(|_| ConfigError::InvalidEnv {
                var: "MIXCOMMS_CHUNK_SIZE",
                value: s.clone(),
            })?;
        }
        Ok(())
    }
}

/// Load config: defaults, then the first config file found, then env vars.
pub fn load() -> Result<CommsConfig, ConfigError> {
    let mut c = match config_paths().into_iter().find(|p| p.exists()) {
        Some(path) => load_file(&path)?,
        None => CommsConfig::default(),
    };
    c.apply_env(|k| std::env::var(k).ok())?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(p) = std::env::var_os("MIXCOMMS_CONFIG") {
        out.push(PathBuf::from(p));
    }
    if let Some(h) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(h.join(".config/mixcomms/config.toml"));
    }
    out.push(PathBuf::from("/etc/mixcomms/config.toml"));
    out
}

pub fn load_file(path: &Path) -> Result<CommsConfig, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: Some(path.to_path_buf()),
        source,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config {path:?}: {source}")]
    Parse {
        path: Option<PathBuf>,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid {var}={value:?}")]
    InvalidEnv { var: &'static str, value: String },
    #[error("invalid host id {id:?}: {source}")]
    InvalidHostId {
        id: String,
        #[source]
        source: hex::FromHexError,
    },
    #[error("invalid public key for host {id}: {source}")]
    InvalidPublicKey {
        id: String,
        #[source]
        source: SignatureError,
    },
}

/// Serde adapter: `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
