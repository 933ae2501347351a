//! Per-process comms handle: our identity, the host registry and the token table.

use std::sync::Arc;
use std::time::Duration;

use mix_core::{Keypair, PeerId, PublicKey, Signer, TokenTable, DEFAULT_CHUNK_SIZE, DEFAULT_TOKEN_TTL};
use tracing::info;

use crate::config::{CommsConfig, ConfigError};
use crate::registry::HostRegistry;

/// Shared by every role endpoint and client call. Cheap to clone.
#[derive(Clone)]
pub struct Comms {
    keypair: Arc<Keypair>,
    registry: Arc<HostRegistry>,
    tokens: Arc<TokenTable>,
    token_ttl: Duration,
    chunk_size: usize,
}

impl Comms {
    pub fn new(keypair: Keypair) -> Self {
        Self::with_settings(keypair, DEFAULT_TOKEN_TTL, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_settings(keypair: Keypair, token_ttl: Duration, chunk_size: usize) -> Self {
        Self {
            keypair: Arc::new(keypair),
            registry: Arc::new(HostRegistry::new()),
            tokens: Arc::new(TokenTable::new()),
            token_ttl,
            chunk_size,
        }
    }

    /// Build from config and register its hosts.
    pub fn from_config(keypair: Keypair, config: &CommsConfig) -> Result<Self, ConfigError> {
        let comms = Self::with_settings(keypair, config.token_ttl, config.chunk_size);
        config.register_hosts(&comms.registry)?;
        Ok(comms)
    }

    pub fn id(&self) -> PeerId {
        self.keypair.peer_id()
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    pub(crate) fn signer(&self) -> &dyn Signer {
        self.keypair.as_ref()
    }

    pub fn registry(&self) -> &HostRegistry {
        &self.registry
    }

    pub fn tokens(&self) -> &TokenTable {
        &self.tokens
    }

    pub fn token_ttl(&self) -> Duration {
        self.token_ttl
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Close every outbound connection. Hosts stay registered.
    pub async fn shutdown(&self) {
        info!(id = %self.id(), hosts = self.registry.len(), "comms shutting down");
        self.registry.disconnect_all().await;
    }
}

impl std::fmt::Debug for Comms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Comms")
            .field("id", &self.id())
            .field("hosts", &self.registry.len())
            .field("token_ttl", &self.token_ttl)
            .finish()
    }
}
