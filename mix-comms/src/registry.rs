//! Host registry: peer ID to [`Host`], with lazy, per-host serialized connection.

use std::sync::Arc;

use dashmap::DashMap;
use mix_core::{PeerId, PublicKey};
use tracing::debug;

use crate::connection::Connection;
use crate::error::CommsError;
use crate::host::{Host, HostParams};

#[derive(Debug, Default)]
pub struct HostRegistry {
    hosts: DashMap<PeerId, Arc<Host>>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer without connecting. Replaces any previous record for `id`.
    pub fn add_host(
        &self,
        id: PeerId,
        address: impl Into<String>,
        cert_pem: Option<Vec<u8>>,
        public_key: Option<PublicKey>,
        params: HostParams,
    ) -> Arc<Host> {
        let host = Arc::new(Host::new(id, address, cert_pem, public_key, params));
        debug!(peer = %id, address = %host.address(), "host added");
        self.hosts.insert(id, host.clone());
        host
    }

    pub fn get_host(&self, id: &PeerId) -> Option<Arc<Host>> {
        self.hosts.get(id).map(|h| h.clone())
    }

    /// Drop the record and close its connection.
    pub async fn remove_host(&self, id: &PeerId) -> Option<Arc<Host>> {
        let (_, host) = self.hosts.remove(id)?;
        host.disconnect().await;
        Some(host)
    }

    /// Connect to a registered peer. See [`Host::connect`].
    pub async fn connect(&self, id: &PeerId) -> Result<Arc<dyn Connection>, CommsError> {
        let host = self.get_host(id).ok_or(CommsError::HostNotFound(*id))?;
        host.connect().await
    }

    /// Close the peer's connection. Unknown peers are a no-op.
    pub async fn disconnect(&self, id: &PeerId) {
        if let Some(host) = self.get_host(id) {
            host.disconnect().await;
        }
    }

    pub async fn disconnect_all(&self) {
        for host in self.hosts() {
            host.disconnect().await;
        }
    }

    pub async fn has_connection(&self, id: &PeerId) -> bool {
        match self.get_host(id) {
            Some(host) => host.has_connection().await,
            None => false,
        }
    }

    /// Snapshot of every registered host.
    pub fn hosts(&self) -> Vec<Arc<Host>> {
        self.hosts.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}
