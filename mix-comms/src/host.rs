//! Host: local record of one remote peer. Owns the peer's connection and auth state.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use mix_core::{PeerId, PublicKey};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::duration_ms;
use crate::connection::{self, Binding, Connection};
use crate::error::CommsError;

/// Delay step between dial attempts: attempt `n` waits `n * CONNECT_BACKOFF`.
pub const CONNECT_BACKOFF: Duration = Duration::from_millis(50);

/// Per-host connection and call parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostParams {
    /// Dial attempts before connect gives up.
    pub max_retries: u32,
    #[serde(with = "duration_ms")]
    pub dial_timeout: Duration,
    /// Default per-call deadline.
    #[serde(with = "duration_ms")]
    pub send_timeout: Duration,
    /// Handshake automatically before calls when not yet authenticated.
    pub auth_enabled: bool,
    /// Plaintext even when a certificate is configured. Local and test use only.
    pub disable_tls: bool,
    pub binding: Binding,
    pub tls_server_name: Option<String>,
}

impl Default for HostParams {
    fn default() -> Self {
        Self {
            max_retries: 5,
            dial_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(10),
            auth_enabled: true,
            disable_tls: false,
            binding: Binding::Native,
            tls_server_name: None,
        }
    }
}

/// Initiator-side handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    TokenRequested,
    Authenticated,
}

#[derive(Debug)]
struct Tokens {
    state: AuthState,
    /// Token this peer issued to us; presented on every authenticated call we make.
    transmission: Vec<u8>,
    /// Token this peer confirmed with us; expected on every authenticated call it makes.
    reception: Vec<u8>,
}

pub struct Host {
    id: PeerId,
    address: String,
    cert_pem: Option<Vec<u8>>,
    public_key: Option<PublicKey>,
    params: HostParams,
    tokens: RwLock<Tokens>,
    connection: Mutex<Option<Arc<dyn Connection>>>,
    auth_lock: Mutex<()>,
}

impl Host {
    pub fn new(
        id: PeerId,
        address: impl Into<String>,
        cert_pem: Option<Vec<u8>>,
        public_key: Option<PublicKey>,
        params: HostParams,
    ) -> Self {
        Self {
            id,
            address: address.into(),
            cert_pem,
            public_key,
            params,
            tokens: RwLock::new(Tokens {
                state: AuthState::Unauthenticated,
                transmission: Vec::new(),
                reception: Vec::new(),
            }),
            connection: Mutex::new(None),
            auth_lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn cert_pem(&self) -> Option<&[u8]> {
        self.cert_pem.as_deref()
    }

    pub fn public_key(&self) -> Option<PublicKey> {
        self.public_key
    }

    pub fn params(&self) -> &HostParams {
        &self.params
    }

    pub fn auth_state(&self) -> AuthState {
        self.tokens.read().state
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth_state() == AuthState::Authenticated
    }

    pub fn transmission_token(&self) -> Vec<u8> {
        self.tokens.read().transmission.clone()
    }

    pub fn reception_token(&self) -> Vec<u8> {
        self.tokens.read().reception.clone()
    }

    /// Byte-for-byte comparison against the stored reception token. Never matches when empty.
    pub fn reception_token_matches(&self, presented: &[u8]) -> bool {
        let tokens = self.tokens.read();
        !tokens.reception.is_empty() && tokens.reception == presented
    }

    pub(crate) fn token_requested(&self, token: Vec<u8>) {
        let mut tokens = self.tokens.write();
        tokens.transmission = token;
        tokens.state = AuthState::TokenRequested;
    }

    pub(crate) fn mark_authenticated(&self) {
        self.tokens.write().state = AuthState::Authenticated;
    }

    /// Drop our credentials for this peer; the next authenticated call re-handshakes.
    pub fn reset_auth(&self) {
        let mut tokens = self.tokens.write();
        tokens.transmission.clear();
        tokens.state = AuthState::Unauthenticated;
    }

    pub(crate) fn set_reception_token(&self, token: Vec<u8>) {
        self.tokens.write().reception = token;
    }

    pub(crate) fn clear_reception_token(&self) {
        self.tokens.write().reception.clear();
    }

    pub(crate) fn auth_lock(&self) -> &Mutex<()> {
        &self.auth_lock
    }

    /// Return the current connection if it is good, otherwise dial a new one. Concurrent callers
    /// for the same host wait on this host's lock and share the result.
    pub async fn connect(&self) -> Result<Arc<dyn Connection>, CommsError> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            if conn.is_good() {
                return Ok(conn.clone());
            }
            debug!(peer = %self.id, state = ?conn.state(), "replacing stale connection");
            conn.close().await;
        }
        *slot = None;

        let attempts = self.params.max_retries.max(1);
        let mut attempt = 1;
        loop {
            debug!(peer = %self.id, address = %self.address, attempt, "dialing");
            match connection::dial(&self.address, &self.params, self.cert_pem()).await {
                Ok(conn) => {
                    *slot = Some(conn.clone());
                    return Ok(conn);
                }
                Err(e) if attempt < attempts => {
                    warn!(peer = %self.id, address = %self.address, attempt, error = %e, "dial failed");
                    tokio::time::sleep(CONNECT_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(source) => {
                    return Err(CommsError::ConnectFailed {
                        peer: self.id,
                        address: self.address.clone(),
                        attempts,
                        source,
                    });
                }
            }
        }
    }

    /// Close and clear the connection, if any.
    pub async fn disconnect(&self) {
        let conn = self.connection.lock().await.take();
        if let Some(conn) = conn {
            debug!(peer = %self.id, "disconnecting");
            conn.close().await;
        }
    }

    pub async fn has_connection(&self) -> bool {
        self.connection.lock().await.is_some()
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("tls", &self.cert_pem.is_some())
            .field("auth_state", &self.auth_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::testutil::{closed_address, counting_listener, fast_params};
    use std::sync::atomic::Ordering;

    #[test]
    fn default_params() {
        let p = HostParams::default();
        assert_eq!(p.max_retries, 5);
        assert!(p.auth_enabled);
        assert!(!p.disable_tls);
        assert_eq!(p.binding, Binding::Native);
    }

    #[test]
    fn auth_state_transitions() {
        let host = Host::new(PeerId::from_name("b"), "x:1", None, None, HostParams::default());
        assert_eq!(host.auth_state(), AuthState::Unauthenticated);
        host.token_requested(vec![1, 2]);
        assert_eq!(host.auth_state(), AuthState::TokenRequested);
        assert_eq!(host.transmission_token(), vec![1, 2]);
        host.mark_authenticated();
        assert!(host.is_authenticated());
        host.reset_auth();
        assert_eq!(host.auth_state(), AuthState::Unauthenticated);
        assert!(host.transmission_token().is_empty());
    }

    #[test]
    fn empty_reception_token_never_matches() {
        let host = Host::new(PeerId::from_name("a"), "x:1", None, None, HostParams::default());
        assert!(!host.reception_token_matches(&[]));
        host.set_reception_token(vec![3; 32]);
        assert!(host.reception_token_matches(&[3; 32]));
        assert!(!host.reception_token_matches(&[4; 32]));
    }

    #[tokio::test]
    async fn connect_reuses_good_connection() {
        let (addr, accepted) = counting_listener().await;
        let host = Host::new(PeerId::from_name("b"), addr, None, None, fast_params());
        let a = host.connect().await.unwrap();
        let b = host.connect().await.unwrap();
        assert!(std::ptr::eq(
            Arc::as_ptr(&a) as *const (),
            Arc::as_ptr(&b) as *const ()
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connect_gives_up_after_max_retries() {
        let mut params = fast_params();
        params.max_retries = 3;
        let host = Host::new(PeerId::from_name("b"), closed_address().await, None, None, params);
        let err = host.connect().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connectivity);
        assert!(!err.is_retryable());
        match err {
            CommsError::ConnectFailed { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!host.has_connection().await);
    }

    #[tokio::test]
    async fn stale_connection_is_replaced() {
        let (addr, accepted) = counting_listener().await;
        let host = Host::new(PeerId::from_name("b"), addr, None, None, fast_params());
        let first = host.connect().await.unwrap();
        first.close().await;
        let second = host.connect().await.unwrap();
        assert!(second.is_good());
        assert!(!std::ptr::eq(
            Arc::as_ptr(&first) as *const (),
            Arc::as_ptr(&second) as *const ()
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }
}
