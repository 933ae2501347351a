//! Authentication tokens: random, short-lived, stored in a process-wide table keyed by raw bytes.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::identity::PeerId;

/// Token length in bytes.
pub const TOKEN_LEN: usize = 32;

/// Default token time-to-live.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(180);

/// One issued token. `bound_to` is set when a peer confirms it.
#[derive(Debug, Clone)]
pub struct Token {
    bytes: Vec<u8>,
    issued_at: Instant,
    ttl: Duration,
    bound_to: Option<PeerId>,
}

impl Token {
    /// Generate a cryptographically random token.
    pub fn generate(ttl: Duration) -> Self {
        let mut bytes = vec![0u8; TOKEN_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self {
            bytes,
            issued_at: Instant::now(),
            ttl,
            bound_to: None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_valid(&self) -> bool {
        self.issued_at.elapsed() < self.ttl
    }

    pub fn bound_to(&self) -> Option<PeerId> {
        self.bound_to
    }
}

/// Token table. Supports concurrent issuance and lookup; never enumerated by callers.
#[derive(Debug, Default)]
pub struct TokenTable {
    tokens: DashMap<Vec<u8>, Token>,
}

impl TokenTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh token and store it. Expired entries are dropped first.
    pub fn issue(&self, ttl: Duration) -> Vec<u8> {
        self.purge_expired();
        let token = Token::generate(ttl);
        let bytes = token.bytes.clone();
        self.tokens.insert(bytes.clone(), token);
        bytes
    }

    /// Check that `token` exists and has not expired.
    pub fn validate(&self, token: &[u8]) -> Result<(), TokenError> {
        let entry = self.tokens.get(token).ok_or(TokenError::NotFound)?;
        if !entry.is_valid() {
            return Err(TokenError::Expired);
        }
        Ok(())
    }

    /// Validate `token` and bind it to `peer`. Re-binding to the same peer is allowed.
    pub fn bind(&self, token: &[u8], peer: PeerId) -> Result<(), TokenError> {
        let mut entry = self.tokens.get_mut(token).ok_or(TokenError::NotFound)?;
        if !entry.is_valid() {
            return Err(TokenError::Expired);
        }
        match entry.bound_to {
            Some(existing) if existing != peer => Err(TokenError::BoundToOtherPeer),
            _ => {
                entry.bound_to = Some(peer);
                Ok(())
            }
        }
    }

    /// Validate `token` for `peer`: it must be live and confirmed by that peer.
    pub fn validate_for(&self, token: &[u8], peer: PeerId) -> Result<(), TokenError> {
        let entry = self.tokens.get(token).ok_or(TokenError::NotFound)?;
        if !entry.is_valid() {
            return Err(TokenError::Expired);
        }
        match entry.bound_to {
            Some(bound) if bound == peer => Ok(()),
            _ => Err(TokenError::BoundToOtherPeer),
        }
    }

    /// Remove a token, e.g. after a peer disconnects for good.
    pub fn revoke(&self, token: &[u8]) -> bool {
        self.tokens.remove(token).is_some()
    }

    pub fn purge_expired(&self) {
        self.tokens.retain(|_, t| t.is_valid());
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("unknown token")]
    NotFound,
    #[error("token expired")]
    Expired,
    #[error("token belongs to another peer")]
    BoundToOtherPeer,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn issued_token_validates() {
        let table = TokenTable::new();
        let token = table.issue(DEFAULT_TOKEN_TTL);
        assert_eq!(token.len(), TOKEN_LEN);
        assert!(table.validate(&token).is_ok());
    }

    #[test]
    fn unknown_token_rejected() {
        let table = TokenTable::new();
        assert_eq!(table.validate(&[0u8; 32]), Err(TokenError::NotFound));
    }

    #[test]
    fn token_expires_after_ttl() {
        let table = TokenTable::new();
        let token = table.issue(Duration::from_millis(20));
        let peer = PeerId::from_name("node-1");
        table.bind(&token, peer).unwrap();
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(table.validate(&token), Err(TokenError::Expired));
        assert_eq!(table.validate_for(&token, peer), Err(TokenError::Expired));
    }

    #[test]
    fn bound_token_rejects_other_peer() {
        let table = TokenTable::new();
        let a = PeerId::from_name("a");
        let b = PeerId::from_name("b");
        let token = table.issue(DEFAULT_TOKEN_TTL);
        table.bind(&token, a).unwrap();
        assert!(table.validate_for(&token, a).is_ok());
        assert_eq!(table.validate_for(&token, b), Err(TokenError::BoundToOtherPeer));
        assert_eq!(table.bind(&token, b), Err(TokenError::BoundToOtherPeer));
        assert!(table.bind(&token, a).is_ok());
    }

    #[test]
    fn unbound_token_fails_peer_validation() {
        let table = TokenTable::new();
        let token = table.issue(DEFAULT_TOKEN_TTL);
        assert!(table
            .validate_for(&token, PeerId::from_name("a"))
            .is_err());
    }

    #[test]
    fn purge_drops_only_expired() {
        let table = TokenTable::new();
        let short = table.issue(Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(30));
        let long = table.issue(DEFAULT_TOKEN_TTL);
        assert_eq!(table.validate(&short), Err(TokenError::NotFound));
        assert!(table.validate(&long).is_ok());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn concurrent_issuance_keeps_every_token() {
        let table = Arc::new(TokenTable::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let t = table.clone();
                std::thread::spawn(move || {
                    (0..50).map(|_| t.issue(DEFAULT_TOKEN_TTL)).collect::<Vec<_>>()
                })
            })
            .collect();
        let all: Vec<Vec<u8>> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(table.len(), 400);
        for t in &all {
            assert!(table.validate(t).is_ok());
        }
    }

    #[test]
    fn revoke_removes() {
        let table = TokenTable::new();
        let token = table.issue(DEFAULT_TOKEN_TTL);
        assert!(table.revoke(&token));
        assert!(!table.revoke(&token));
        assert!(table.is_empty());
    }
}
