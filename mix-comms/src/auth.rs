//! Token handshake and inbound envelope verification.
//!
//! Initiator: `RequestToken` with an empty ping, store the issued token on the host, then send
//! it back signed to `AuthenticateToken`. Responder: issue random tokens, and on confirmation
//! verify the sender's signature, check the token is live and bind it to the sender's host.

use std::sync::Arc;

use mix_core::envelope::EnvelopeSignatureError;
use mix_core::messages::{Ack, AssignToken, Ping};
use mix_core::protocol::methods;
use mix_core::{AuthenticatedMessage, Payload, PayloadError, PeerId, Status, TokenError};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::comms::Comms;
use crate::connection::Connection;
use crate::dispatch::{call_unary, HANDSHAKE_TIMEOUT};
use crate::error::CommsError;
use crate::host::Host;
use crate::server::{decode_request, unary, Reply};

/// Result of checking an inbound envelope.
#[derive(Debug, Clone)]
pub struct Auth {
    pub is_authenticated: bool,
    pub sender: Option<Arc<Host>>,
}

impl Auth {
    pub fn sender_id(&self) -> Option<PeerId> {
        self.sender.as_ref().map(|h| h.id())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("unknown sender {0}")]
    UnknownSender(PeerId),
    #[error("no public key known for {0}")]
    MissingPublicKey(PeerId),
    #[error("signature from {peer} rejected: {source}")]
    Signature {
        peer: PeerId,
        #[source]
        source: EnvelopeSignatureError,
    },
    #[error("token from {peer} rejected: {source}")]
    Token {
        peer: PeerId,
        #[source]
        source: TokenError,
    },
    #[error(transparent)]
    Payload(#[from] PayloadError),
}

impl From<AuthError> for Status {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Payload(e) => Status::invalid_argument(e.to_string()),
            other => Status::unauthenticated(other.to_string()),
        }
    }
}

impl Comms {
    /// Run the handshake with `host`. Serialized per host; a no-op if another caller finished
    /// it first.
    pub async fn client_handshake(&self, host: &Arc<Host>) -> Result<(), CommsError> {
        let _guard = host.auth_lock().lock().await;
        if host.is_authenticated() {
            return Ok(());
        }
        let peer = host.id();
        debug!(peer = %peer, "starting handshake");
        let result = self.handshake_steps(host).await;
        match result {
            Ok(()) => {
                host.mark_authenticated();
                info!(peer = %peer, "authenticated");
                Ok(())
            }
            Err(e) => {
                host.reset_auth();
                warn!(peer = %peer, error = %e, "handshake failed");
                Err(CommsError::Handshake {
                    peer,
                    source: Box::new(e),
                })
            }
        }
    }

    async fn handshake_steps(&self, host: &Arc<Host>) -> Result<(), CommsError> {
        let peer = host.id();
        let assigned: AssignToken = self
            .dispatch(host, HANDSHAKE_TIMEOUT, |conn| async move {
                call_unary(conn.as_ref(), peer, methods::REQUEST_TOKEN, &Ping {}).await
            })
            .await?;
        host.token_requested(assigned.token.clone());

        let envelope = self.pack_authenticated_message(&assigned, host, true)?;
        let envelope = &envelope;
        let _: Ack = self
            .dispatch(host, HANDSHAKE_TIMEOUT, |conn| async move {
                call_unary(conn.as_ref(), peer, methods::AUTHENTICATE_TOKEN, envelope).await
            })
            .await?;
        Ok(())
    }

    /// Wrap `msg` for `host` with our ID and the token it issued us, signing if asked.
    pub fn pack_authenticated_message<T: Payload>(
        &self,
        msg: &T,
        host: &Host,
        sign: bool,
    ) -> Result<AuthenticatedMessage, CommsError> {
        let signer = if sign { Some(self.signer()) } else { None };
        Ok(AuthenticatedMessage::pack(
            self.id(),
            host.transmission_token(),
            msg,
            signer,
        )?)
    }

    /// Issue a fresh token. Not bound to anyone until confirmed.
    pub fn generate_token(&self) -> Vec<u8> {
        self.tokens().issue(self.token_ttl())
    }

    /// Confirm a token: signature from a known host, token live and not bound to someone else.
    /// On success the token becomes the sender's reception token.
    pub fn validate_token(&self, msg: &AuthenticatedMessage) -> Result<(), AuthError> {
        let host = self
            .registry()
            .get_host(&msg.sender)
            .ok_or(AuthError::UnknownSender(msg.sender))?;
        verify_envelope(&host, msg)?;
        let assigned: AssignToken = msg.unpack()?;
        self.tokens()
            .bind(&assigned.token, host.id())
            .map_err(|source| AuthError::Token {
                peer: host.id(),
                source,
            })?;
        host.set_reception_token(assigned.token);
        info!(peer = %host.id(), "token confirmed");
        Ok(())
    }

    /// Check an inbound envelope. Unknown senders and bad signatures are errors; a token that
    /// does not match (or has expired) yields `is_authenticated: false`.
    pub fn authenticated_receiver(
        &self,
        msg: &AuthenticatedMessage,
        require_signature: bool,
    ) -> Result<Auth, AuthError> {
        let host = self
            .registry()
            .get_host(&msg.sender)
            .ok_or(AuthError::UnknownSender(msg.sender))?;
        if require_signature {
            verify_envelope(&host, msg)?;
        }
        let unauthenticated = |host| Auth {
            is_authenticated: false,
            sender: Some(host),
        };
        if !host.reception_token_matches(&msg.token) {
            debug!(peer = %host.id(), "token mismatch");
            return Ok(unauthenticated(host));
        }
        match self.tokens().validate_for(&msg.token, host.id()) {
            Ok(()) => Ok(Auth {
                is_authenticated: true,
                sender: Some(host),
            }),
            Err(e) => {
                debug!(peer = %host.id(), error = %e, "stored token no longer valid");
                host.clear_reception_token();
                Ok(unauthenticated(host))
            }
        }
    }

    /// Serve `RequestToken` / `AuthenticateToken`. `None` for any other method.
    pub(crate) fn serve_handshake(
        &self,
        method: &str,
        payload: &[u8],
    ) -> Option<Result<Reply, Status>> {
        match method {
            methods::REQUEST_TOKEN => Some(decode_request::<Ping>(payload).and_then(|_| {
                unary(&AssignToken {
                    token: self.generate_token(),
                })
            })),
            methods::AUTHENTICATE_TOKEN => Some(
                decode_request::<AuthenticatedMessage>(payload).and_then(|msg| {
                    self.validate_token(&msg)?;
                    unary(&Ack::default())
                }),
            ),
            _ => None,
        }
    }

    /// Decode an envelope, check it and unpack its payload. The caller decides what an
    /// unauthenticated result means.
    pub(crate) fn open_envelope<T: Payload>(&self, payload: &[u8]) -> Result<(T, Auth), Status> {
        let msg: AuthenticatedMessage = decode_request(payload)?;
        let auth = self.authenticated_receiver(&msg, false)?;
        let request = msg.unpack().map_err(AuthError::from)?;
        Ok((request, auth))
    }

    /// [`open_envelope`](Self::open_envelope), rejecting unauthenticated senders.
    pub(crate) fn open_authenticated<T: Payload>(&self, payload: &[u8]) -> Result<(T, Auth), Status> {
        let (request, auth) = self.open_envelope(payload)?;
        if !auth.is_authenticated {
            let sender = auth.sender_id().map(|id| id.to_string()).unwrap_or_default();
            warn!(peer = %sender, "rejecting unauthenticated call");
            return Err(Status::unauthenticated(format!("{} is not authenticated", sender)));
        }
        Ok((request, auth))
    }

    /// Send `request` wrapped in an envelope carrying the host's current token. Packing happens
    /// after the auto-handshake so a fresh token is used.
    pub(crate) async fn send_authenticated<Req, Resp>(
        &self,
        host: &Arc<Host>,
        method: &'static str,
        request: &Req,
        retry: bool,
    ) -> Result<Resp, CommsError>
    where
        Req: Payload + Sync,
        Resp: DeserializeOwned,
    {
        let peer = host.id();
        let op = |conn: Arc<dyn Connection>| async move {
            let envelope = self.pack_authenticated_message(request, host, false)?;
            call_unary(conn.as_ref(), peer, method, &envelope).await
        };
        if retry {
            self.send_with_retry(host, op).await
        } else {
            self.send(host, op).await
        }
    }
}

fn verify_envelope(host: &Host, msg: &AuthenticatedMessage) -> Result<(), AuthError> {
    let key = host
        .public_key()
        .ok_or(AuthError::MissingPublicKey(host.id()))?;
    msg.verify_signature(&key)
        .map_err(|source| AuthError::Signature {
            peer: host.id(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::host::HostParams;
    use crate::testutil::{fast_params, new_comms, register_peer, start_node};
    use mix_core::messages::RoundInfo;
    use mix_core::Keypair;
    use std::time::Duration;

    #[test]
    fn unknown_sender_is_an_error() {
        let b = new_comms();
        let a = new_comms();
        let msg = AuthenticatedMessage::pack(a.id(), vec![1], &Ping {}, None).unwrap();
        assert!(matches!(
            b.authenticated_receiver(&msg, false),
            Err(AuthError::UnknownSender(_))
        ));
        assert!(matches!(
            b.validate_token(&msg),
            Err(AuthError::UnknownSender(_))
        ));
    }

    #[test]
    fn confirmation_needs_senders_signature() {
        let a = new_comms();
        let b = new_comms();
        let host_a = register_peer(&b, &a, "127.0.0.1:1", fast_params());
        let token = b.generate_token();
        let impostor = Keypair::generate();
        let forged = AuthenticatedMessage::pack(
            a.id(),
            Vec::new(),
            &AssignToken {
                token: token.clone(),
            },
            Some(&impostor),
        )
        .unwrap();
        assert!(matches!(
            b.validate_token(&forged),
            Err(AuthError::Signature { .. })
        ));
        assert!(host_a.reception_token().is_empty());
    }

    #[test]
    fn confirmation_of_unknown_token_fails() {
        let a = new_comms();
        let b = new_comms();
        register_peer(&b, &a, "127.0.0.1:1", fast_params());
        let host_b = register_peer(&a, &b, "127.0.0.1:1", fast_params());
        host_b.token_requested(vec![5; 32]);
        let msg = a
            .pack_authenticated_message(&AssignToken { token: vec![5; 32] }, &host_b, true)
            .unwrap();
        assert!(matches!(
            b.validate_token(&msg),
            Err(AuthError::Token {
                source: TokenError::NotFound,
                ..
            })
        ));
    }

    #[test]
    fn token_validates_only_for_its_owner() {
        let a = new_comms();
        let b = new_comms();
        let c = new_comms();
        register_peer(&b, &a, "127.0.0.1:1", fast_params());
        register_peer(&b, &c, "127.0.0.1:1", fast_params());
        let host_b_at_a = register_peer(&a, &b, "127.0.0.1:1", fast_params());

        let token = b.generate_token();
        host_b_at_a.token_requested(token.clone());
        let confirm = a
            .pack_authenticated_message(&AssignToken { token: token.clone() }, &host_b_at_a, true)
            .unwrap();
        b.validate_token(&confirm).unwrap();

        let from_a = a
            .pack_authenticated_message(&RoundInfo::default(), &host_b_at_a, false)
            .unwrap();
        let auth = b.authenticated_receiver(&from_a, false).unwrap();
        assert!(auth.is_authenticated);
        assert_eq!(auth.sender_id(), Some(a.id()));

        // C presents A's token.
        let stolen = AuthenticatedMessage::pack(c.id(), token, &RoundInfo::default(), None).unwrap();
        let auth = b.authenticated_receiver(&stolen, false).unwrap();
        assert!(!auth.is_authenticated);
        assert_eq!(auth.sender_id(), Some(c.id()));
    }

    #[test]
    fn required_signature_is_checked() {
        let a = new_comms();
        let b = new_comms();
        register_peer(&b, &a, "127.0.0.1:1", fast_params());
        let unsigned = AuthenticatedMessage::pack(a.id(), vec![], &Ping {}, None).unwrap();
        assert!(b.authenticated_receiver(&unsigned, false).is_ok());
        assert!(matches!(
            b.authenticated_receiver(&unsigned, true),
            Err(AuthError::Signature { .. })
        ));
    }

    #[tokio::test]
    async fn handshake_binds_tokens_on_both_sides() {
        let a = new_comms();
        let b = new_comms();
        let server = start_node(&b).await;
        register_peer(&b, &a, "127.0.0.1:1", fast_params());
        let host_b = register_peer(&a, &b, &server.local_addr().to_string(), fast_params());

        a.client_handshake(&host_b).await.unwrap();
        assert!(host_b.is_authenticated());
        let token = host_b.transmission_token();
        assert!(b.tokens().validate_for(&token, a.id()).is_ok());
        let host_a_at_b = b.registry().get_host(&a.id()).unwrap();
        assert_eq!(host_a_at_b.reception_token(), token);
    }

    #[tokio::test]
    async fn handshake_with_unknown_responder_registration_fails() {
        let a = new_comms();
        let b = new_comms();
        let server = start_node(&b).await;
        // B has no record of A, so confirmation is rejected.
        let host_b = register_peer(&a, &b, &server.local_addr().to_string(), fast_params());
        let err = a.client_handshake(&host_b).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert!(!host_b.is_authenticated());
        assert!(host_b.transmission_token().is_empty());
    }

    #[tokio::test]
    async fn concurrent_handshakes_run_once() {
        let a = new_comms();
        let b = new_comms();
        let server = start_node(&b).await;
        register_peer(&b, &a, "127.0.0.1:1", fast_params());
        let host_b = register_peer(&a, &b, &server.local_addr().to_string(), fast_params());
        let (r1, r2) = tokio::join!(a.client_handshake(&host_b), a.client_handshake(&host_b));
        r1.unwrap();
        r2.unwrap();
        assert_eq!(b.tokens().len(), 1);
    }

    #[tokio::test]
    async fn expired_token_clears_reception_token() {
        let a = new_comms();
        let b = Comms::with_settings(Keypair::generate(), Duration::from_millis(200), 1024);
        let server = start_node(&b).await;
        register_peer(&b, &a, "127.0.0.1:1", HostParams::default());
        let host_b = register_peer(&a, &b, &server.local_addr().to_string(), fast_params());
        a.client_handshake(&host_b).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let msg = a
            .pack_authenticated_message(&Ping {}, &host_b, false)
            .unwrap();
        let auth = b.authenticated_receiver(&msg, false).unwrap();
        assert!(!auth.is_authenticated);
        assert!(b
            .registry()
            .get_host(&a.id())
            .unwrap()
            .reception_token()
            .is_empty());
    }
}
