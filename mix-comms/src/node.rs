//! Node role: liveness, round lifecycle and batch/phase submission.
//!
//! Everything except `AskOnline` is authenticated; the endpoint rejects unauthenticated
//! envelopes before the handler runs.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use mix_core::messages::{Ack, Batch, Ping, RoundError, RoundInfo};
use mix_core::protocol::methods;
use mix_core::Status;
use tracing::warn;

use crate::auth::Auth;
use crate::comms::Comms;
use crate::connection::TlsIdentity;
use crate::dispatch::call_unary;
use crate::error::CommsError;
use crate::host::Host;
use crate::server::{decode_request, unary, CallContext, Reply, Server, Service};

#[async_trait]
pub trait NodeHandler: Send + Sync + 'static {
    async fn ask_online(&self, ip: SocketAddr) -> Result<Ack, Status>;
    async fn create_new_round(&self, round: RoundInfo, auth: &Auth) -> Result<Ack, Status>;
    async fn post_new_batch(&self, batch: Batch, auth: &Auth) -> Result<Ack, Status>;
    async fn post_phase(&self, batch: Batch, auth: &Auth) -> Result<Ack, Status>;
    async fn round_error(&self, error: RoundError, auth: &Auth) -> Result<Ack, Status>;
}

/// Handler with no capabilities. Every call is answered `Unimplemented`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnimplementedNode;

#[async_trait]
impl NodeHandler for UnimplementedNode {
    async fn ask_online(&self, _ip: SocketAddr) -> Result<Ack, Status> {
        unimplemented_call(methods::NODE_ASK_ONLINE)
    }
    async fn create_new_round(&self, _round: RoundInfo, _auth: &Auth) -> Result<Ack, Status> {
        unimplemented_call(methods::NODE_CREATE_NEW_ROUND)
    }
    async fn post_new_batch(&self, _batch: Batch, _auth: &Auth) -> Result<Ack, Status> {
        unimplemented_call(methods::NODE_POST_NEW_BATCH)
    }
    async fn post_phase(&self, _batch: Batch, _auth: &Auth) -> Result<Ack, Status> {
        unimplemented_call(methods::NODE_POST_PHASE)
    }
    async fn round_error(&self, _error: RoundError, _auth: &Auth) -> Result<Ack, Status> {
        unimplemented_call(methods::NODE_ROUND_ERROR)
    }
}

fn unimplemented_call<T>(method: &str) -> Result<T, Status> {
    warn!(method, "node handler not implemented");
    Err(Status::unimplemented(method))
}

/// Node endpoint: handshake plus the node capability set.
pub struct NodeComms<H> {
    comms: Comms,
    handler: H,
}

impl<H: NodeHandler> NodeComms<H> {
    pub fn new(comms: Comms, handler: H) -> Self {
        Self { comms, handler }
    }

    pub async fn serve(self, address: &str, tls: Option<TlsIdentity>) -> Result<Server, CommsError> {
        Server::start(address, tls, Arc::new(self)).await
    }
}

#[async_trait]
impl<H: NodeHandler> Service for NodeComms<H> {
    async fn call(&self, method: &str, ctx: CallContext, payload: Vec<u8>) -> Result<Reply, Status> {
        if let Some(reply) = self.comms.serve_handshake(method, &payload) {
            return reply;
        }
        match method {
            methods::NODE_ASK_ONLINE => {
                decode_request::<Ping>(&payload)?;
                unary(&self.handler.ask_online(ctx.peer_addr).await?)
            }
            methods::NODE_CREATE_NEW_ROUND => {
                let (round, auth) = self.comms.open_authenticated(&payload)?;
                unary(&self.handler.create_new_round(round, &auth).await?)
            }
            methods::NODE_POST_NEW_BATCH => {
                let (batch, auth) = self.comms.open_authenticated(&payload)?;
                unary(&self.handler.post_new_batch(batch, &auth).await?)
            }
            methods::NODE_POST_PHASE => {
                let (batch, auth) = self.comms.open_authenticated(&payload)?;
                unary(&self.handler.post_phase(batch, &auth).await?)
            }
            methods::NODE_ROUND_ERROR => {
                let (error, auth) = self.comms.open_authenticated(&payload)?;
                unary(&self.handler.round_error(error, &auth).await?)
            }
            other => Err(Status::unimplemented(other)),
        }
    }
}

impl Comms {
    /// Liveness check. Retried.
    pub async fn send_ask_online(&self, host: &Arc<Host>) -> Result<Ack, CommsError> {
        let peer = host.id();
        self.send_with_retry(host, |conn| async move {
            call_unary(conn.as_ref(), peer, methods::NODE_ASK_ONLINE, &Ping {}).await
        })
        .await
    }

    pub async fn send_create_new_round(
        &self,
        host: &Arc<Host>,
        round: &RoundInfo,
    ) -> Result<Ack, CommsError> {
        self.send_authenticated(host, methods::NODE_CREATE_NEW_ROUND, round, false)
            .await
    }

    pub async fn send_post_new_batch(&self, host: &Arc<Host>, batch: &Batch) -> Result<Ack, CommsError> {
        self.send_authenticated(host, methods::NODE_POST_NEW_BATCH, batch, false)
            .await
    }

    /// Idempotent; retried.
    pub async fn send_post_phase(&self, host: &Arc<Host>, batch: &Batch) -> Result<Ack, CommsError> {
        self.send_authenticated(host, methods::NODE_POST_PHASE, batch, true)
            .await
    }

    pub async fn send_round_error(
        &self,
        host: &Arc<Host>,
        error: &RoundError,
    ) -> Result<Ack, CommsError> {
        self.send_authenticated(host, methods::NODE_ROUND_ERROR, error, false)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::host::HostParams;
    use crate::testutil::{auth_params, fast_params, new_comms, register_peer};
    use mix_core::{PeerId, StatusCode};
    use parking_lot::Mutex;

    /// Accepts everything and remembers who the last authenticated caller was.
    #[derive(Default)]
    struct Recorder {
        last_sender: Mutex<Option<PeerId>>,
        rounds: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl NodeHandler for Arc<Recorder> {
        async fn ask_online(&self, _ip: SocketAddr) -> Result<Ack, Status> {
            Ok(Ack::default())
        }
        async fn create_new_round(&self, round: RoundInfo, auth: &Auth) -> Result<Ack, Status> {
            assert!(auth.is_authenticated);
            *self.last_sender.lock() = auth.sender_id();
            self.rounds.lock().push(round.id);
            Ok(Ack::default())
        }
        async fn post_new_batch(&self, _batch: Batch, _auth: &Auth) -> Result<Ack, Status> {
            Ok(Ack::default())
        }
        async fn post_phase(&self, batch: Batch, auth: &Auth) -> Result<Ack, Status> {
            *self.last_sender.lock() = auth.sender_id();
            Ok(Ack {
                error: format!("{} slots", batch.slots.len()),
            })
        }
        async fn round_error(&self, _error: RoundError, _auth: &Auth) -> Result<Ack, Status> {
            Ok(Ack::default())
        }
    }

    async fn pair(a_params: HostParams) -> (Comms, Comms, Arc<Host>, Arc<Recorder>, Server) {
        let a = new_comms();
        let b = new_comms();
        let recorder = Arc::new(Recorder::default());
        let server = NodeComms::new(b.clone(), recorder.clone())
            .serve("127.0.0.1:0", None)
            .await
            .unwrap();
        register_peer(&b, &a, "127.0.0.1:1", fast_params());
        let host_b = register_peer(&a, &b, &server.local_addr().to_string(), a_params);
        (a, b, host_b, recorder, server)
    }

    #[tokio::test]
    async fn unauthenticated_then_handshake_then_success() {
        let (a, _b, host_b, recorder, _server) = pair(fast_params()).await;
        let round = RoundInfo {
            id: 12,
            ..RoundInfo::default()
        };

        let err = a.send_create_new_round(&host_b, &round).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert!(recorder.rounds.lock().is_empty());

        a.client_handshake(&host_b).await.unwrap();
        a.send_create_new_round(&host_b, &round).await.unwrap();
        assert_eq!(*recorder.rounds.lock(), vec![12]);
        assert_eq!(*recorder.last_sender.lock(), Some(a.id()));
    }

    #[tokio::test]
    async fn auth_enabled_host_handshakes_on_first_call() {
        let (a, _b, host_b, recorder, _server) = pair(auth_params()).await;
        assert!(!host_b.is_authenticated());
        let batch = Batch {
            slots: vec![Default::default(); 3],
            ..Batch::default()
        };
        let ack = a.send_post_phase(&host_b, &batch).await.unwrap();
        assert_eq!(ack.error, "3 slots");
        assert!(host_b.is_authenticated());
        assert_eq!(*recorder.last_sender.lock(), Some(a.id()));
    }

    #[tokio::test]
    async fn rejected_token_forces_rehandshake() {
        let (a, b, host_b, recorder, _server) = pair(auth_params()).await;
        a.send_create_new_round(&host_b, &RoundInfo::default())
            .await
            .unwrap();
        let first = host_b.transmission_token();

        // B forgets the token; A's next call is rejected and resets A's state.
        assert!(b.tokens().revoke(&first));
        let err = a
            .send_create_new_round(&host_b, &RoundInfo::default())
            .await
            .unwrap_err();
        assert!(err.is_remote_unauthenticated());
        assert!(!host_b.is_authenticated());

        a.send_create_new_round(&host_b, &RoundInfo { id: 2, ..RoundInfo::default() })
            .await
            .unwrap();
        assert_ne!(host_b.transmission_token(), first);
        assert_eq!(*recorder.rounds.lock(), vec![0, 2]);
    }

    #[tokio::test]
    async fn ask_online_needs_no_auth() {
        let (a, _b, host_b, _recorder, _server) = pair(fast_params()).await;
        assert!(a.send_ask_online(&host_b).await.is_ok());
        assert!(!host_b.is_authenticated());
    }

    #[tokio::test]
    async fn unimplemented_handler_answers_unimplemented() {
        let a = new_comms();
        let b = new_comms();
        let server = crate::testutil::start_node(&b).await;
        let host_b = register_peer(&a, &b, &server.local_addr().to_string(), fast_params());
        let err = a.send_ask_online(&host_b).await.unwrap_err();
        match err {
            CommsError::Remote { status, .. } => assert_eq!(status.code, StatusCode::Unimplemented),
            other => panic!("unexpected {:?}", other),
        }
    }
}
