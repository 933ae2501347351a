//! Gateway role: client message queue, nonce registration, notification polling and the
//! unified poll, whose response is streamed in chunks.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use mix_core::chunk::{assemble_chunks_into_response, split_response};
use mix_core::messages::{
    Ack, ClientRequest, GatewayPoll, GatewayPollResponse, IdList, Nonce, NonceRequest, Ping,
    RegistrationConfirmation, RequestRegistrationConfirmation, Slot, UserIdList,
};
use mix_core::protocol::methods;
use mix_core::Status;
use tracing::{debug, warn};

use crate::auth::Auth;
use crate::comms::Comms;
use crate::connection::TlsIdentity;
use crate::dispatch::{call_unary, open_stream};
use crate::error::CommsError;
use crate::host::Host;
use crate::server::{decode_request, unary, CallContext, Reply, Server, Service};
use crate::stream::receive_chunked;

#[async_trait]
pub trait GatewayHandler: Send + Sync + 'static {
    async fn check_messages(&self, request: ClientRequest, ip: SocketAddr) -> Result<IdList, Status>;
    async fn get_message(&self, request: ClientRequest, ip: SocketAddr) -> Result<Slot, Status>;
    async fn put_message(&self, slot: Slot, ip: SocketAddr) -> Result<Ack, Status>;
    async fn request_nonce(&self, request: NonceRequest, ip: SocketAddr) -> Result<Nonce, Status>;
    async fn confirm_nonce(
        &self,
        request: RequestRegistrationConfirmation,
        ip: SocketAddr,
    ) -> Result<RegistrationConfirmation, Status>;
    /// Only authenticated notification bots should be answered; the handler decides.
    async fn poll_for_notifications(&self, auth: &Auth) -> Result<UserIdList, Status>;
    async fn poll(&self, request: GatewayPoll, ip: SocketAddr) -> Result<GatewayPollResponse, Status>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UnimplementedGateway;

#[async_trait]
impl GatewayHandler for UnimplementedGateway {
    async fn check_messages(&self, _: ClientRequest, _: SocketAddr) -> Result<IdList, Status> {
        unimplemented_call(methods::GATEWAY_CHECK_MESSAGES)
    }
    async fn get_message(&self, _: ClientRequest, _: SocketAddr) -> Result<Slot, Status> {
        unimplemented_call(methods::GATEWAY_GET_MESSAGE)
    }
    async fn put_message(&self, _: Slot, _: SocketAddr) -> Result<Ack, Status> {
        unimplemented_call(methods::GATEWAY_PUT_MESSAGE)
    }
    async fn request_nonce(&self, _: NonceRequest, _: SocketAddr) -> Result<Nonce, Status> {
        unimplemented_call(methods::GATEWAY_REQUEST_NONCE)
    }
    async fn confirm_nonce(
        &self,
        _: RequestRegistrationConfirmation,
        _: SocketAddr,
    ) -> Result<RegistrationConfirmation, Status> {
        unimplemented_call(methods::GATEWAY_CONFIRM_NONCE)
    }
    async fn poll_for_notifications(&self, _: &Auth) -> Result<UserIdList, Status> {
        unimplemented_call(methods::GATEWAY_POLL_FOR_NOTIFICATIONS)
    }
    async fn poll(&self, _: GatewayPoll, _: SocketAddr) -> Result<GatewayPollResponse, Status> {
        unimplemented_call(methods::GATEWAY_POLL)
    }
}

fn unimplemented_call<T>(method: &str) -> Result<T, Status> {
    warn!(method, "gateway handler not implemented");
    Err(Status::unimplemented(method))
}

pub struct GatewayComms<H> {
    comms: Comms,
    handler: H,
}

impl<H: GatewayHandler> GatewayComms<H> {
    pub fn new(comms: Comms, handler: H) -> Self {
        Self { comms, handler }
    }

    pub async fn serve(self, address: &str, tls: Option<TlsIdentity>) -> Result<Server, CommsError> {
        Server::start(address, tls, Arc::new(self)).await
    }
}

#[async_trait]
impl<H: GatewayHandler> Service for GatewayComms<H> {
    async fn call(&self, method: &str, ctx: CallContext, payload: Vec<u8>) -> Result<Reply, Status> {
        if let Some(reply) = self.comms.serve_handshake(method, &payload) {
            return reply;
        }
        let ip = ctx.peer_addr;
        match method {
            methods::GATEWAY_CHECK_MESSAGES => {
                unary(&self.handler.check_messages(decode_request(&payload)?, ip).await?)
            }
            methods::GATEWAY_GET_MESSAGE => {
                unary(&self.handler.get_message(decode_request(&payload)?, ip).await?)
            }
            methods::GATEWAY_PUT_MESSAGE => {
                unary(&self.handler.put_message(decode_request(&payload)?, ip).await?)
            }
            methods::GATEWAY_REQUEST_NONCE => {
                unary(&self.handler.request_nonce(decode_request(&payload)?, ip).await?)
            }
            methods::GATEWAY_CONFIRM_NONCE => {
                unary(&self.handler.confirm_nonce(decode_request(&payload)?, ip).await?)
            }
            methods::GATEWAY_POLL_FOR_NOTIFICATIONS => {
                let (_, auth): (Ping, _) = self.comms.open_envelope(&payload)?;
                unary(&self.handler.poll_for_notifications(&auth).await?)
            }
            methods::GATEWAY_POLL => {
                let response = self.handler.poll(decode_request(&payload)?, ip).await?;
                let chunks = split_response(&response, self.comms.chunk_size())
                    .map_err(|e| Status::internal(e.to_string()))?;
                debug!(%ip, chunks = chunks.len(), "streaming poll response");
                Ok(Reply::chunked(chunks))
            }
            other => Err(Status::unimplemented(other)),
        }
    }
}

impl Comms {
    pub async fn send_check_messages(
        &self,
        host: &Arc<Host>,
        request: &ClientRequest,
    ) -> Result<IdList, CommsError> {
        let peer = host.id();
        self.send(host, |conn| async move {
            call_unary(conn.as_ref(), peer, methods::GATEWAY_CHECK_MESSAGES, request).await
        })
        .await
    }

    pub async fn send_get_message(
        &self,
        host: &Arc<Host>,
        request: &ClientRequest,
    ) -> Result<Slot, CommsError> {
        let peer = host.id();
        self.send(host, |conn| async move {
            call_unary(conn.as_ref(), peer, methods::GATEWAY_GET_MESSAGE, request).await
        })
        .await
    }

    pub async fn send_put_message(&self, host: &Arc<Host>, slot: &Slot) -> Result<Ack, CommsError> {
        let peer = host.id();
        self.send(host, |conn| async move {
            call_unary(conn.as_ref(), peer, methods::GATEWAY_PUT_MESSAGE, slot).await
        })
        .await
    }

    pub async fn send_request_nonce(
        &self,
        host: &Arc<Host>,
        request: &NonceRequest,
    ) -> Result<Nonce, CommsError> {
        let peer = host.id();
        self.send(host, |conn| async move {
            call_unary(conn.as_ref(), peer, methods::GATEWAY_REQUEST_NONCE, request).await
        })
        .await
    }

    pub async fn send_confirm_nonce(
        &self,
        host: &Arc<Host>,
        request: &RequestRegistrationConfirmation,
    ) -> Result<RegistrationConfirmation, CommsError> {
        let peer = host.id();
        self.send(host, |conn| async move {
            call_unary(conn.as_ref(), peer, methods::GATEWAY_CONFIRM_NONCE, request).await
        })
        .await
    }

    /// Notification bots only. Retried.
    pub async fn send_poll_for_notifications(&self, host: &Arc<Host>) -> Result<UserIdList, CommsError> {
        self.send_authenticated(host, methods::GATEWAY_POLL_FOR_NOTIFICATIONS, &Ping {}, true)
            .await
    }

    /// Unified poll. The response arrives as a chunked stream and is reassembled here.
    pub async fn send_poll(
        &self,
        host: &Arc<Host>,
        request: &GatewayPoll,
    ) -> Result<GatewayPollResponse, CommsError> {
        let peer = host.id();
        let mut stream = self
            .stream(host, methods::GATEWAY_POLL, |conn| async move {
                open_stream(conn.as_ref(), peer, methods::GATEWAY_POLL, request).await
            })
            .await?;
        receive_chunked(&mut stream, assemble_chunks_into_response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Binding;
    use crate::error::ErrorKind;
    use crate::testutil::{auth_params, fast_params, new_comms, register_peer};
    use mix_core::messages::RoundInfo;
    use mix_core::{Keypair, StatusCode};

    /// Echoes requests back in its replies.
    struct Mirror;

    #[async_trait]
    impl GatewayHandler for Mirror {
        async fn check_messages(&self, request: ClientRequest, _: SocketAddr) -> Result<IdList, Status> {
            Ok(IdList {
                ids: vec![request.last_message_id],
            })
        }
        async fn get_message(&self, request: ClientRequest, _: SocketAddr) -> Result<Slot, Status> {
            Ok(Slot {
                sender_id: request.user_id,
                ..Slot::default()
            })
        }
        async fn put_message(&self, slot: Slot, ip: SocketAddr) -> Result<Ack, Status> {
            assert!(ip.ip().is_loopback());
            Ok(Ack {
                error: format!("slot {}", slot.index),
            })
        }
        async fn request_nonce(&self, request: NonceRequest, _: SocketAddr) -> Result<Nonce, Status> {
            Ok(Nonce {
                nonce: request.salt,
                dh_public_key: Vec::new(),
            })
        }
        async fn confirm_nonce(
            &self,
            request: RequestRegistrationConfirmation,
            _: SocketAddr,
        ) -> Result<RegistrationConfirmation, Status> {
            Ok(RegistrationConfirmation {
                client_signed_by_server: request.nonce_signed_by_client,
                client_gateway_key: Vec::new(),
            })
        }
        async fn poll_for_notifications(&self, auth: &Auth) -> Result<UserIdList, Status> {
            if !auth.is_authenticated {
                return Err(Status::unauthenticated("notification bot only"));
            }
            Ok(UserIdList {
                ids: vec![b"user-1".to_vec()],
            })
        }
        async fn poll(&self, request: GatewayPoll, _: SocketAddr) -> Result<GatewayPollResponse, Status> {
            Ok(GatewayPollResponse {
                updates: (0..request.last_update)
                    .map(|id| RoundInfo {
                        id,
                        topology: vec![vec![0xab; 32]; 4],
                        batch_size: 8,
                    })
                    .collect(),
                message_ids: vec![request.last_message_id],
                ..GatewayPollResponse::default()
            })
        }
    }

    async fn gateway(chunk_size: usize) -> (Comms, Server) {
        let comms = Comms::with_settings(Keypair::generate(), mix_core::DEFAULT_TOKEN_TTL, chunk_size);
        let server = GatewayComms::new(comms.clone(), Mirror)
            .serve("127.0.0.1:0", None)
            .await
            .unwrap();
        (comms, server)
    }

    #[tokio::test]
    async fn unary_calls_reach_handler() {
        let (gw, server) = gateway(1024).await;
        let client = new_comms();
        let host = register_peer(&client, &gw, &server.local_addr().to_string(), fast_params());
        let ids = client
            .send_check_messages(
                &host,
                &ClientRequest {
                    user_id: vec![1],
                    last_message_id: "m-9".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(ids.ids, vec!["m-9".to_string()]);
        let ack = client
            .send_put_message(&host, &Slot { index: 4, ..Slot::default() })
            .await
            .unwrap();
        assert_eq!(ack.error, "slot 4");
        let nonce = client
            .send_request_nonce(&host, &NonceRequest { salt: vec![7; 8], ..NonceRequest::default() })
            .await
            .unwrap();
        assert_eq!(nonce.nonce, vec![7; 8]);
    }

    #[tokio::test]
    async fn poll_is_chunked_and_reassembled() {
        let (gw, server) = gateway(128).await;
        let client = new_comms();
        for binding in [Binding::Native, Binding::Web] {
            let mut params = fast_params();
            params.binding = binding;
            let host = register_peer(&client, &gw, &server.local_addr().to_string(), params);
            let request = GatewayPoll {
                last_update: 30,
                last_message_id: "last".into(),
                ..GatewayPoll::default()
            };
            let response = client.send_poll(&host, &request).await.unwrap();
            assert_eq!(response.updates.len(), 30);
            assert_eq!(response.updates[29].id, 29);
            assert_eq!(response.message_ids, vec!["last".to_string()]);
        }
    }

    #[tokio::test]
    async fn notifications_need_a_handshake() {
        let (gw, server) = gateway(1024).await;
        let bot = new_comms();
        register_peer(&gw, &bot, "127.0.0.1:1", fast_params());

        let anonymous = register_peer(&bot, &gw, &server.local_addr().to_string(), fast_params());
        let err = bot.send_poll_for_notifications(&anonymous).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);

        let trusted = register_peer(&bot, &gw, &server.local_addr().to_string(), auth_params());
        let users = bot.send_poll_for_notifications(&trusted).await.unwrap();
        assert_eq!(users.ids, vec![b"user-1".to_vec()]);
    }

    #[tokio::test]
    async fn unimplemented_gateway_answers_unimplemented() {
        let comms = new_comms();
        let server = GatewayComms::new(comms.clone(), UnimplementedGateway)
            .serve("127.0.0.1:0", None)
            .await
            .unwrap();
        let client = new_comms();
        let host = register_peer(&client, &comms, &server.local_addr().to_string(), fast_params());
        let err = client
            .send_poll(&host, &GatewayPoll::default())
            .await
            .unwrap_err();
        match err {
            CommsError::Remote { status, .. } => assert_eq!(status.code, StatusCode::Unimplemented),
            other => panic!("unexpected {:?}", other),
        }
    }
}
