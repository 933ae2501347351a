//! Registration role: user and node registration, client version, network definition polling.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use mix_core::messages::{
    Ack, ClientVersion, Ndf, NdfHash, NodeRegistration, Ping, UserRegistration,
    UserRegistrationConfirmation,
};
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
pub trait RegistrationHandler: Send + Sync + 'static {
    async fn register_user(
        &self,
        request: UserRegistration,
    ) -> Result<UserRegistrationConfirmation, Status>;
    async fn register_node(&self, request: NodeRegistration, ip: SocketAddr) -> Result<Ack, Status>;
    async fn get_current_client_version(&self) -> Result<ClientVersion, Status>;
    /// The caller must be a registered host. `auth` tells whether it also holds a confirmed token.
    async fn poll_ndf(&self, hash: NdfHash, auth: &Auth) -> Result<Ndf, Status>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UnimplementedRegistration;

#[async_trait]
impl RegistrationHandler for UnimplementedRegistration {
    async fn register_user(
        &self,
        _: UserRegistration,
    ) -> Result<UserRegistrationConfirmation, Status> {
        unimplemented_call(methods::REGISTRATION_REGISTER_USER)
    }
    async fn register_node(&self, _: NodeRegistration, _: SocketAddr) -> Result<Ack, Status> {
        unimplemented_call(methods::REGISTRATION_REGISTER_NODE)
    }
    async fn get_current_client_version(&self) -> Result<ClientVersion, Status> {
        unimplemented_call(methods::REGISTRATION_CLIENT_VERSION)
    }
    async fn poll_ndf(&self, _: NdfHash, _: &Auth) -> Result<Ndf, Status> {
        unimplemented_call(methods::REGISTRATION_POLL_NDF)
    }
}

fn unimplemented_call<T>(method: &str) -> Result<T, Status> {
    warn!(method, "registration handler not implemented");
    Err(Status::unimplemented(method))
}

pub struct RegistrationComms<H> {
    comms: Comms,
    handler: H,
}

impl<H: RegistrationHandler> RegistrationComms<H> {
    pub fn new(comms: Comms, handler: H) -> Self {
        Self { comms, handler }
    }

    pub async fn serve(self, address: &str, tls: Option<TlsIdentity>) -> Result<Server, CommsError> {
        Server::start(address, tls, Arc::new(self)).await
    }
}

#[async_trait]
impl<H: RegistrationHandler> Service for RegistrationComms<H> {
    async fn call(&self, method: &str, ctx: CallContext, payload: Vec<u8>) -> Result<Reply, Status> {
        if let Some(reply) = self.comms.serve_handshake(method, &payload) {
            return reply;
        }
        match method {
            methods::REGISTRATION_REGISTER_USER => {
                unary(&self.handler.register_user(decode_request(&payload)?).await?)
            }
            methods::REGISTRATION_REGISTER_NODE => unary(
                &self
                    .handler
                    .register_node(decode_request(&payload)?, ctx.peer_addr)
                    .await?,
            ),
            methods::REGISTRATION_CLIENT_VERSION => {
                decode_request::<Ping>(&payload)?;
                unary(&self.handler.get_current_client_version().await?)
            }
            methods::REGISTRATION_POLL_NDF => {
                let (hash, auth) = self.comms.open_envelope(&payload)?;
                unary(&self.handler.poll_ndf(hash, &auth).await?)
            }
            other => Err(Status::unimplemented(other)),
        }
    }
}

impl Comms {
    pub async fn send_register_user(
        &self,
        host: &Arc<Host>,
        request: &UserRegistration,
    ) -> Result<UserRegistrationConfirmation, CommsError> {
        let peer = host.id();
        self.send(host, |conn| async move {
            call_unary(conn.as_ref(), peer, methods::REGISTRATION_REGISTER_USER, request).await
        })
        .await
    }

    pub async fn send_register_node(
        &self,
        host: &Arc<Host>,
        request: &NodeRegistration,
    ) -> Result<Ack, CommsError> {
        let peer = host.id();
        self.send(host, |conn| async move {
            call_unary(conn.as_ref(), peer, methods::REGISTRATION_REGISTER_NODE, request).await
        })
        .await
    }

    /// Retried.
    pub async fn send_get_current_client_version(
        &self,
        host: &Arc<Host>,
    ) -> Result<ClientVersion, CommsError> {
        let peer = host.id();
        self.send_with_retry(host, |conn| async move {
            call_unary(conn.as_ref(), peer, methods::REGISTRATION_CLIENT_VERSION, &Ping {}).await
        })
        .await
    }

    /// Retried.
    pub async fn send_poll_ndf(&self, host: &Arc<Host>, hash: &NdfHash) -> Result<Ndf, CommsError> {
        self.send_authenticated(host, methods::REGISTRATION_POLL_NDF, hash, true)
            .await
    }
}
