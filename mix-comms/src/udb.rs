//! User discovery role: user registration and the facts (usernames, emails) users attach to
//! their identity. Every call is an envelope; handlers decide what an unauthenticated sender
//! may do.

use std::sync::Arc;

use async_trait::async_trait;
use mix_core::messages::{
    Ack, FactConfirmRequest, FactRegisterRequest, FactRegisterResponse, FactRemovalRequest,
    UdbUserRegistration,
};
use mix_core::protocol::methods;
use mix_core::Status;
use tracing::warn;

use crate::auth::Auth;
use crate::comms::Comms;
use crate::connection::TlsIdentity;
use crate::error::CommsError;
use crate::host::Host;
use crate::server::{unary, CallContext, Reply, Server, Service};

#[async_trait]
pub trait UdbHandler: Send + Sync + 'static {
    async fn register_user(&self, request: UdbUserRegistration, auth: &Auth) -> Result<Ack, Status>;
    async fn register_fact(
        &self,
        request: FactRegisterRequest,
        auth: &Auth,
    ) -> Result<FactRegisterResponse, Status>;
    async fn confirm_fact(&self, request: FactConfirmRequest, auth: &Auth) -> Result<Ack, Status>;
    async fn remove_fact(&self, request: FactRemovalRequest, auth: &Auth) -> Result<Ack, Status>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UnimplementedUdb;

#[async_trait]
impl UdbHandler for UnimplementedUdb {
    async fn register_user(&self, _: UdbUserRegistration, _: &Auth) -> Result<Ack, Status> {
        unimplemented_call(methods::UDB_REGISTER_USER)
    }
    async fn register_fact(
        &self,
        _: FactRegisterRequest,
        _: &Auth,
    ) -> Result<FactRegisterResponse, Status> {
        unimplemented_call(methods::UDB_REGISTER_FACT)
    }
    async fn confirm_fact(&self, _: FactConfirmRequest, _: &Auth) -> Result<Ack, Status> {
        unimplemented_call(methods::UDB_CONFIRM_FACT)
    }
    async fn remove_fact(&self, _: FactRemovalRequest, _: &Auth) -> Result<Ack, Status> {
        unimplemented_call(methods::UDB_REMOVE_FACT)
    }
}

fn unimplemented_call<T>(method: &str) -> Result<T, Status> {
    warn!(method, "user discovery handler not implemented");
    Err(Status::unimplemented(method))
}

pub struct UdbComms<H> {
    comms: Comms,
    handler: H,
}

impl<H: UdbHandler> UdbComms<H> {
    pub fn new(comms: Comms, handler: H) -> Self {
        Self { comms, handler }
    }

    pub async fn serve(self, address: &str, tls: Option<TlsIdentity>) -> Result<Server, CommsError> {
        Server::start(address, tls, Arc::new(self)).await
    }
}

#[async_trait]
impl<H: UdbHandler> Service for UdbComms<H> {
    async fn call(&self, method: &str, _ctx: CallContext, payload: Vec<u8>) -> Result<Reply, Status> {
        if let Some(reply) = self.comms.serve_handshake(method, &payload) {
            return reply;
        }
        match method {
            methods::UDB_REGISTER_USER => {
                let (request, auth) = self.comms.open_envelope(&payload)?;
                unary(&self.handler.register_user(request, &auth).await?)
            }
            methods::UDB_REGISTER_FACT => {
                let (request, auth) = self.comms.open_envelope(&payload)?;
                unary(&self.handler.register_fact(request, &auth).await?)
            }
            methods::UDB_CONFIRM_FACT => {
                let (request, auth) = self.comms.open_envelope(&payload)?;
                unary(&self.handler.confirm_fact(request, &auth).await?)
            }
            methods::UDB_REMOVE_FACT => {
                let (request, auth) = self.comms.open_envelope(&payload)?;
                unary(&self.handler.remove_fact(request, &auth).await?)
            }
            other => Err(Status::unimplemented(other)),
        }
    }
}

impl Comms {
    pub async fn send_register_udb_user(
        &self,
        host: &Arc<Host>,
        request: &UdbUserRegistration,
    ) -> Result<Ack, CommsError> {
        self.send_authenticated(host, methods::UDB_REGISTER_USER, request, false)
            .await
    }

    pub async fn send_register_fact(
        &self,
        host: &Arc<Host>,
        request: &FactRegisterRequest,
    ) -> Result<FactRegisterResponse, CommsError> {
        self.send_authenticated(host, methods::UDB_REGISTER_FACT, request, false)
            .await
    }

    pub async fn send_confirm_fact(
        &self,
        host: &Arc<Host>,
        request: &FactConfirmRequest,
    ) -> Result<Ack, CommsError> {
        self.send_authenticated(host, methods::UDB_CONFIRM_FACT, request, false)
            .await
    }

    pub async fn send_remove_fact(
        &self,
        host: &Arc<Host>,
        request: &FactRemovalRequest,
    ) -> Result<Ack, CommsError> {
        self.send_authenticated(host, methods::UDB_REMOVE_FACT, request, false)
            .await
    }
}
