//! Notification bot role: clients register and unregister push tokens.

use std::sync::Arc;

use async_trait::async_trait;
use mix_core::messages::{Ack, NotificationToken, Ping};
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
pub trait NotificationHandler: Send + Sync + 'static {
    async fn register_for_notifications(
        &self,
        token: NotificationToken,
        auth: &Auth,
    ) -> Result<Ack, Status>;
    async fn unregister_for_notifications(&self, auth: &Auth) -> Result<Ack, Status>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UnimplementedNotification;

#[async_trait]
impl NotificationHandler for UnimplementedNotification {
    async fn register_for_notifications(
        &self,
        _: NotificationToken,
        _: &Auth,
    ) -> Result<Ack, Status> {
        warn!(method = methods::NOTIFICATION_REGISTER, "notification handler not implemented");
        Err(Status::unimplemented(methods::NOTIFICATION_REGISTER))
    }
    async fn unregister_for_notifications(&self, _: &Auth) -> Result<Ack, Status> {
        warn!(method = methods::NOTIFICATION_UNREGISTER, "notification handler not implemented");
        Err(Status::unimplemented(methods::NOTIFICATION_UNREGISTER))
    }
}

pub struct NotificationComms<H> {
    comms: Comms,
    handler: H,
}

impl<H: NotificationHandler> NotificationComms<H> {
    pub fn new(comms: Comms, handler: H) -> Self {
        Self { comms, handler }
    }

    pub async fn serve(self, address: &str, tls: Option<TlsIdentity>) -> Result<Server, CommsError> {
        Server::start(address, tls, Arc::new(self)).await
    }
}

#[async_trait]
impl<H: NotificationHandler> Service for NotificationComms<H> {
    async fn call(&self, method: &str, _ctx: CallContext, payload: Vec<u8>) -> Result<Reply, Status> {
        if let Some(reply) = self.comms.serve_handshake(method, &payload) {
            return reply;
        }
        match method {
            methods::NOTIFICATION_REGISTER => {
                let (token, auth) = self.comms.open_envelope(&payload)?;
                unary(&self.handler.register_for_notifications(token, &auth).await?)
            }
            methods::NOTIFICATION_UNREGISTER => {
                let (_, auth): (Ping, _) = self.comms.open_envelope(&payload)?;
                unary(&self.handler.unregister_for_notifications(&auth).await?)
            }
            other => Err(Status::unimplemented(other)),
        }
    }
}

impl Comms {
    pub async fn send_register_for_notifications(
        &self,
        host: &Arc<Host>,
        token: &NotificationToken,
    ) -> Result<Ack, CommsError> {
        self.send_authenticated(host, methods::NOTIFICATION_REGISTER, token, false)
            .await
    }

    pub async fn send_unregister_for_notifications(&self, host: &Arc<Host>) -> Result<Ack, CommsError> {
        self.send_authenticated(host, methods::NOTIFICATION_UNREGISTER, &Ping {}, false)
            .await
    }
}
