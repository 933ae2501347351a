//! Authenticated transport for mix-network roles.
//! Host registry with lazy per-host connections, token handshake, dispatcher with deadlines and
//! retry, chunked server streams, and the role endpoints built on them: gateway, node,
//! registration, notification bot and user discovery.

pub mod auth;
pub mod comms;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod framing;
pub mod gateway;
pub mod host;
pub mod node;
pub mod notification;
pub mod registration;
pub mod registry;
pub mod server;
pub mod stream;
pub mod udb;

#[cfg(test)]
pub(crate) mod testutil;

pub use auth::{Auth, AuthError};
pub use comms::Comms;
pub use config::{CommsConfig, ConfigError, HostConfig};
pub use connection::{Binding, Connection, ConnectionState, ServerStream, TlsIdentity, TransportError};
pub use dispatch::{call_unary, open_stream, StreamHandle, MAX_SEND_ATTEMPTS};
pub use error::{CommsError, ErrorKind};
pub use gateway::{GatewayComms, GatewayHandler, UnimplementedGateway};
pub use host::{AuthState, Host, HostParams};
pub use node::{NodeComms, NodeHandler, UnimplementedNode};
pub use notification::{NotificationComms, NotificationHandler, UnimplementedNotification};
pub use registration::{RegistrationComms, RegistrationHandler, UnimplementedRegistration};
pub use registry::HostRegistry;
pub use server::{CallContext, Reply, Server, Service};
pub use stream::receive_chunked;
pub use udb::{UdbComms, UdbHandler, UnimplementedUdb};
