//! Comms wire protocol: frame types, call status, metadata and method names.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Header metadata sent with requests and at the start of a server stream.
pub type Metadata = BTreeMap<String, String>;

/// All wire frame types. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Start a call. `payload` is the bincode of the request message or of an envelope.
    Request {
        call_id: u64,
        method: String,
        metadata: Metadata,
        payload: Vec<u8>,
    },
    /// Unary reply.
    Response { call_id: u64, payload: Vec<u8> },
    /// First frame of a server stream.
    Header { call_id: u64, metadata: Metadata },
    /// One frame of a server stream.
    Chunk { call_id: u64, data: Vec<u8> },
    /// Normal end of a server stream.
    End { call_id: u64 },
    /// Call failed. Terminates a unary call or a stream.
    Status { call_id: u64, status: Status },
}

impl Frame {
    pub fn call_id(&self) -> u64 {
        match self {
            Frame::Request { call_id, .. }
            | Frame::Response { call_id, .. }
            | Frame::Header { call_id, .. }
            | Frame::Chunk { call_id, .. }
            | Frame::End { call_id }
            | Frame::Status { call_id, .. } => *call_id,
        }
    }
}

/// Status codes a remote end can fail a call with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    PermissionDenied,
    Unauthenticated,
    Unimplemented,
    Unavailable,
    Internal,
}

/// Error result of a remote call, as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unauthenticated, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, message)
    }

    pub fn unimplemented(method: &str) -> Self {
        Self::new(StatusCode::Unimplemented, format!("unimplemented: {}", method))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, message)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for Status {}

/// Method names. Every role serves the generic handshake pair.
pub mod methods {
    pub const REQUEST_TOKEN: &str = "/messages.Generic/RequestToken";
    pub const AUTHENTICATE_TOKEN: &str = "/messages.Generic/AuthenticateToken";

    pub const GATEWAY_CHECK_MESSAGES: &str = "/mixmessages.Gateway/CheckMessages";
    pub const GATEWAY_GET_MESSAGE: &str = "/mixmessages.Gateway/GetMessage";
    pub const GATEWAY_PUT_MESSAGE: &str = "/mixmessages.Gateway/PutMessage";
    pub const GATEWAY_REQUEST_NONCE: &str = "/mixmessages.Gateway/RequestNonce";
    pub const GATEWAY_CONFIRM_NONCE: &str = "/mixmessages.Gateway/ConfirmNonce";
    pub const GATEWAY_POLL_FOR_NOTIFICATIONS: &str = "/mixmessages.Gateway/PollForNotifications";
    pub const GATEWAY_POLL: &str = "/mixmessages.Gateway/Poll";

    pub const NODE_ASK_ONLINE: &str = "/mixmessages.Node/AskOnline";
    pub const NODE_CREATE_NEW_ROUND: &str = "/mixmessages.Node/CreateNewRound";
    pub const NODE_POST_NEW_BATCH: &str = "/mixmessages.Node/PostNewBatch";
    pub const NODE_POST_PHASE: &str = "/mixmessages.Node/PostPhase";
    pub const NODE_ROUND_ERROR: &str = "/mixmessages.Node/RoundError";

    pub const REGISTRATION_REGISTER_USER: &str = "/mixmessages.Registration/RegisterUser";
    pub const REGISTRATION_REGISTER_NODE: &str = "/mixmessages.Registration/RegisterNode";
    pub const REGISTRATION_CLIENT_VERSION: &str =
        "/mixmessages.Registration/GetCurrentClientVersion";
    pub const REGISTRATION_POLL_NDF: &str = "/mixmessages.Registration/PollNdf";

    pub const NOTIFICATION_REGISTER: &str = "/mixmessages.NotificationBot/RegisterForNotifications";
    pub const NOTIFICATION_UNREGISTER: &str =
        "/mixmessages.NotificationBot/UnregisterForNotifications";

    pub const UDB_REGISTER_USER: &str = "/mixmessages.UDB/RegisterUser";
    pub const UDB_REGISTER_FACT: &str = "/mixmessages.UDB/RegisterFact";
    pub const UDB_CONFIRM_FACT: &str = "/mixmessages.UDB/ConfirmFact";
    pub const UDB_REMOVE_FACT: &str = "/mixmessages.UDB/RemoveFact";
}
