//! Message schemas carried by the role endpoints. Fields are opaque to the comms layer.

use serde::{Deserialize, Serialize};

use crate::envelope::Payload;

macro_rules! payload {
    ($($ty:ident => $tag:literal),* $(,)?) => {
        $(impl Payload for $ty {
            const TYPE_TAG: &'static str = $tag;
        })*
    };
}

/// Empty request (token issuance, liveness checks).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {}

/// Generic acknowledgement. An empty `error` means success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub error: String,
}

/// Token issued by `RequestToken`, echoed back signed to `AuthenticateToken`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignToken {
    pub token: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundInfo {
    pub id: u64,
    pub topology: Vec<Vec<u8>>,
    pub batch_size: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundError {
    pub id: u64,
    pub node_id: Vec<u8>,
    pub error: String,
}

/// A client's request to list or fetch queued messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub user_id: Vec<u8>,
    pub last_message_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdList {
    pub ids: Vec<String>,
}

/// One message slot in a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub index: u32,
    pub sender_id: Vec<u8>,
    pub payload_a: Vec<u8>,
    pub payload_b: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub round: RoundInfo,
    pub for_phase: i32,
    pub slots: Vec<Slot>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceRequest {
    pub salt: Vec<u8>,
    pub client_public_key: Vec<u8>,
    pub client_signature: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nonce {
    pub nonce: Vec<u8>,
    pub dh_public_key: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRegistrationConfirmation {
    pub user_id: Vec<u8>,
    pub nonce_signed_by_client: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationConfirmation {
    pub client_signed_by_server: Vec<u8>,
    pub client_gateway_key: Vec<u8>,
}

/// Gateway poll request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayPoll {
    pub client_id: Vec<u8>,
    pub last_update: u64,
    pub last_message_id: String,
}

/// Gateway poll response. Sent chunked; it can exceed one frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayPollResponse {
    pub updates: Vec<RoundInfo>,
    pub known_rounds: Vec<u8>,
    pub filters: Vec<u8>,
    pub message_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdList {
    pub ids: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRegistration {
    pub registration_code: String,
    pub client_public_key: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRegistrationConfirmation {
    pub client_signed_by_server: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRegistration {
    pub id: Vec<u8>,
    pub server_address: String,
    pub gateway_address: String,
    pub server_tls_cert: String,
    pub gateway_tls_cert: String,
    pub registration_code: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientVersion {
    pub version: String,
}

/// Hash of the network definition the caller already holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NdfHash {
    pub hash: Vec<u8>,
}

/// Network definition file, signed by the registration authority.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ndf {
    pub ndf: Vec<u8>,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationToken {
    pub token: String,
}

/// A typed, user-owned fact such as a username or an email address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fact {
    pub fact: String,
    pub fact_type: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub username: String,
    pub dh_public_key: Vec<u8>,
    pub salt: Vec<u8>,
}

/// User discovery registration, countersigned by the registration authority.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdbUserRegistration {
    pub permissioning_signature: Vec<u8>,
    pub rsa_public_pem: String,
    pub timestamp: i64,
    pub identity_registration: Identity,
    pub identity_signature: Vec<u8>,
    pub frs: FactRegisterRequest,
    pub uid: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactRegisterRequest {
    pub uid: Vec<u8>,
    pub fact: Fact,
    pub fact_sig: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactRegisterResponse {
    pub confirmation_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactConfirmRequest {
    pub confirmation_id: String,
    pub code: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactRemovalRequest {
    pub uid: Vec<u8>,
    pub removal_data: Fact,
}

payload! {
    Ping => "messages.Ping",
    Ack => "messages.Ack",
    AssignToken => "messages.AssignToken",
    RoundInfo => "mixmessages.RoundInfo",
    RoundError => "mixmessages.RoundError",
    ClientRequest => "mixmessages.ClientRequest",
    IdList => "mixmessages.IDList",
    Slot => "mixmessages.Slot",
    Batch => "mixmessages.Batch",
    NonceRequest => "mixmessages.NonceRequest",
    Nonce => "mixmessages.Nonce",
    RequestRegistrationConfirmation => "mixmessages.RequestRegistrationConfirmation",
    RegistrationConfirmation => "mixmessages.RegistrationConfirmation",
    GatewayPoll => "mixmessages.GatewayPoll",
    GatewayPollResponse => "mixmessages.GatewayPollResponse",
    UserIdList => "mixmessages.UserIdList",
    UserRegistration => "mixmessages.UserRegistration",
    UserRegistrationConfirmation => "mixmessages.UserRegistrationConfirmation",
    NodeRegistration => "mixmessages.NodeRegistration",
    ClientVersion => "mixmessages.ClientVersion",
    NdfHash => "mixmessages.NDFHash",
    Ndf => "mixmessages.NDF",
    NotificationToken => "mixmessages.NotificationToken",
    UdbUserRegistration => "mixmessages.UDBUserRegistration",
    FactRegisterRequest => "mixmessages.FactRegisterRequest",
    FactRegisterResponse => "mixmessages.FactRegisterResponse",
    FactConfirmRequest => "mixmessages.FactConfirmRequest",
    FactRemovalRequest => "mixmessages.FactRemovalRequest",
}
