//! Mix-network comms core.
//! No I/O: identity and signing, wire frames, authenticated envelopes, tokens, chunked responses.

pub mod chunk;
pub mod envelope;
pub mod identity;
pub mod messages;
pub mod protocol;
pub mod token;
pub mod wire;

pub use chunk::{ChunkCollector, ChunkError, CHUNK_HEADER, DEFAULT_CHUNK_SIZE};
pub use envelope::{AnyPayload, AuthenticatedMessage, Payload, PayloadError};
pub use identity::{Keypair, PeerId, PublicKey, SignatureError, Signer};
pub use protocol::{Frame, Metadata, Status, StatusCode, PROTOCOL_VERSION};
pub use token::{TokenError, TokenTable, DEFAULT_TOKEN_TTL};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
