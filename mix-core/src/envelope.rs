//! Authenticated envelope: wraps any payload with sender ID, token and an optional signature.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::identity::{hash_payload, PeerId, PublicKey, SignatureError, Signer};

/// A message type that can ride inside an envelope. The tag identifies it on the wire.
pub trait Payload: Serialize + DeserializeOwned {
    const TYPE_TAG: &'static str;
}

/// Self-describing payload: type tag plus encoded bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnyPayload {
    pub type_tag: String,
    pub bytes: Vec<u8>,
}

impl AnyPayload {
    pub fn pack<T: Payload>(msg: &T) -> Result<Self, PayloadError> {
        Ok(Self {
            type_tag: T::TYPE_TAG.to_string(),
            bytes: bincode::serialize(msg).map_err(PayloadError::Encode)?,
        })
    }

    pub fn unpack<T: Payload>(&self) -> Result<T, PayloadError> {
        if self.type_tag != T::TYPE_TAG {
            return Err(PayloadError::TypeMismatch {
                expected: T::TYPE_TAG,
                found: self.type_tag.clone(),
            });
        }
        bincode::deserialize(&self.bytes).map_err(PayloadError::Decode)
    }

    /// The exact bytes covered by an envelope signature.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, PayloadError> {
        bincode::serialize(self).map_err(PayloadError::Encode)
    }
}

/// Envelope for authenticated transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedMessage {
    pub sender: PeerId,
    pub token: Vec<u8>,
    pub signature: Option<Vec<u8>>,
    pub payload: AnyPayload,
}

impl AuthenticatedMessage {
    /// Wrap `msg`. With a signer, sign the hash of the encoded payload.
    pub fn pack<T: Payload>(
        sender: PeerId,
        token: Vec<u8>,
        msg: &T,
        signer: Option<&dyn Signer>,
    ) -> Result<Self, PayloadError> {
        let payload = AnyPayload::pack(msg)?;
        let signature = match signer {
            Some(s) => Some(s.sign(&hash_payload(&payload.signing_bytes()?))),
            None => None,
        };
        Ok(Self {
            sender,
            token,
            signature,
            payload,
        })
    }

    /// Check the attached signature against `key`. A missing signature fails.
    pub fn verify_signature(&self, key: &PublicKey) -> Result<(), EnvelopeSignatureError> {
        let signature = self
            .signature
            .as_deref()
            .ok_or(EnvelopeSignatureError::Missing)?;
        let digest = hash_payload(&self.payload.signing_bytes()?);
        key.verify(&digest, signature)?;
        Ok(())
    }

    pub fn unpack<T: Payload>(&self) -> Result<T, PayloadError> {
        self.payload.unpack()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("payload type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: String,
    },
    #[error("payload encode error: {0}")]
    Encode(bincode::Error),
    #[error("payload decode error: {0}")]
    Decode(bincode::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeSignatureError {
    #[error("envelope carries no signature")]
    Missing,
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error(transparent)]
    Signature(#[from] SignatureError),
}
