//! Error taxonomy. Callers branch on [`ErrorKind`], not on message text.

use std::time::Duration;

use mix_core::{ChunkError, PayloadError, PeerId, Status, StatusCode};

use crate::auth::AuthError;
use crate::connection::tls::TlsError;
use crate::connection::TransportError;

/// Error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connectivity,
    Authentication,
    Protocol,
    Decoding,
    Timeout,
    Remote,
    NotFound,
}

#[derive(Debug, thiserror::Error)]
pub enum CommsError {
    #[error("host {0} not found")]
    HostNotFound(PeerId),
    #[error("failed to connect to {peer} at {address} after {attempts} attempts: {source}")]
    ConnectFailed {
        peer: PeerId,
        address: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },
    #[error("{method} to {peer}: {source}")]
    Transport {
        method: &'static str,
        peer: PeerId,
        #[source]
        source: TransportError,
    },
    #[error("call to {peer} timed out after {timeout:?}")]
    Timeout { peer: PeerId, timeout: Duration },
    #[error("{method} to {peer}: remote returned {status}")]
    Remote {
        method: &'static str,
        peer: PeerId,
        status: Status,
    },
    #[error("handshake with {peer} failed: {source}")]
    Handshake {
        peer: PeerId,
        #[source]
        source: Box<CommsError>,
    },
    #[error("stream from {peer} broke after {received} of {total} chunks: {source}")]
    StreamBroken {
        peer: PeerId,
        received: usize,
        total: usize,
        #[source]
        source: Box<CommsError>,
    },
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("failed to listen on {address}: {source}")]
    Listen {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Tls(#[from] TlsError),
}

impl CommsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CommsError::HostNotFound(_) => ErrorKind::NotFound,
            CommsError::ConnectFailed { .. } | CommsError::Listen { .. } | CommsError::Tls(_) => {
                ErrorKind::Connectivity
            }
            CommsError::Transport { source, .. } => match source {
                TransportError::UnexpectedFrame(_)
                | TransportError::Decode(_)
                | TransportError::Encode(_) => ErrorKind::Protocol,
                _ => ErrorKind::Connectivity,
            },
            CommsError::Timeout { .. } => ErrorKind::Timeout,
            CommsError::Remote { status, .. } => kind_of_status(status.code),
            CommsError::Handshake { source, .. } => match source.kind() {
                ErrorKind::Connectivity | ErrorKind::Timeout => source.kind(),
                _ => ErrorKind::Authentication,
            },
            CommsError::StreamBroken { .. } => ErrorKind::Protocol,
            CommsError::Auth(_) => ErrorKind::Authentication,
            CommsError::Chunk(ChunkError::Decode(_)) | CommsError::Chunk(ChunkError::Encode(_)) => {
                ErrorKind::Decoding
            }
            CommsError::Chunk(_) => ErrorKind::Protocol,
            CommsError::Payload(_) | CommsError::Codec(_) => ErrorKind::Decoding,
        }
    }

    /// Transient failures worth another attempt: transport faults, deadlines, and remote
    /// `Unavailable` / `DeadlineExceeded`.
    pub fn is_retryable(&self) -> bool {
        match self {
            CommsError::Transport { .. } => self.kind() == ErrorKind::Connectivity,
            CommsError::Timeout { .. } => true,
            CommsError::Remote { status, .. } => matches!(
                status.code,
                StatusCode::Unavailable | StatusCode::DeadlineExceeded
            ),
            CommsError::Handshake { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// The peer rejected our credentials; the host must re-handshake.
    pub fn is_remote_unauthenticated(&self) -> bool {
        matches!(
            self,
            CommsError::Remote { status, .. } if status.code == StatusCode::Unauthenticated
        )
    }

    pub(crate) fn from_transport(method: &'static str, peer: PeerId, err: TransportError) -> Self {
        match err {
            TransportError::Status(status) => CommsError::Remote {
                method,
                peer,
                status,
            },
            source => CommsError::Transport {
                method,
                peer,
                source,
            },
        }
    }
}

fn kind_of_status(code: StatusCode) -> ErrorKind {
    match code {
        StatusCode::Unauthenticated | StatusCode::PermissionDenied => ErrorKind::Authentication,
        StatusCode::DeadlineExceeded => ErrorKind::Timeout,
        StatusCode::NotFound => ErrorKind::NotFound,
        _ => ErrorKind::Remote,
    }
}

impl From<CommsError> for Status {
    fn from(err: CommsError) -> Self {
        let code = match &err {
            CommsError::Remote { status, .. } => status.code,
            other => match other.kind() {
                ErrorKind::Authentication => StatusCode::Unauthenticated,
                ErrorKind::Decoding => StatusCode::InvalidArgument,
                ErrorKind::Timeout => StatusCode::DeadlineExceeded,
                ErrorKind::NotFound => StatusCode::NotFound,
                ErrorKind::Connectivity => StatusCode::Unavailable,
                ErrorKind::Protocol | ErrorKind::Remote => StatusCode::Internal,
            },
        };
        Status::new(code, err.to_string())
    }
}
