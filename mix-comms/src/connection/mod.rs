//! Transport bindings behind one [`Connection`] abstraction.
//!
//! Two bindings carry the same frames: [`NativeConnection`] multiplexes calls over one persistent
//! stream, [`WebConnection`] (the bridged binding) opens a stream per call. The binding is picked
//! once in [`dial`]; call sites only see `dyn Connection`.

pub mod native;
pub mod tls;
pub mod web;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use mix_core::{Frame, FrameDecodeError, FrameEncodeError, Metadata, Status};
use rustls::pki_types::ServerName;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::host::HostParams;

pub use native::NativeConnection;
pub use tls::{TlsError, TlsIdentity};
pub use web::WebConnection;

/// Which transport binding a host uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Binding {
    #[default]
    Native,
    Web,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

impl ConnectionState {
    /// Reusable: idle, connecting or ready. Not a promise the next call succeeds.
    pub fn is_good(self) -> bool {
        matches!(
            self,
            ConnectionState::Idle | ConnectionState::Connecting | ConnectionState::Ready
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed")]
    Closed,
    #[error("dial timed out after {0:?}")]
    DialTimeout(Duration),
    #[error("frame encode: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("frame decode: {0}")]
    Decode(#[from] FrameDecodeError),
    #[error("unexpected frame: {0}")]
    UnexpectedFrame(&'static str),
    #[error("tls: {0}")]
    Tls(#[from] TlsError),
    #[error("remote status: {0}")]
    Status(Status),
}

/// One established connection to a peer.
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    fn binding(&self) -> Binding;

    fn state(&self) -> ConnectionState;

    fn is_good(&self) -> bool {
        self.state().is_good()
    }

    async fn invoke_unary(
        &self,
        method: &str,
        metadata: Metadata,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, TransportError>;

    async fn open_server_stream(
        &self,
        method: &str,
        metadata: Metadata,
        payload: Vec<u8>,
    ) -> Result<Box<dyn ServerStream>, TransportError>;

    async fn close(&self);
}

/// Receive side of a server-streamed call.
#[async_trait]
pub trait ServerStream: Send {
    /// Finish the send half. Requests are a single frame, so both bindings have sent everything
    /// by the time the stream is open.
    async fn close_send(&mut self) -> Result<(), TransportError>;

    /// Header metadata sent before the first chunk.
    async fn header(&mut self) -> Result<Metadata, TransportError>;

    /// Next chunk, `None` at normal end-of-stream.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError>;

    /// Drain the receive side, expecting end-of-stream.
    async fn recv_close(&mut self) -> Result<(), TransportError>;
}

pub(crate) trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoStream for T {}

/// Where and how to open a byte stream to a peer.
#[derive(Clone)]
pub(crate) struct Target {
    address: String,
    dial_timeout: Duration,
    tls: Option<(TlsConnector, ServerName<'static>)>,
}

impl Target {
    pub(crate) fn address(&self) -> &str {
        &self.address
    }

    pub(crate) async fn open(&self) -> Result<Box<dyn IoStream>, TransportError> {
        let tcp = tokio::time::timeout(self.dial_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| TransportError::DialTimeout(self.dial_timeout))??;
        if let Err(e) = tcp.set_nodelay(true) {
            debug!(address = %self.address, error = %e, "set_nodelay failed");
        }
        match &self.tls {
            Some((connector, name)) => {
                let stream =
                    tokio::time::timeout(self.dial_timeout, connector.connect(name.clone(), tcp))
                        .await
                        .map_err(|_| TransportError::DialTimeout(self.dial_timeout))??;
                Ok(Box::new(stream))
            }
            None => Ok(Box::new(tcp)),
        }
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("address", &self.address)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

/// Open a connection to `address`. TLS is used when certificate material is present and not
/// disabled by `params`.
pub async fn dial(
    address: &str,
    params: &HostParams,
    cert_pem: Option<&[u8]>,
) -> Result<std::sync::Arc<dyn Connection>, TransportError> {
    let tls = match cert_pem {
        Some(pem) if !params.disable_tls => Some((
            tls::connector(pem)?,
            tls::server_name(address, params.tls_server_name.as_deref())?,
        )),
        _ => None,
    };
    let target = Target {
        address: address.to_string(),
        dial_timeout: params.dial_timeout,
        tls,
    };
    match params.binding {
        Binding::Native => {
            let stream = target.open().await?;
            Ok(std::sync::Arc::new(NativeConnection::start(
                stream,
                address.to_string(),
            )))
        }
        Binding::Web => {
            // Probe reachability so dial failures surface at connect time.
            drop(target.open().await?);
            Ok(std::sync::Arc::new(WebConnection::new(target)))
        }
    }
}

/// Frames of one call, in arrival order. Shared by both bindings.
pub(crate) struct FrameStream {
    frames: mpsc::UnboundedReceiver<Frame>,
    header: Option<Metadata>,
    finished: bool,
    _guard: Box<dyn Send>,
}

impl FrameStream {
    pub(crate) fn new(frames: mpsc::UnboundedReceiver<Frame>, guard: Box<dyn Send>) -> Self {
        Self {
            frames,
            header: None,
            finished: false,
            _guard: guard,
        }
    }

    /// Wait for the single reply of a unary call.
    pub(crate) async fn unary_reply(mut self) -> Result<Vec<u8>, TransportError> {
        match self.frames.recv().await {
            Some(Frame::Response { payload, .. }) => Ok(payload),
            Some(Frame::Status { status, .. }) => Err(TransportError::Status(status)),
            Some(_) => Err(TransportError::UnexpectedFrame("stream frame on unary call")),
            None => Err(TransportError::Closed),
        }
    }
}

#[async_trait]
impl ServerStream for FrameStream {
    async fn close_send(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn header(&mut self) -> Result<Metadata, TransportError> {
        if let Some(header) = &self.header {
            return Ok(header.clone());
        }
        match self.frames.recv().await {
            Some(Frame::Header { metadata, .. }) => {
                self.header = Some(metadata.clone());
                Ok(metadata)
            }
            Some(Frame::Status { status, .. }) => {
                self.finished = true;
                Err(TransportError::Status(status))
            }
            Some(_) => Err(TransportError::UnexpectedFrame("expected stream header")),
            None => Err(TransportError::Closed),
        }
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        if self.finished {
            return Ok(None);
        }
        if self.header.is_none() {
            self.header().await?;
        }
        match self.frames.recv().await {
            Some(Frame::Chunk { data, .. }) => Ok(Some(data)),
            Some(Frame::End { .. }) => {
                self.finished = true;
                Ok(None)
            }
            Some(Frame::Status { status, .. }) => {
                self.finished = true;
                Err(TransportError::Status(status))
            }
            Some(_) => Err(TransportError::UnexpectedFrame("expected chunk or end")),
            None => Err(TransportError::Closed),
        }
    }

    async fn recv_close(&mut self) -> Result<(), TransportError> {
        match self.recv().await? {
            None => Ok(()),
            Some(_) => Err(TransportError::UnexpectedFrame("data after declared end")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_of(frames: Vec<Frame>) -> FrameStream {
        let (tx, rx) = mpsc::unbounded_channel();
        for f in frames {
            tx.send(f).unwrap();
        }
        FrameStream::new(rx, Box::new(()))
    }

    #[test]
    fn good_states() {
        assert!(ConnectionState::Idle.is_good());
        assert!(ConnectionState::Connecting.is_good());
        assert!(ConnectionState::Ready.is_good());
        assert!(!ConnectionState::TransientFailure.is_good());
        assert!(!ConnectionState::Shutdown.is_good());
    }

    #[tokio::test]
    async fn header_chunks_end() {
        let mut md = Metadata::new();
        md.insert("totalChunks".into(), "2".into());
        let mut s = stream_of(vec![
            Frame::Header {
                call_id: 1,
                metadata: md.clone(),
            },
            Frame::Chunk {
                call_id: 1,
                data: vec![1],
            },
            Frame::Chunk {
                call_id: 1,
                data: vec![2],
            },
            Frame::End { call_id: 1 },
        ]);
        s.close_send().await.unwrap();
        assert_eq!(s.header().await.unwrap(), md);
        assert_eq!(s.recv().await.unwrap(), Some(vec![1]));
        assert_eq!(s.recv().await.unwrap(), Some(vec![2]));
        assert_eq!(s.recv().await.unwrap(), None);
        assert!(s.recv_close().await.is_ok());
    }

    #[tokio::test]
    async fn sender_gone_mid_stream_is_closed() {
        let mut s = stream_of(vec![
            Frame::Header {
                call_id: 1,
                metadata: Metadata::new(),
            },
            Frame::Chunk {
                call_id: 1,
                data: vec![1],
            },
        ]);
        assert!(s.recv().await.unwrap().is_some());
        assert!(matches!(s.recv().await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn status_before_header_is_surfaced() {
        let mut s = stream_of(vec![Frame::Status {
            call_id: 1,
            status: Status::unauthenticated("no token"),
        }]);
        assert!(matches!(s.header().await, Err(TransportError::Status(_))));
    }

    #[test]
    fn binding_parses_lowercase() {
        #[derive(Deserialize)]
        struct W {
            binding: Binding,
        }
        let w: W = toml::from_str("binding = \"web\"").unwrap();
        assert_eq!(w.binding, Binding::Web);
    }
}
