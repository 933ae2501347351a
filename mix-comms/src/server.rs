//! Frame server: accept connections, dispatch each request to a [`Service`] and write the reply
//! frames back on the same stream.
//!
//! Serves both bindings. A native client keeps the stream open and multiplexes; a bridged client
//! sends one request and half-closes. Either way the write half is shut down only once the
//! read half has ended and every in-flight call has replied.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mix_core::chunk::chunk_header;
use mix_core::wire;
use mix_core::{Frame, Metadata, Status};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, trace, warn};

use crate::connection::{IoStream, TlsIdentity};
use crate::error::CommsError;
use crate::framing::{read_frame, write_encoded};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Per-call context handed to the service.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub peer_addr: SocketAddr,
    pub metadata: Metadata,
}

/// What a service answers with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Unary(Vec<u8>),
    /// Header, then each chunk in order, then end-of-stream.
    Stream {
        header: Metadata,
        chunks: Vec<Vec<u8>>,
    },
}

impl Reply {
    /// A stream whose header announces `chunks.len()`.
    pub fn chunked(chunks: Vec<Vec<u8>>) -> Self {
        Reply::Stream {
            header: chunk_header(chunks.len()),
            chunks,
        }
    }

    fn into_frames(self, call_id: u64) -> Vec<Frame> {
        match self {
            Reply::Unary(payload) => vec![Frame::Response { call_id, payload }],
            Reply::Stream { header, chunks } => {
                let mut frames = Vec::with_capacity(chunks.len() + 2);
                frames.push(Frame::Header {
                    call_id,
                    metadata: header,
                });
                frames.extend(chunks.into_iter().map(|data| Frame::Chunk { call_id, data }));
                frames.push(Frame::End { call_id });
                frames
            }
        }
    }
}

/// Handles every method one endpoint serves.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    async fn call(
        &self,
        method: &str,
        ctx: CallContext,
        payload: Vec<u8>,
    ) -> Result<Reply, Status>;
}

/// Decode a request body; malformed input is `InvalidArgument`.
pub fn decode_request<T: DeserializeOwned>(payload: &[u8]) -> Result<T, Status> {
    wire::decode_message(payload)
        .map_err(|e| Status::invalid_argument(format!("malformed request: {}", e)))
}

/// Encode `msg` as a unary reply.
pub fn unary<T: Serialize + ?Sized>(msg: &T) -> Result<Reply, Status> {
    wire::encode_message(msg)
        .map(Reply::Unary)
        .map_err(|e| Status::internal(format!("encoding reply: {}", e)))
}

/// A running listener. Dropping it stops accepting and closes served connections.
pub struct Server {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
}

impl Server {
    /// Bind `address` and start serving `service`. Without `tls` connections are plaintext.
    pub async fn start(
        address: &str,
        tls: Option<TlsIdentity>,
        service: Arc<dyn Service>,
    ) -> Result<Self, CommsError> {
        let listen_err = |source| CommsError::Listen {
            address: address.to_string(),
            source,
        };
        let listener = TcpListener::bind(address).await.map_err(listen_err)?;
        let local_addr = listener.local_addr().map_err(listen_err)?;
        if tls.is_none() {
            warn!(%local_addr, "serving without TLS");
        }
        info!(%local_addr, tls = tls.is_some(), "listening");
        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(accept_loop(
            listener,
            tls.map(|t| t.acceptor()),
            service,
            shutdown_rx,
        ));
        Ok(Self {
            local_addr,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and close every served connection. In-flight calls are abandoned.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    service: Arc<dyn Service>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((tcp, peer_addr)) => {
                if let Err(e) = tcp.set_nodelay(true) {
                    debug!(%peer_addr, error = %e, "set_nodelay failed");
                }
                let acceptor = acceptor.clone();
                let service = service.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let stream: Box<dyn IoStream> = match acceptor {
                        Some(acceptor) => match acceptor.accept(tcp).await {
                            Ok(tls) => Box::new(tls),
                            Err(e) => {
                                debug!(%peer_addr, error = %e, "tls accept failed");
                                return;
                            }
                        },
                        None => Box::new(tcp),
                    };
                    serve_connection(stream, peer_addr, service, shutdown).await;
                });
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    debug!("accept loop stopped");
}

async fn serve_connection(
    stream: Box<dyn IoStream>,
    peer_addr: SocketAddr,
    service: Arc<dyn Service>,
    mut shutdown: watch::Receiver<bool>,
) {
    trace!(%peer_addr, "connection opened");
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (replies, mut outbound) = mpsc::unbounded_channel::<Vec<u8>>();

    let write_loop = async move {
        while let Some(bytes) = outbound.recv().await {
            if let Err(e) = write_encoded(&mut writer, &bytes).await {
                debug!(%peer_addr, error = %e, "write failed");
                return;
            }
        }
        let _ = writer.shutdown().await;
    };

    let read_loop = async move {
        let mut calls = JoinSet::new();
        let mut stopped = false;
        loop {
            let next = tokio::select! {
                _ = shutdown.changed() => {
                    stopped = true;
                    break;
                }
                _ = replies.closed() => {
                    stopped = true;
                    break;
                }
                next = read_frame(&mut reader) => next,
            };
            match next {
                Ok(Some(Frame::Request {
                    call_id,
                    method,
                    metadata,
                    payload,
                })) => {
                    let service = service.clone();
                    let replies = replies.clone();
                    calls.spawn(async move {
                        trace!(%peer_addr, call_id, %method, "request");
                        let ctx = CallContext {
                            peer_addr,
                            metadata,
                        };
                        let frames = match service.call(&method, ctx, payload).await {
                            Ok(reply) => reply.into_frames(call_id),
                            Err(status) => {
                                debug!(%peer_addr, %method, %status, "call failed");
                                vec![Frame::Status { call_id, status }]
                            }
                        };
                        for frame in frames {
                            let bytes = match wire::encode_frame(&frame) {
                                Ok(bytes) => bytes,
                                Err(e) => {
                                    warn!(%peer_addr, call_id, error = %e, "reply frame not encodable");
                                    match encode_failure(call_id) {
                                        Some(bytes) => {
                                            let _ = replies.send(bytes);
                                        }
                                        None => debug!(%peer_addr, call_id, "status frame not encodable"),
                                    }
                                    break;
                                }
                            };
                            if replies.send(bytes).is_err() {
                                break;
                            }
                        }
                    });
                }
                Ok(Some(other)) => {
                    debug!(%peer_addr, call_id = other.call_id(), "ignoring non-request frame");
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(%peer_addr, error = %e, "read failed");
                    break;
                }
            }
            while calls.try_join_next().is_some() {}
        }
        if stopped {
            calls.abort_all();
        }
        while calls.join_next().await.is_some() {}
        drop(replies);
    };

    tokio::join!(read_loop, write_loop);
    trace!(%peer_addr, "connection closed");
}

/// Terminates a call whose next reply frame exceeds the frame cap.
fn encode_failure(call_id: u64) -> Option<Vec<u8>> {
    wire::encode_frame(&Frame::Status {
        call_id,
        status: Status::internal("reply exceeds frame cap"),
    })
    .ok()
}
