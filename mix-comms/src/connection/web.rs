//! Bridged binding: every call opens its own stream, sends one request, half-closes and reads
//! reply frames until the peer closes.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use mix_core::wire;
use mix_core::{Frame, Metadata};
use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::debug;

use super::{Binding, Connection, ConnectionState, FrameStream, ServerStream, Target, TransportError};
use crate::framing::{read_frame, write_encoded};

pub struct WebConnection {
    target: Target,
    next_call_id: AtomicU64,
    state: RwLock<ConnectionState>,
}

impl WebConnection {
    pub(crate) fn new(target: Target) -> Self {
        Self {
            target,
            next_call_id: AtomicU64::new(1),
            state: RwLock::new(ConnectionState::Idle),
        }
    }

    async fn call(
        &self,
        method: &str,
        metadata: Metadata,
        payload: Vec<u8>,
    ) -> Result<FrameStream, TransportError> {
        if !self.state().is_good() {
            return Err(TransportError::Closed);
        }
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let request = wire::encode_frame(&Frame::Request {
            call_id,
            method: method.to_string(),
            metadata,
            payload,
        })?;
        let stream = self.target.open().await?;
        let (mut reader, mut writer) = tokio::io::split(stream);
        write_encoded(&mut writer, &request).await?;
        writer.shutdown().await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let address = self.target.address().to_string();
        let reader_task = tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(frame)) if frame.call_id() == call_id => {
                        if tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Ok(Some(_)) => {
                        debug!(%address, call_id, "dropping frame for another call");
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(%address, error = %e, "read failed");
                        break;
                    }
                }
            }
        });
        Ok(FrameStream::new(
            rx,
            Box::new(AbortOnDrop(reader_task.abort_handle())),
        ))
    }
}

struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[async_trait]
impl Connection for WebConnection {
    fn binding(&self) -> Binding {
        Binding::Web
    }

    fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    async fn invoke_unary(
        &self,
        method: &str,
        metadata: Metadata,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, TransportError> {
        self.call(method, metadata, payload).await?.unary_reply().await
    }

    async fn open_server_stream(
        &self,
        method: &str,
        metadata: Metadata,
        payload: Vec<u8>,
    ) -> Result<Box<dyn ServerStream>, TransportError> {
        Ok(Box::new(self.call(method, metadata, payload).await?))
    }

    async fn close(&self) {
        *self.state.write() = ConnectionState::Shutdown;
    }
}

impl fmt::Debug for WebConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebConnection")
            .field("target", &self.target)
            .field("state", &self.state())
            .finish()
    }
}
