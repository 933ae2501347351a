//! Native binding: one persistent stream, calls multiplexed by call id.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use mix_core::wire;
use mix_core::{Frame, Metadata};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use super::{Binding, Connection, ConnectionState, FrameStream, IoStream, ServerStream, TransportError};
use crate::framing::{read_frame, write_encoded};

type CallTable = DashMap<u64, mpsc::UnboundedSender<Frame>>;

pub struct NativeConnection {
    address: String,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    calls: Arc<CallTable>,
    next_call_id: AtomicU64,
    state: Arc<RwLock<ConnectionState>>,
    tasks: [AbortHandle; 2],
}

impl NativeConnection {
    /// Take over an established stream: spawn the writer and the frame router.
    pub(crate) fn start(stream: Box<dyn IoStream>, address: String) -> Self {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (outbound, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let calls: Arc<CallTable> = Arc::new(DashMap::new());
        let state = Arc::new(RwLock::new(ConnectionState::Ready));

        let writer_calls = calls.clone();
        let writer_state = state.clone();
        let writer_addr = address.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                if let Err(e) = write_encoded(&mut writer, &bytes).await {
                    debug!(address = %writer_addr, error = %e, "write failed");
                    mark_failed(&writer_state);
                    writer_calls.clear();
                    break;
                }
            }
        });

        let reader_calls = calls.clone();
        let reader_state = state.clone();
        let reader_addr = address.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(frame)) => {
                        let call_id = frame.call_id();
                        match reader_calls.get(&call_id) {
                            Some(tx) => {
                                let _ = tx.send(frame);
                            }
                            None => trace!(address = %reader_addr, call_id, "frame for finished call"),
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(address = %reader_addr, error = %e, "read failed");
                        break;
                    }
                }
            }
            mark_failed(&reader_state);
            reader_calls.clear();
        });

        Self {
            address,
            outbound,
            calls,
            next_call_id: AtomicU64::new(1),
            state,
            tasks: [writer_task.abort_handle(), reader_task.abort_handle()],
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn in_flight(&self) -> usize {
        self.calls.len()
    }

    fn begin_call(
        &self,
        method: &str,
        metadata: Metadata,
        payload: Vec<u8>,
    ) -> Result<FrameStream, TransportError> {
        if !self.state().is_good() {
            return Err(TransportError::Closed);
        }
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        // An unencodable request fails alone; the stream stays usable.
        let request = wire::encode_frame(&Frame::Request {
            call_id,
            method: method.to_string(),
            metadata,
            payload,
        })?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.calls.insert(call_id, tx);
        let guard = CallGuard {
            calls: self.calls.clone(),
            call_id,
        };
        self.outbound
            .send(request)
            .map_err(|_| TransportError::Closed)?;
        Ok(FrameStream::new(rx, Box::new(guard)))
    }
}

fn mark_failed(state: &RwLock<ConnectionState>) {
    let mut s = state.write();
    if *s != ConnectionState::Shutdown {
        *s = ConnectionState::TransientFailure;
    }
}

/// Deregisters a call when its stream is dropped.
struct CallGuard {
    calls: Arc<CallTable>,
    call_id: u64,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.calls.remove(&self.call_id);
    }
}

#[async_trait]
impl Connection for NativeConnection {
    fn binding(&self) -> Binding {
        Binding::Native
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
        self.begin_call(method, metadata, payload)?.unary_reply().await
    }

    async fn open_server_stream(
        &self,
        method: &str,
        metadata: Metadata,
        payload: Vec<u8>,
    ) -> Result<Box<dyn ServerStream>, TransportError> {
        Ok(Box::new(self.begin_call(method, metadata, payload)?))
    }

    async fn close(&self) {
        *self.state.write() = ConnectionState::Shutdown;
        for task in &self.tasks {
            task.abort();
        }
        self.calls.clear();
    }
}

impl Drop for NativeConnection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl fmt::Debug for NativeConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeConnection")
            .field("address", &self.address)
            .field("state", &self.state())
            .field("in_flight", &self.calls.len())
            .finish()
    }
}
