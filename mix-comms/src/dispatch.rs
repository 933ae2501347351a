//! Dispatcher: run a remote operation against a host with connection resolution, deadline,
//! auto-handshake and optional retry.
//!
//! Operations are closures over `Arc<dyn Connection>`, so the same call site serves both
//! transport bindings.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use mix_core::wire;
use mix_core::{Metadata, PeerId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::comms::Comms;
use crate::connection::{Connection, ServerStream};
use crate::error::CommsError;
use crate::host::Host;

/// Deadline for each handshake call.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Upper bound on the lifetime of a server stream.
pub const STREAM_CEILING: Duration = Duration::from_secs(10);
/// Attempts made by [`Comms::send_with_retry`].
pub const MAX_SEND_ATTEMPTS: u32 = 5;

const RETRY_BACKOFF: Duration = Duration::from_millis(100);

impl Comms {
    /// Run `op` with the host's configured send timeout.
    pub async fn send<T, F, Fut>(&self, host: &Arc<Host>, op: F) -> Result<T, CommsError>
    where
        F: FnOnce(Arc<dyn Connection>) -> Fut,
        Fut: Future<Output = Result<T, CommsError>>,
    {
        self.send_with_timeout(host, host.params().send_timeout, op)
            .await
    }

    /// Run `op` under `timeout`. Handshakes first when the host requires auth and has none.
    pub async fn send_with_timeout<T, F, Fut>(
        &self,
        host: &Arc<Host>,
        timeout: Duration,
        op: F,
    ) -> Result<T, CommsError>
    where
        F: FnOnce(Arc<dyn Connection>) -> Fut,
        Fut: Future<Output = Result<T, CommsError>>,
    {
        self.ensure_authenticated(host).await?;
        self.dispatch(host, timeout, op).await
    }

    /// [`send`](Self::send) for idempotent operations: retryable failures are re-issued with a
    /// fresh deadline, up to [`MAX_SEND_ATTEMPTS`]. The last error is returned.
    ///
    /// The handshake runs at most once, before the first attempt, and its failure is returned
    /// as is.
    pub async fn send_with_retry<T, F, Fut>(&self, host: &Arc<Host>, op: F) -> Result<T, CommsError>
    where
        F: Fn(Arc<dyn Connection>) -> Fut,
        Fut: Future<Output = Result<T, CommsError>>,
    {
        self.ensure_authenticated(host).await?;
        let timeout = host.params().send_timeout;
        let mut attempt = 1;
        loop {
            match self.dispatch(host, timeout, &op).await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < MAX_SEND_ATTEMPTS => {
                    warn!(peer = %host.id(), attempt, error = %e, "send failed, retrying");
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Open a server stream. The returned handle enforces [`STREAM_CEILING`] on every read.
    pub async fn stream<F, Fut>(
        &self,
        host: &Arc<Host>,
        method: &'static str,
        op: F,
    ) -> Result<StreamHandle, CommsError>
    where
        F: FnOnce(Arc<dyn Connection>) -> Fut,
        Fut: Future<Output = Result<Box<dyn ServerStream>, CommsError>>,
    {
        self.ensure_authenticated(host).await?;
        let deadline = Instant::now() + STREAM_CEILING;
        let conn = host.connect().await?;
        let inner = match tokio::time::timeout_at(deadline, op(conn)).await {
            Ok(r) => r.map_err(|e| note_failure(host, e))?,
            Err(_) => {
                return Err(CommsError::Timeout {
                    peer: host.id(),
                    timeout: STREAM_CEILING,
                })
            }
        };
        Ok(StreamHandle {
            inner,
            deadline,
            host: host.clone(),
            method,
        })
    }

    /// Resolve the connection and run `op` under `timeout`, without the auth check.
    pub(crate) async fn dispatch<T, F, Fut>(
        &self,
        host: &Arc<Host>,
        timeout: Duration,
        op: F,
    ) -> Result<T, CommsError>
    where
        F: FnOnce(Arc<dyn Connection>) -> Fut,
        Fut: Future<Output = Result<T, CommsError>>,
    {
        let conn = host.connect().await?;
        match tokio::time::timeout(timeout, op(conn)).await {
            Ok(result) => result.map_err(|e| note_failure(host, e)),
            Err(_) => Err(CommsError::Timeout {
                peer: host.id(),
                timeout,
            }),
        }
    }

    async fn ensure_authenticated(&self, host: &Arc<Host>) -> Result<(), CommsError> {
        if host.params().auth_enabled && !host.is_authenticated() {
            self.client_handshake(host).await?;
        }
        Ok(())
    }
}

fn note_failure(host: &Host, err: CommsError) -> CommsError {
    if err.is_remote_unauthenticated() {
        warn!(peer = %host.id(), "peer rejected our token; re-handshake on next call");
        host.reset_auth();
    }
    err
}

/// Encode `request`, invoke `method` and decode the reply.
pub async fn call_unary<Req, Resp>(
    conn: &dyn Connection,
    peer: PeerId,
    method: &'static str,
    request: &Req,
) -> Result<Resp, CommsError>
where
    Req: Serialize + ?Sized,
    Resp: DeserializeOwned,
{
    let payload = wire::encode_message(request)?;
    trace!(peer = %peer, method, bytes = payload.len(), "unary call");
    let reply = conn
        .invoke_unary(method, Metadata::new(), payload)
        .await
        .map_err(|e| CommsError::from_transport(method, peer, e))?;
    Ok(wire::decode_message(&reply)?)
}

/// Encode `request` and open a server stream on `method`.
pub async fn open_stream<Req>(
    conn: &dyn Connection,
    peer: PeerId,
    method: &'static str,
    request: &Req,
) -> Result<Box<dyn ServerStream>, CommsError>
where
    Req: Serialize + ?Sized,
{
    let payload = wire::encode_message(request)?;
    trace!(peer = %peer, method, bytes = payload.len(), "open stream");
    conn.open_server_stream(method, Metadata::new(), payload)
        .await
        .map_err(|e| CommsError::from_transport(method, peer, e))
}

/// A server stream bounded by the streaming ceiling. A remote `Unauthenticated` status at any
/// point resets the host's auth state.
pub struct StreamHandle {
    inner: Box<dyn ServerStream>,
    deadline: Instant,
    host: Arc<Host>,
    method: &'static str,
}

impl StreamHandle {
    pub fn peer(&self) -> PeerId {
        self.host.id()
    }

    pub async fn close_send(&mut self) -> Result<(), CommsError> {
        let (deadline, host, method) = (self.deadline, &self.host, self.method);
        bounded(deadline, host, method, self.inner.close_send()).await
    }

    pub async fn header(&mut self) -> Result<Metadata, CommsError> {
        let (deadline, host, method) = (self.deadline, &self.host, self.method);
        bounded(deadline, host, method, self.inner.header()).await
    }

    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>, CommsError> {
        let (deadline, host, method) = (self.deadline, &self.host, self.method);
        bounded(deadline, host, method, self.inner.recv()).await
    }

    pub async fn recv_close(&mut self) -> Result<(), CommsError> {
        let (deadline, host, method) = (self.deadline, &self.host, self.method);
        bounded(deadline, host, method, self.inner.recv_close()).await
    }
}

async fn bounded<T>(
    deadline: Instant,
    host: &Host,
    method: &'static str,
    fut: impl Future<Output = Result<T, crate::connection::TransportError>>,
) -> Result<T, CommsError> {
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(r) => r.map_err(|e| note_failure(host, CommsError::from_transport(method, host.id(), e))),
        Err(_) => Err(CommsError::Timeout {
            peer: host.id(),
            timeout: STREAM_CEILING,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::host::HostParams;
    use crate::server::{CallContext, Reply, Server, Service};
    use crate::testutil::{auth_params, fast_params, new_comms};
    use async_trait::async_trait;
    use mix_core::protocol::methods;
    use mix_core::{Status, StatusCode};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Echo with knobs: "/test/slow" sleeps, "/test/flaky" fails until the 3rd call,
    /// "/test/broken" always fails with a non-retryable status, "/test/denied" rejects our token.
    /// Token requests are unavailable.
    #[derive(Default)]
    struct TestService {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Service for TestService {
        async fn call(
            &self,
            method: &str,
            _ctx: CallContext,
            payload: Vec<u8>,
        ) -> Result<Reply, Status> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            match method {
                methods::REQUEST_TOKEN => Err(Status::new(StatusCode::Unavailable, "no tokens")),
                "/test/slow" => {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok(Reply::Unary(payload))
                }
                "/test/flaky" if n < 3 => Err(Status::new(
                    StatusCode::Unavailable,
                    format!("attempt {}", n),
                )),
                "/test/down" => Err(Status::new(
                    StatusCode::Unavailable,
                    format!("attempt {}", n),
                )),
                "/test/broken" => Err(Status::invalid_argument("bad request")),
                "/test/denied" => Err(Status::unauthenticated("token unknown")),
                _ => Ok(Reply::Unary(payload)),
            }
        }
    }

    async fn setup(params: HostParams) -> (Comms, Arc<Host>, Arc<TestService>, Server) {
        let svc = Arc::new(TestService::default());
        let server = Server::start("127.0.0.1:0", None, svc.clone()).await.unwrap();
        let comms = new_comms();
        let host = comms.registry().add_host(
            PeerId::from_name("test-server"),
            server.local_addr().to_string(),
            None,
            None,
            params,
        );
        (comms, host, svc, server)
    }

    #[tokio::test]
    async fn unary_round_trip() {
        let (comms, host, _svc, _server) = setup(fast_params()).await;
        let peer = host.id();
        let reply: String = comms
            .send(&host, |conn| async move {
                call_unary(conn.as_ref(), peer, "/test/echo", "hello").await
            })
            .await
            .unwrap();
        assert_eq!(reply, "hello");
    }

    #[tokio::test]
    async fn deadline_cancels_call() {
        let (comms, host, _svc, _server) = setup(fast_params()).await;
        let peer = host.id();
        let started = std::time::Instant::now();
        let err = comms
            .send_with_timeout(&host, Duration::from_millis(100), |conn| async move {
                call_unary::<_, u32>(conn.as_ref(), peer, "/test/slow", &7u32).await
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(started.elapsed() < Duration::from_millis(450));
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_failures() {
        let (comms, host, svc, _server) = setup(fast_params()).await;
        let peer = host.id();
        let reply: u32 = comms
            .send_with_retry(&host, |conn| async move {
                call_unary(conn.as_ref(), peer, "/test/flaky", &9u32).await
            })
            .await
            .unwrap();
        assert_eq!(reply, 9);
        assert_eq!(svc.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_surfaces_last_error() {
        let (comms, host, svc, _server) = setup(fast_params()).await;
        let peer = host.id();
        let err = comms
            .send_with_retry(&host, |conn| async move {
                call_unary::<_, u32>(conn.as_ref(), peer, "/test/down", &1u32).await
            })
            .await
            .unwrap_err();
        assert_eq!(svc.calls.load(Ordering::SeqCst), MAX_SEND_ATTEMPTS);
        match err {
            CommsError::Remote { status, .. } => {
                assert_eq!(status.message, format!("attempt {}", MAX_SEND_ATTEMPTS))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn retry_runs_the_handshake_once() {
        let (comms, host, svc, _server) = setup(auth_params()).await;
        let peer = host.id();
        let err = comms
            .send_with_retry(&host, |conn| async move {
                call_unary::<_, u32>(conn.as_ref(), peer, "/test/echo", &1u32).await
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CommsError::Handshake { .. }), "{:?}", err);
        assert!(err.is_retryable());
        assert_eq!(svc.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejected_stream_resets_auth() {
        let (comms, host, _svc, _server) = setup(fast_params()).await;
        let peer = host.id();
        host.mark_authenticated();
        let mut handle = comms
            .stream(&host, "/test/denied", |conn| async move {
                open_stream(conn.as_ref(), peer, "/test/denied", &1u32).await
            })
            .await
            .unwrap();
        let err = handle.header().await.unwrap_err();
        assert!(err.is_remote_unauthenticated());
        assert!(!host.is_authenticated());
    }

    #[tokio::test]
    async fn non_retryable_fails_once() {
        let (comms, host, svc, _server) = setup(fast_params()).await;
        let peer = host.id();
        let err = comms
            .send_with_retry(&host, |conn| async move {
                call_unary::<_, u32>(conn.as_ref(), peer, "/test/broken", &1u32).await
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Remote);
        assert_eq!(svc.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_host_address_is_connectivity_error() {
        let comms = new_comms();
        let mut params = fast_params();
        params.max_retries = 1;
        let host = comms.registry().add_host(
            PeerId::from_name("gone"),
            crate::testutil::closed_address().await,
            None,
            None,
            params,
        );
        let peer = host.id();
        let err = comms
            .send(&host, |conn| async move {
                call_unary::<_, u32>(conn.as_ref(), peer, "/test/echo", &1u32).await
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connectivity);
    }
}
