//! Shared test scaffolding: peers, loopback listeners, throwaway certificates.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mix_core::Keypair;
use tokio::net::TcpListener;

use crate::comms::Comms;
use crate::host::{Host, HostParams};
use crate::node::{NodeComms, UnimplementedNode};
use crate::server::Server;

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Short timeouts, two dial attempts, no auto-handshake.
pub(crate) fn fast_params() -> HostParams {
    HostParams {
        max_retries: 2,
        dial_timeout: Duration::from_secs(1),
        send_timeout: Duration::from_secs(2),
        auth_enabled: false,
        ..HostParams::default()
    }
}

/// [`fast_params`] with the auto-handshake on.
pub(crate) fn auth_params() -> HostParams {
    HostParams {
        auth_enabled: true,
        ..fast_params()
    }
}

pub(crate) fn new_comms() -> Comms {
    init_tracing();
    Comms::new(Keypair::generate())
}

/// Register `peer` in `at`'s registry with its real public key.
pub(crate) fn register_peer(at: &Comms, peer: &Comms, address: &str, params: HostParams) -> Arc<Host> {
    at.registry()
        .add_host(peer.id(), address, None, Some(peer.public_key()), params)
}

/// Serve `comms` as a node with no business handlers; only the handshake answers.
pub(crate) async fn start_node(comms: &Comms) -> Server {
    NodeComms::new(comms.clone(), UnimplementedNode)
        .serve("127.0.0.1:0", None)
        .await
        .unwrap()
}

/// Self-signed certificate and key for localhost / 127.0.0.1, PEM encoded.
pub(crate) fn self_signed() -> (String, String) {
    let cert = rcgen::generate_simple_self_signed(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
    ])
    .unwrap();
    (cert.cert.pem(), cert.key_pair.serialize_pem())
}

/// An address nothing listens on.
pub(crate) async fn closed_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    addr
}

/// A listener that accepts and holds connections, counting them.
pub(crate) async fn counting_listener() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((sock, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            held.push(sock);
        }
    });
    (addr, accepted)
}
