//! TLS material: server identity from PEM, client connector pinned to a host certificate.

use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Certificate chain and private key a server presents.
#[derive(Clone)]
pub struct TlsIdentity {
    config: Arc<ServerConfig>,
}

impl TlsIdentity {
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, TlsError> {
        let certs = parse_certs(cert_pem)?;
        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut &key_pem[..])
            .map_err(TlsError::Pem)?
            .ok_or(TlsError::NoPrivateKey)?;
        let config = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub(crate) fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.config.clone())
    }
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TlsIdentity(..)")
    }
}

/// Client connector that trusts exactly the certificates in `cert_pem`.
pub(crate) fn connector(cert_pem: &[u8]) -> Result<TlsConnector, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in parse_certs(cert_pem)? {
        roots.add(cert)?;
    }
    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Server name to verify: the override if given, else the host part of `address`.
pub(crate) fn server_name(
    address: &str,
    name_override: Option<&str>,
) -> Result<ServerName<'static>, TlsError> {
    let name = match name_override {
        Some(n) => n.to_string(),
        None => host_part(address).to_string(),
    };
    ServerName::try_from(name.clone()).map_err(|_| TlsError::InvalidServerName(name))
}

fn host_part(address: &str) -> &str {
    let host = match address.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => host,
        _ => address,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(TlsError::Pem)?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates);
    }
    Ok(certs)
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("invalid PEM: {0}")]
    Pem(std::io::Error),
    #[error("no certificates in PEM")]
    NoCertificates,
    #[error("no private key in PEM")]
    NoPrivateKey,
    #[error("invalid TLS server name {0:?}")]
    InvalidServerName(String),
    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}
