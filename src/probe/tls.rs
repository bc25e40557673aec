// src/probe/tls.rs
use super::{ProbeContext, ProbeError};
use crate::registry::{Address, TlsPolicy};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::net::TcpStream;
use tokio_native_tls::{TlsConnector, TlsStream};

/// Connectors keyed by trust configuration, built on first use.
#[derive(Default)]
pub struct TlsConnectors {
    cache: DashMap<(Option<Vec<u8>>, bool), TlsConnector>,
}

impl TlsConnectors {
    pub fn get(&self, policy: &TlsPolicy) -> Result<TlsConnector, ProbeError> {
        let key = (policy.ca_cert_pem.clone(), policy.accepts_invalid_chain());
        if let Some(connector) = self.cache.get(&key) {
            return Ok(connector.clone());
        }

        let connector = build_connector(policy)?;
        self.cache.insert(key, connector.clone());
        Ok(connector)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

fn build_connector(policy: &TlsPolicy) -> Result<TlsConnector, ProbeError> {
    let mut builder = native_tls::TlsConnector::builder();

    if let Some(pem) = &policy.ca_cert_pem {
        let cert = native_tls::Certificate::from_pem(pem)
            .map_err(|e| ProbeError::Internal(format!("invalid CA certificate: {}", e)))?;
        builder.add_root_certificate(cert);
    }

    if policy.accepts_invalid_chain() {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    }

    let connector = builder
        .build()
        .map_err(|e| ProbeError::Internal(format!("failed to build TLS connector: {}", e)))?;
    Ok(TlsConnector::from(connector))
}

pub(crate) async fn handshake(
    connector: &TlsConnector,
    stream: TcpStream,
    address: &Address,
    policy: &TlsPolicy,
    ctx: &ProbeContext,
) -> Result<TlsStream<TcpStream>, ProbeError> {
    let domain = policy.server_name.as_deref().unwrap_or(&address.host);

    let tls = ctx
        .run("tls handshake", connector.connect(domain, stream))
        .await?
        .map_err(|e| classify_handshake_error(&e.to_string()))?;

    if let Some(pin) = &policy.pinned_sha256 {
        verify_pin(&tls, pin)?;
    }

    Ok(tls)
}

fn verify_pin(tls: &TlsStream<TcpStream>, pin: &[u8; 32]) -> Result<(), ProbeError> {
    let cert = tls
        .get_ref()
        .peer_certificate()
        .map_err(|e| ProbeError::Certificate(format!("cannot read peer certificate: {}", e)))?
        .ok_or_else(|| ProbeError::Certificate("peer sent no certificate".into()))?;

    let der = cert
        .to_der()
        .map_err(|e| ProbeError::Certificate(format!("cannot encode peer certificate: {}", e)))?;

    let digest = Sha256::digest(&der);
    if digest.as_slice() != pin {
        return Err(ProbeError::Certificate(format!(
            "pin mismatch: peer certificate sha256 is {}",
            to_hex(digest.as_slice())
        )));
    }
    Ok(())
}

/// native-tls only exposes error text; verification failures name the certificate.
fn classify_handshake_error(message: &str) -> ProbeError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("certificate") || lower.contains("verify") {
        ProbeError::Certificate(message.to_string())
    } else {
        ProbeError::Handshake(message.to_string())
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
