//! TLS utilities for peer connections
//!
//! Provides certificate loading, key loading, and rustls configuration
//! builders for TLS and mTLS between Diameter peers. Credential material is
//! treated as opaque PEM files.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};

use crate::config::TlsConfig;
use crate::error::{AgentError, AgentResult};

/// Get the ring crypto provider.
fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Load PEM-encoded certificates from a file path.
pub fn load_certs(path: &str) -> AgentResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| AgentError::BadCredentials(format!("failed to open cert file {path}: {e}")))?;
    let mut reader = BufReader::new(file);

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AgentError::BadCredentials(format!("failed to parse certs from {path}: {e}")))?;

    if certs.is_empty() {
        return Err(AgentError::BadCredentials(format!(
            "no certificates found in {path}"
        )));
    }

    Ok(certs)
}

/// Load a PEM-encoded private key from a file path.
pub fn load_private_key(path: &str) -> AgentResult<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| AgentError::BadCredentials(format!("failed to open key file {path}: {e}")))?;
    let mut reader = BufReader::new(file);

    let key = rustls_pemfile::private_key(&mut reader)
        .map_err(|e| AgentError::BadCredentials(format!("failed to parse key from {path}: {e}")))?
        .ok_or_else(|| AgentError::BadCredentials(format!("no private key found in {path}")))?;

    Ok(key)
}

/// Build a `RootCertStore` from a CA certificate file, or webpki roots.
fn load_root_store(ca_path: Option<&str>) -> AgentResult<RootCertStore> {
    let mut root_store = RootCertStore::empty();
    match ca_path {
        Some(ca) => {
            for cert in load_certs(ca)? {
                root_store
                    .add(cert)
                    .map_err(|e| AgentError::BadCredentials(format!("failed to add CA cert: {e}")))?;
            }
        }
        None => {
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
    }
    Ok(root_store)
}

/// Build the acceptor-side TLS config from agent credential material.
///
/// Diameter peers normally authenticate mutually; `require_client_cert`
/// selects between mTLS and server-auth-only.
pub fn build_server_config(tls: &TlsConfig) -> AgentResult<ServerConfig> {
    let certs = load_certs(&tls.cert_path)?;
    let key = load_private_key(&tls.key_path)?;

    let builder = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| AgentError::Tls(format!("failed to set protocol versions: {e}")))?;

    let config = if tls.require_client_cert {
        let root_store = load_root_store(tls.ca_path.as_deref())?;
        let client_verifier = WebPkiClientVerifier::builder(Arc::new(root_store))
            .build()
            .map_err(|e| AgentError::Tls(format!("failed to build client verifier: {e}")))?;
        builder
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(certs, key)
            .map_err(|e| AgentError::Tls(format!("failed to build mTLS server config: {e}")))?
    } else {
        builder
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| AgentError::Tls(format!("failed to build server TLS config: {e}")))?
    };

    Ok(config)
}

/// Build the initiator-side TLS config, offering our certificate to the
/// remote peer.
pub fn build_client_config(tls: &TlsConfig, insecure_skip_verify: bool) -> AgentResult<ClientConfig> {
    let certs = load_certs(&tls.cert_path)?;
    let key = load_private_key(&tls.key_path)?;
    let root_store = load_root_store(tls.ca_path.as_deref())?;

    let mut config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| AgentError::Tls(format!("failed to set protocol versions: {e}")))?
        .with_root_certificates(root_store)
        .with_client_auth_cert(certs, key)
        .map_err(|e| AgentError::Tls(format!("failed to set client cert: {e}")))?;

    if insecure_skip_verify {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoCertificateVerification));
    }

    Ok(config)
}

/// Dangerous: skip all server certificate verification (for testing only).
#[derive(Debug)]
struct NoCertificateVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::ED448,
        ]
    }
}
