//! Mutually authenticated TLS for the peer listener
//!
//! Handshakes only complete for clients presenting a certificate issued by
//! the configured CA. The certificate's common name, or its first DNS name
//! when it has none, is the KME id the connection speaks for.

use crate::config::ServerTlsSettings;
use crate::error::{KmeError, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use std::path::Path;
use std::sync::Arc;
use x509_parser::prelude::*;

/// KME id proven by the client certificate of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity(pub String);

fn config_error(what: String, err: impl std::fmt::Display) -> KmeError {
    KmeError::Configuration(format!("{what}: {err}"))
}

async fn read_pem(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|e| config_error(format!("cannot read {}", path.display()), e))
}

fn parse_certs(pem: &[u8], path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| config_error(format!("bad certificate in {}", path.display()), e))?;
    if certs.is_empty() {
        return Err(KmeError::Configuration(format!(
            "no certificate in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Server configuration that requires a client certificate issued by
/// `client_ca_path`
pub async fn load_server_config(settings: &ServerTlsSettings) -> Result<Arc<ServerConfig>> {
    let chain = parse_certs(&read_pem(&settings.cert_path).await?, &settings.cert_path)?;

    let key_pem = read_pem(&settings.key_path).await?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| config_error(format!("bad key in {}", settings.key_path.display()), e))?
        .ok_or_else(|| {
            KmeError::Configuration(format!("no private key in {}", settings.key_path.display()))
        })?;

    let mut roots = RootCertStore::empty();
    let ca_pem = read_pem(&settings.client_ca_path).await?;
    for ca in parse_certs(&ca_pem, &settings.client_ca_path)? {
        roots
            .add(ca)
            .map_err(|e| config_error("invalid client CA certificate".to_string(), e))?;
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()
        .map_err(|e| config_error("client certificate verifier".to_string(), e))?;

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| config_error("TLS protocol versions".to_string(), e))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(chain, key)
        .map_err(|e| config_error("server certificate".to_string(), e))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

/// KME id named by a client certificate
pub fn certificate_identity(der: &CertificateDer<'_>) -> Result<String> {
    let (_, cert) = X509Certificate::from_der(der.as_ref())
        .map_err(|e| KmeError::Unauthorized(format!("unreadable client certificate: {e}")))?;

    if let Some(name) = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
    {
        return Ok(name.to_string());
    }

    let alt_names = cert
        .subject_alternative_name()
        .map_err(|e| KmeError::Unauthorized(format!("bad client certificate names: {e}")))?;
    alt_names
        .and_then(|ext| {
            ext.value.general_names.iter().find_map(|name| match name {
                GeneralName::DNSName(dns) => Some(dns.to_string()),
                _ => None,
            })
        })
        .ok_or_else(|| KmeError::Unauthorized("client certificate names no KME".to_string()))
}
