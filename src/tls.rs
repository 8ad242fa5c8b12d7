use anyhow::{Context, Result, anyhow};
use rustls_pemfile::{certs, private_key};
use std::{fs::File, io::BufReader, sync::Arc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;

use crate::config::TlsConfig;

/// Builds the acceptor used to terminate TLS in front of the WebSocket endpoint.
pub fn load_tls_acceptor(tls_config: &TlsConfig) -> Result<TlsAcceptor> {
    let cert_chain = load_certificates(&tls_config.cert_file)?;
    let key = load_private_key(&tls_config.key_file)?;

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .context("Failed to create TLS server config")?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn load_certificates(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("Failed to open certificate file: {path}"))?;
    let chain = certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse certificate file: {path}"))?;

    if chain.is_empty() {
        return Err(anyhow!("No certificates found in {path}"));
    }
    Ok(chain)
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("Failed to open private key file: {path}"))?;
    private_key(&mut BufReader::new(file))
        .with_context(|| format!("Failed to parse private key file: {path}"))?
        .ok_or_else(|| anyhow!("No private key found in {path}"))
}
