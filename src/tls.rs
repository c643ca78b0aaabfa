use crate::certs::CertificateBundle;
use crate::error::{OtaError, Result};
use axum_server::tls_rustls::RustlsConfig;
use rustls::crypto::{ring::default_provider, CryptoProvider};
use rustls::pki_types::CertificateDer;
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

/// Builds the HTTPS listener config from a provisioned PEM pair.
/// Accepts PKCS#8, PKCS#1 (openssl) and SEC1 (tailscale) keys.
pub fn load_rustls_config(bundle: &CertificateBundle) -> Result<RustlsConfig> {
    // rustls 0.23 needs a process-wide provider; a second install is a no-op error.
    let _ = CryptoProvider::install_default(default_provider());

    if !bundle.exists {
        return Err(OtaError::Tls(format!(
            "certificate not available at {}",
            bundle.cert_path.display()
        )));
    }

    let cert_file = File::open(&bundle.cert_path)
        .map_err(|e| OtaError::Tls(format!("Failed to open cert file: {}", e)))?;
    let cert_chain: Vec<CertificateDer> = certs(&mut BufReader::new(cert_file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| OtaError::Tls(format!("Failed to parse certificates: {}", e)))?;

    if cert_chain.is_empty() {
        return Err(OtaError::Tls("No certificates found".to_string()));
    }

    let key_file = File::open(&bundle.key_path)
        .map_err(|e| OtaError::Tls(format!("Failed to open key file: {}", e)))?;
    let key = private_key(&mut BufReader::new(key_file))
        .map_err(|e| OtaError::Tls(format!("Failed to parse private key: {}", e)))?
        .ok_or_else(|| OtaError::Tls("No private key found".to_string()))?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| OtaError::Tls(format!("Failed to build TLS config: {}", e)))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(RustlsConfig::from_config(Arc::new(config)))
}
