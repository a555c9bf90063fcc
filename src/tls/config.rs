use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::config::TlsSettings;

/// Builds a rustls server configuration from PEM files.
pub fn load_server_config(settings: &TlsSettings) -> anyhow::Result<Arc<ServerConfig>> {
    let certs = load_certs(&settings.cert_path)?;
    let key = load_key(&settings.key_path)?;

    let config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .context("selecting TLS protocol versions")?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("installing server certificate")?;

    Ok(Arc::new(config))
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("Certificate file not found: {:?}", path))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("reading certificates from {:?}", path))?;
    if certs.is_empty() {
        return Err(anyhow!("no certificates in {:?}", path));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("Private key file not found: {:?}", path))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("reading private key from {:?}", path))?
        .ok_or_else(|| anyhow!("no private key in {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn missing_files_are_reported() {
        let settings = TlsSettings {
            cert_path: PathBuf::from("/nonexistent/cert.pem"),
            key_path: PathBuf::from("/nonexistent/key.pem"),
        };
        let err = load_server_config(&settings).unwrap_err();
        assert!(format!("{:#}", err).contains("Certificate file not found"));
    }

    #[test]
    fn pem_without_certificates_is_rejected() {
        let dir = std::env::temp_dir().join(format!("nbhttp-tls-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cert = dir.join("empty.pem");
        std::fs::write(&cert, "not a certificate\n").unwrap();

        let err = load_certs(&cert).unwrap_err();
        assert!(err.to_string().contains("no certificates"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
