//! Certificate material for TLS tunnels
//!
//! A TLS tunnel serves a single identity read from one combined PEM file that
//! holds the certificate chain followed by its private key (`server.crt` by
//! default). This crate loads that file and can generate a self-signed one
//! for development.

pub mod self_signed;

pub use self_signed::{
    generate_self_signed_cert, generate_self_signed_cert_with_domains, SelfSignedCertificate,
    SelfSignedError,
};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Well-known location of the combined certificate + key file
pub const DEFAULT_CERT_PATH: &str = "server.crt";

#[derive(Debug, Error)]
pub enum CertError {
    #[error("Certificate file {} is missing", path.display())]
    Missing { path: PathBuf },

    #[error("Failed to read certificate file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse certificates: {0}")]
    InvalidCertificate(String),

    #[error("Failed to parse private key: {0}")]
    InvalidKey(String),

    #[error("No certificate found in PEM data")]
    NoCertificate,

    #[error("No private key found in PEM data")]
    NoPrivateKey,
}

/// Certificate chain with its private key
#[derive(Debug)]
pub struct Certificate {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
}

impl Certificate {
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Self {
        Self {
            cert_chain,
            private_key,
        }
    }

    /// Load a combined certificate + key PEM file
    pub fn load_combined(path: &Path) -> Result<Self, CertError> {
        let pem = std::fs::read(path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                CertError::Missing {
                    path: path.to_path_buf(),
                }
            } else {
                CertError::Read {
                    path: path.to_path_buf(),
                    source: e,
                }
            }
        })?;

        let certificate = Self::from_pem(&pem)?;
        debug!(
            "Loaded {} certificate(s) and private key from {}",
            certificate.cert_chain.len(),
            path.display()
        );
        Ok(certificate)
    }

    /// Parse PEM data holding both the certificate chain and the private key
    pub fn from_pem(pem: &[u8]) -> Result<Self, CertError> {
        let cert_chain = rustls_pemfile::certs(&mut &pem[..])
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CertError::InvalidCertificate(e.to_string()))?;
        if cert_chain.is_empty() {
            return Err(CertError::NoCertificate);
        }

        let private_key = rustls_pemfile::private_key(&mut &pem[..])
            .map_err(|e| CertError::InvalidKey(e.to_string()))?
            .ok_or(CertError::NoPrivateKey)?;

        Ok(Self::new(cert_chain, private_key))
    }
}

/// Load every certificate in a PEM file (used for extra trust anchors)
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, CertError> {
    let pem = std::fs::read(path).map_err(|e| CertError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;

    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertError::InvalidCertificate(e.to_string()))?;
    if certs.is_empty() {
        return Err(CertError::NoCertificate);
    }
    Ok(certs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_combined_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.crt");

        let generated = generate_self_signed_cert().unwrap();
        generated.save_combined(&path).unwrap();

        let loaded = Certificate::load_combined(&path).unwrap();
        assert_eq!(loaded.cert_chain.len(), 1);
        assert_eq!(loaded.cert_chain[0], generated.cert_der);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.crt");

        let err = Certificate::load_combined(&path).unwrap_err();
        assert!(matches!(err, CertError::Missing { .. }));
    }

    #[test]
    fn test_cert_without_key() {
        let generated = generate_self_signed_cert().unwrap();
        let err = Certificate::from_pem(generated.pem_cert.as_bytes()).unwrap_err();
        assert!(matches!(err, CertError::NoPrivateKey));
    }

    #[test]
    fn test_key_without_cert() {
        let generated = generate_self_signed_cert().unwrap();
        let err = Certificate::from_pem(generated.pem_key.as_bytes()).unwrap_err();
        assert!(matches!(err, CertError::NoCertificate));
    }

    #[test]
    fn test_garbage_is_rejected() {
        let err = Certificate::from_pem(b"not a pem file at all").unwrap_err();
        assert!(matches!(err, CertError::NoCertificate));
    }

    #[test]
    fn test_load_certs_for_trust() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ca.pem");

        let generated = generate_self_signed_cert().unwrap();
        std::fs::write(&path, &generated.pem_cert).unwrap();

        let certs = load_certs(&path).unwrap();
        assert_eq!(certs.len(), 1);
    }
}
