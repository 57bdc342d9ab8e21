//! Self-signed certificate generation for development and testing
//!
//! Produces the combined PEM file a TLS tunnel loads at startup, so a tunnel
//! can be tried out without a CA-issued certificate. Clients have to skip
//! verification or trust the generated certificate explicitly.

use rcgen::{CertificateParams, DistinguishedName, SanType};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::io::Write;
use std::net::IpAddr;
use std::path::Path;
use std::time::{Duration, SystemTime};
use thiserror::Error;

use crate::Certificate;

const VALIDITY: Duration = Duration::from_secs(90 * 24 * 60 * 60);

#[derive(Error, Debug)]
pub enum SelfSignedError {
    #[error("Certificate generation failed: {0}")]
    GenerationFailed(String),

    #[error("Key generation failed: {0}")]
    KeyGenerationFailed(String),

    #[error("Invalid subject name {0:?}")]
    InvalidName(String),
}

/// Generate a certificate valid for `localhost`, `127.0.0.1` and `::1`
pub fn generate_self_signed_cert() -> Result<SelfSignedCertificate, SelfSignedError> {
    generate_self_signed_cert_with_domains(&["localhost", "127.0.0.1", "::1"])
}

/// Generate a certificate for the given DNS names and IP addresses
///
/// Entries that parse as IP addresses become IP SANs, everything else a DNS
/// SAN. The first entry is also used as the common name.
///
/// # Example
/// ```no_run
/// use tcp_tunnel_cert::generate_self_signed_cert_with_domains;
///
/// let cert = generate_self_signed_cert_with_domains(&["db.internal"]).unwrap();
/// cert.save_combined("server.crt").unwrap();
/// ```
pub fn generate_self_signed_cert_with_domains<S: AsRef<str>>(
    domains: &[S],
) -> Result<SelfSignedCertificate, SelfSignedError> {
    let mut params = CertificateParams::default();

    let common_name = domains
        .first()
        .map(|d| d.as_ref().to_string())
        .unwrap_or_else(|| "tcp-tunnel".to_string());
    let mut dn = DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, common_name);
    dn.push(rcgen::DnType::OrganizationName, "tcp-tunnel development");
    params.distinguished_name = dn;

    params.subject_alt_names = domains
        .iter()
        .map(|d| subject_alt_name(d.as_ref()))
        .collect::<Result<Vec<_>, _>>()?;

    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_err(|e| SelfSignedError::GenerationFailed(e.to_string()))?;
    params.not_before = time::OffsetDateTime::from_unix_timestamp(now.as_secs() as i64)
        .map_err(|e| SelfSignedError::GenerationFailed(e.to_string()))?;
    params.not_after = time::OffsetDateTime::from_unix_timestamp((now + VALIDITY).as_secs() as i64)
        .map_err(|e| SelfSignedError::GenerationFailed(e.to_string()))?;

    params.serial_number = Some(rcgen::SerialNumber::from(rand::random::<u64>()));

    let key_pair = rcgen::KeyPair::generate()
        .map_err(|e| SelfSignedError::KeyGenerationFailed(e.to_string()))?;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| SelfSignedError::GenerationFailed(e.to_string()))?;

    Ok(SelfSignedCertificate {
        cert_der: CertificateDer::from(cert.der().to_vec()),
        key_der: PrivateKeyDer::try_from(key_pair.serialize_der())
            .map_err(|e| SelfSignedError::KeyGenerationFailed(e.to_string()))?,
        pem_cert: cert.pem(),
        pem_key: key_pair.serialize_pem(),
    })
}

fn subject_alt_name(name: &str) -> Result<SanType, SelfSignedError> {
    if let Ok(ip) = name.parse::<IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    rcgen::Ia5String::try_from(name)
        .map(SanType::DnsName)
        .map_err(|_| SelfSignedError::InvalidName(name.to_string()))
}

/// A self-signed certificate with its private key
pub struct SelfSignedCertificate {
    /// Certificate in DER format
    pub cert_der: CertificateDer<'static>,

    /// Private key in DER format
    pub key_der: PrivateKeyDer<'static>,

    /// Certificate in PEM format
    pub pem_cert: String,

    /// Private key in PEM format
    pub pem_key: String,
}

impl SelfSignedCertificate {
    /// Certificate followed by key, the layout `Certificate::load_combined` reads
    pub fn combined_pem(&self) -> String {
        format!("{}{}", self.pem_cert, self.pem_key)
    }

    /// Write the combined PEM file
    ///
    /// The file holds the private key, so on unix it is created owner-only
    /// (0600).
    pub fn save_combined(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(path)?;
        file.write_all(self.combined_pem().as_bytes())?;
        file.sync_all()
    }

    pub fn into_certificate(self) -> Certificate {
        Certificate::new(vec![self.cert_der], self.key_der)
    }
}
