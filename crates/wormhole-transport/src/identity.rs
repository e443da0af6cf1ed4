//! Peer identity extracted from a presented certificate

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use rustls::pki_types::CertificateDer;
use sha2::{Digest, Sha256};

/// Public key fingerprint in the familiar `SHA256:<base64>` form
pub fn fingerprint(public_key_der: &[u8]) -> String {
    format!("SHA256:{}", STANDARD_NO_PAD.encode(Sha256::digest(public_key_der)))
}

/// The authenticated public key of a connected peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    /// DER encoded SubjectPublicKeyInfo
    pub public_key: Vec<u8>,
    pub fingerprint: String,
    /// Certificate subject, informational only
    pub subject: String,
}

impl PeerIdentity {
    pub fn from_certificate(cert: &CertificateDer<'_>) -> Result<Self, String> {
        let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref())
            .map_err(|e| format!("malformed certificate: {}", e))?;

        let public_key = parsed.public_key().raw.to_vec();
        Ok(Self {
            fingerprint: fingerprint(&public_key),
            subject: parsed.subject().to_string(),
            public_key,
        })
    }
}

impl std::fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.fingerprint)
    }
}
