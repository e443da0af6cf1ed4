//! Server host key and the certificate derived from it

use crate::identity::PeerIdentity;
use crate::HandshakeError;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

/// The server's long-lived identity
///
/// Only the private key is configured. The certificate presented during the
/// handshake is self-signed and regenerated from that key on startup, so
/// clients pin the key fingerprint rather than the certificate.
pub struct ServerKey {
    cert: CertificateDer<'static>,
    key_der: Vec<u8>,
    fingerprint: String,
}

impl ServerKey {
    /// Load a PKCS#8 PEM private key
    ///
    /// `host` ends up as the certificate's common name and subject alternative
    /// name.
    pub fn from_pem(pem: &[u8], host: &str) -> Result<Self, HandshakeError> {
        let pem = std::str::from_utf8(pem)
            .map_err(|_| HandshakeError::InvalidKey("key is not valid UTF-8 PEM".to_string()))?;
        let key_pair =
            KeyPair::from_pem(pem).map_err(|e| HandshakeError::InvalidKey(e.to_string()))?;

        Self::from_key_pair(&key_pair, host)
    }

    /// Generate a fresh key, returning it together with its PEM encoding
    pub fn generate(host: &str) -> Result<(Self, String), HandshakeError> {
        let key_pair = KeyPair::generate().map_err(|e| HandshakeError::InvalidKey(e.to_string()))?;
        let pem = key_pair.serialize_pem();
        Ok((Self::from_key_pair(&key_pair, host)?, pem))
    }

    fn from_key_pair(key_pair: &KeyPair, host: &str) -> Result<Self, HandshakeError> {
        let mut params = CertificateParams::new(vec![host.to_string()])
            .map_err(|e| HandshakeError::InvalidKey(format!("invalid host name {:?}: {}", host, e)))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;

        let cert = params
            .self_signed(key_pair)
            .map_err(|e| HandshakeError::InvalidKey(e.to_string()))?;
        let cert = cert.der().clone();

        let fingerprint = PeerIdentity::from_certificate(&cert)
            .map_err(HandshakeError::InvalidKey)?
            .fingerprint;

        Ok(Self {
            cert,
            key_der: key_pair.serialize_der(),
            fingerprint,
        })
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub(crate) fn certificate(&self) -> CertificateDer<'static> {
        self.cert.clone()
    }

    pub(crate) fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()))
    }
}

impl std::fmt::Debug for ServerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerKey")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pem_round_trip_keeps_fingerprint() {
        let (generated, pem) = ServerKey::generate("relay.local").unwrap();
        let loaded = ServerKey::from_pem(pem.as_bytes(), "other.local").unwrap();

        assert_eq!(generated.fingerprint(), loaded.fingerprint());
    }

    #[test]
    fn test_malformed_key_rejected() {
        let err = ServerKey::from_pem(b"-----BEGIN NONSENSE-----\nabc\n", "relay.local").unwrap_err();
        assert!(matches!(err, HandshakeError::InvalidKey(_)));

        let err = ServerKey::from_pem(&[0xff, 0xfe, 0x00], "relay.local").unwrap_err();
        assert!(matches!(err, HandshakeError::InvalidKey(_)));
    }

    #[test]
    fn test_debug_does_not_leak_key() {
        let (key, pem) = ServerKey::generate("relay.local").unwrap();
        let debug = format!("{:?}", key);
        assert!(debug.contains(key.fingerprint()));
        assert!(!debug.contains(pem.lines().nth(1).unwrap()));
    }
}
