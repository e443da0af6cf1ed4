//! Authenticated transport for tunnel connections
//!
//! Every physical connection starts with a TLS 1.3 handshake in which both
//! sides present a certificate. The server's certificate is derived from its
//! long-lived private key. The client's certificate is only a carrier for its
//! public key: the key is what gets authorized, the certificate chain is never
//! checked against any CA.

pub mod client;
pub mod identity;
pub mod key;
pub mod server;

pub use client::{ClientCredentials, TlsClient};
pub use identity::{fingerprint, PeerIdentity};
pub use key::ServerKey;
pub use server::{SecureStream, TlsHandshake};

use std::io;
use thiserror::Error;

/// Handshake errors
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Invalid private key: {0}")]
    InvalidKey(String),

    #[error("TLS configuration error: {0}")]
    Config(#[from] rustls::Error),

    #[error("Peer authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("TLS protocol error: {0}")]
    Protocol(String),

    #[error("Handshake timed out")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl HandshakeError {
    /// Sort an error coming out of tokio-rustls
    ///
    /// TLS failures surface as `InvalidData` I/O errors wrapping the rustls
    /// error, anything else is a plain transport failure.
    pub(crate) fn from_tls_io(err: io::Error) -> Self {
        let tls = err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<rustls::Error>());

        match tls {
            Some(
                e @ (rustls::Error::NoCertificatesPresented
                | rustls::Error::InvalidCertificate(_)
                | rustls::Error::AlertReceived(rustls::AlertDescription::CertificateRequired)
                | rustls::Error::AlertReceived(rustls::AlertDescription::BadCertificate)),
            ) => HandshakeError::AuthenticationFailed(e.to_string()),
            Some(e) => HandshakeError::Protocol(e.to_string()),
            None => HandshakeError::Io(err),
        }
    }
}

/// Ensure rustls crypto provider is installed (only once)
pub fn ensure_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_missing_certificate() {
        let err = io::Error::new(io::ErrorKind::InvalidData, rustls::Error::NoCertificatesPresented);
        assert!(matches!(
            HandshakeError::from_tls_io(err),
            HandshakeError::AuthenticationFailed(_)
        ));
    }

    #[test]
    fn test_classify_garbage_as_protocol_error() {
        let err = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::InvalidMessage(rustls::InvalidMessage::InvalidContentType),
        );
        assert!(matches!(
            HandshakeError::from_tls_io(err),
            HandshakeError::Protocol(_)
        ));
    }

    #[test]
    fn test_classify_plain_io_error() {
        let err = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        match HandshakeError::from_tls_io(err) {
            HandshakeError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("unexpected {:?}", other),
        }
    }
}
