//! Client side of the handshake
//!
//! The relay itself never dials out; this is what tunnel clients (and the
//! integration tests) use to reach it.

use crate::identity::PeerIdentity;
use crate::{ensure_crypto_provider, HandshakeError};
use rcgen::{CertificateParams, KeyPair};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;

/// A client key pair and the throwaway certificate carrying its public half
#[derive(Clone)]
pub struct ClientCredentials {
    cert: CertificateDer<'static>,
    key_der: Vec<u8>,
    fingerprint: String,
}

impl ClientCredentials {
    /// Fresh random key
    pub fn generate() -> Result<Self, HandshakeError> {
        let key_pair = KeyPair::generate().map_err(|e| HandshakeError::InvalidKey(e.to_string()))?;
        Self::from_key_pair(&key_pair)
    }

    /// Load a PKCS#8 PEM private key
    pub fn from_pem(pem: &str) -> Result<Self, HandshakeError> {
        let key_pair = KeyPair::from_pem(pem).map_err(|e| HandshakeError::InvalidKey(e.to_string()))?;
        Self::from_key_pair(&key_pair)
    }

    fn from_key_pair(key_pair: &KeyPair) -> Result<Self, HandshakeError> {
        let cert = CertificateParams::new(vec!["wormhole-client".to_string()])
            .and_then(|params| params.self_signed(key_pair))
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

    /// Fingerprint the server will see for this client
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl std::fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Dials the relay
#[derive(Clone)]
pub struct TlsClient {
    connector: TlsConnector,
}

impl TlsClient {
    /// `server_fingerprint` pins the relay's key; `None` trusts any key
    pub fn new(
        credentials: Option<&ClientCredentials>,
        server_fingerprint: Option<String>,
    ) -> Result<Self, HandshakeError> {
        ensure_crypto_provider();

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(ServerKeyVerifier {
                expected: server_fingerprint,
                provider,
            }));

        let config = match credentials {
            Some(credentials) => builder.with_client_auth_cert(
                vec![credentials.cert.clone()],
                PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(credentials.key_der.clone())),
            )?,
            None => builder.with_no_client_auth(),
        };

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }

    pub async fn connect<IO>(
        &self,
        io: IO,
        server_name: &str,
    ) -> Result<tokio_rustls::client::TlsStream<IO>, HandshakeError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| HandshakeError::Protocol(format!("invalid server name: {}", e)))?;

        self.connector
            .connect(name, io)
            .await
            .map_err(HandshakeError::from_tls_io)
    }
}

/// Accepts the relay's self-signed certificate, optionally pinned by key
#[derive(Debug)]
struct ServerKeyVerifier {
    expected: Option<String>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for ServerKeyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let Some(expected) = &self.expected else {
            return Ok(ServerCertVerified::assertion());
        };

        let identity = PeerIdentity::from_certificate(end_entity).map_err(|_| {
            rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding)
        })?;
        if &identity.fingerprint != expected {
            return Err(rustls::Error::General(format!(
                "server key {} does not match pinned {}",
                identity.fingerprint, expected
            )));
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
