//! Server side of the handshake

use crate::identity::PeerIdentity;
use crate::key::ServerKey;
use crate::{ensure_crypto_provider, HandshakeError};
use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;
use tracing::debug;

/// Encrypted, authenticated server side stream
pub type SecureStream<IO> = tokio_rustls::server::TlsStream<IO>;

/// Runs the server half of the handshake on accepted connections
#[derive(Clone)]
pub struct TlsHandshake {
    acceptor: TlsAcceptor,
    fingerprint: String,
    timeout: Duration,
}

impl TlsHandshake {
    pub fn new(key: &ServerKey) -> Result<Self, HandshakeError> {
        ensure_crypto_provider();

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ServerConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_client_cert_verifier(Arc::new(AnyClientKey { provider }))
            .with_single_cert(vec![key.certificate()], key.private_key())?;

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
            fingerprint: key.fingerprint().to_string(),
            timeout: Duration::from_secs(10),
        })
    }

    /// Give up on peers that do not finish the handshake in time
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Fingerprint of the key clients should expect
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Perform the handshake and return the stream with the peer's identity
    pub async fn accept<IO>(&self, io: IO) -> Result<(SecureStream<IO>, PeerIdentity), HandshakeError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let stream = tokio::time::timeout(self.timeout, self.acceptor.accept(io))
            .await
            .map_err(|_| HandshakeError::Timeout)?
            .map_err(HandshakeError::from_tls_io)?;

        let (_, conn) = stream.get_ref();
        let cert = conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .ok_or_else(|| HandshakeError::AuthenticationFailed("no client certificate".to_string()))?;
        let identity =
            PeerIdentity::from_certificate(cert).map_err(HandshakeError::AuthenticationFailed)?;

        debug!("Handshake complete, client key {}", identity.fingerprint);
        Ok((stream, identity))
    }
}

/// Requires a client certificate but accepts any well-formed one
///
/// The handshake still proves possession of the private key through the
/// CertificateVerify signature. Whether that key is welcome is decided later
/// by the authorization policy.
#[derive(Debug)]
struct AnyClientKey {
    provider: Arc<CryptoProvider>,
}

impl ClientCertVerifier for AnyClientKey {
    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        x509_parser::parse_x509_certificate(end_entity.as_ref()).map_err(|_| {
            rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding)
        })?;
        Ok(ClientCertVerified::assertion())
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
