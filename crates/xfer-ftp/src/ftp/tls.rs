//! TLS for explicit and implicit FTPS (RFC 4217).
//!
//! - [`TlsSession`] one rustls client config per control connection. Data
//!   connections reuse it so their handshakes can resume the control
//!   connection's session.
//! - [`RecordingVerifier`] runs the normal WebPKI checks but never fails the
//!   handshake; the result is recorded and the user decides on untrusted
//!   certificates.

use crate::ftp::backend::Stream;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, Error as TlsError, HandshakeKind, RootCertStore, SignatureScheme};
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use xfer_core::error::{EngineError, EngineResult};
use xfer_core::notification::CertificateInfo;

/// `AB:CD:...` SHA-256 fingerprint of a DER certificate.
pub fn fingerprint_sha256(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    hex::encode_upper(digest)
        .as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).into_owned())
        .collect::<Vec<_>>()
        .join(":")
}

fn native_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    let loaded = rustls_native_certs::load_native_certs();
    for err in &loaded.errors {
        log::debug!(target: crate::ftp::LOG_TARGET, "Skipping system certificate source: {}", err);
    }
    let (added, ignored) = roots.add_parsable_certificates(loaded.certs);
    log::debug!(target: crate::ftp::LOG_TARGET, "Loaded {} system roots ({} ignored)", added, ignored);
    roots
}

#[derive(Debug)]
pub struct RecordingVerifier {
    inner: Option<Arc<WebPkiServerVerifier>>,
    algorithms: WebPkiSupportedAlgorithms,
    /// Error from the last certificate check, `None` when it passed.
    last_error: Mutex<Option<String>>,
}

impl RecordingVerifier {
    fn new(roots: RootCertStore, provider: Arc<rustls::crypto::CryptoProvider>) -> Self {
        let algorithms = provider.signature_verification_algorithms;
        let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider)
            .build()
            .map_err(|e| log::debug!(target: crate::ftp::LOG_TARGET, "No certificate verifier: {}", e))
            .ok();
        Self {
            inner,
            algorithms,
            last_error: Mutex::new(None),
        }
    }

    pub fn take_error(&self) -> Option<String> {
        self.last_error.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn record(&self, error: Option<String>) {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = error;
    }
}

impl ServerCertVerifier for RecordingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        let outcome = match &self.inner {
            Some(inner) => inner
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
                .err()
                .map(|e| e.to_string()),
            None => Some("no trusted root certificates available".to_string()),
        };
        self.record(outcome);
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Result of a control-connection handshake.
#[derive(Debug)]
pub struct Handshake {
    pub stream: Stream,
    pub certificate: CertificateInfo,
    pub verified: bool,
}

/// Client TLS state shared by a control connection and its data connections.
#[derive(Debug, Clone)]
pub struct TlsSession {
    config: Arc<ClientConfig>,
    verifier: Arc<RecordingVerifier>,
    host: String,
    port: u16,
    /// Leaf fingerprint presented on the control connection.
    control_fingerprint: Arc<Mutex<Option<String>>>,
}

impl TlsSession {
    pub fn new(host: &str, port: u16) -> EngineResult<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let verifier = Arc::new(RecordingVerifier::new(native_roots(), provider.clone()));
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| EngineError::tls_failed(format!("TLS setup failed: {}", e)))?
            .dangerous()
            .with_custom_certificate_verifier(verifier.clone())
            .with_no_client_auth();
        Ok(Self {
            config: Arc::new(config),
            verifier,
            host: host.to_string(),
            port,
            control_fingerprint: Arc::new(Mutex::new(None)),
        })
    }

    fn server_name(&self) -> EngineResult<ServerName<'static>> {
        ServerName::try_from(self.host.clone())
            .map_err(|e| EngineError::tls_failed(format!("Invalid TLS server name \"{}\": {}", self.host, e)))
    }

    async fn connect(&self, tcp: TcpStream) -> EngineResult<tokio_rustls::client::TlsStream<TcpStream>> {
        let connector = TlsConnector::from(self.config.clone());
        connector
            .connect(self.server_name()?, tcp)
            .await
            .map_err(|e| EngineError::tls_failed(format!("TLS handshake failed: {}", e)))
    }

    /// Handshake on the control connection, recording what was presented.
    pub async fn handshake_control(&self, tcp: TcpStream) -> EngineResult<Handshake> {
        let tls = self.connect(tcp).await?;
        let verify_error = self.verifier.take_error();
        let conn = tls.get_ref().1;
        let chain_der: Vec<Vec<u8>> = conn
            .peer_certificates()
            .map(|certs| certs.iter().map(|c| c.as_ref().to_vec()).collect())
            .unwrap_or_default();
        let Some(leaf) = chain_der.first() else {
            return Err(EngineError::tls_failed("Server did not present a certificate"));
        };
        let fingerprint = fingerprint_sha256(leaf);
        *self.control_fingerprint.lock().unwrap_or_else(|e| e.into_inner()) = Some(fingerprint.clone());
        let certificate = CertificateInfo {
            host: self.host.clone(),
            port: self.port,
            fingerprint_sha256: fingerprint,
            protocol: conn
                .protocol_version()
                .map(|v| format!("{:?}", v))
                .unwrap_or_default(),
            cipher: conn
                .negotiated_cipher_suite()
                .map(|s| format!("{:?}", s.suite()))
                .unwrap_or_default(),
            chain_der,
            verify_error: verify_error.clone(),
        };
        Ok(Handshake {
            stream: Stream::Tls(Box::new(tls)),
            certificate,
            verified: verify_error.is_none(),
        })
    }

    /// Handshake on a data connection. The certificate must be the one the
    /// control connection presented. Returns whether the session resumed.
    pub async fn handshake_data(&self, tcp: TcpStream) -> EngineResult<(Stream, bool)> {
        let tls = self.connect(tcp).await?;
        let _ = self.verifier.take_error();
        let conn = tls.get_ref().1;
        let presented = conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|c| fingerprint_sha256(c.as_ref()));
        let expected = self.control_fingerprint.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if presented.is_some() && expected.is_some() && presented != expected {
            return Err(EngineError::tls_failed(
                "Data connection presented a different certificate than the control connection",
            ));
        }
        let resumed = conn.handshake_kind() == Some(HandshakeKind::Resumed);
        Ok((Stream::Tls(Box::new(tls)), resumed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_format() {
        let fp = fingerprint_sha256(b"abc");
        assert_eq!(fp.len(), 32 * 3 - 1);
        assert!(fp.starts_with("BA:78:16:BF"));
    }

    #[test]
    fn session_rejects_bad_server_name() {
        let session = TlsSession::new("bad name with spaces", 21).unwrap();
        assert!(session.server_name().is_err());
        let ok = TlsSession::new("127.0.0.1", 990).unwrap();
        assert!(ok.server_name().is_ok());
    }
}
