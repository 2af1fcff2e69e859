//! TLS connector construction for `wss://` endpoints
//!
//! Uses the ring crypto provider explicitly so no process-wide default
//! provider has to be installed.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{self, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_tungstenite::Connector;

use crate::error::SessionError;

/// Build the connector for an endpoint
///
/// Plain endpoints get `Connector::Plain`. Secure endpoints verify the server
/// against the bundled web PKI roots unless `verify_peer` is off, in which case
/// any certificate is accepted.
pub fn connector(secure: bool, verify_peer: bool) -> Result<Connector, SessionError> {
    if !secure {
        return Ok(Connector::Plain);
    }

    let provider = Arc::new(crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?;

    let config = if verify_peer {
        let roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
            .with_no_client_auth()
    };

    Ok(Connector::Rustls(Arc::new(config)))
}

/// Certificate verifier used when peer verification is disabled
///
/// Signatures are still checked so the handshake itself stays well-formed.
#[derive(Debug)]
struct AcceptAnyCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_connector() {
        assert!(matches!(connector(false, true).unwrap(), Connector::Plain));
    }

    #[test]
    fn test_secure_connectors_build() {
        assert!(matches!(connector(true, true).unwrap(), Connector::Rustls(_)));
        assert!(matches!(connector(true, false).unwrap(), Connector::Rustls(_)));
    }
}
