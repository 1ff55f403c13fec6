//! HTTP client towards the backend target
//!
//! Dev backends are routinely served with self-signed certificates, so
//! certificate verification is off unless `secure` is requested.

use crate::middleware::ProxyBody;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Client used for forwarded HTTP requests
pub type HttpClient = Client<HttpsConnector<HttpConnector>, ProxyBody>;

/// Accepts any server certificate.
#[derive(Debug)]
pub struct NoVerifier {
    schemes: Vec<rustls::SignatureScheme>,
}

impl NoVerifier {
    fn new(provider: &rustls::crypto::CryptoProvider) -> Self {
        Self {
            schemes: provider.signature_verification_algorithms.supported_schemes(),
        }
    }
}

impl ServerCertVerifier for NoVerifier {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.schemes.clone()
    }
}

/// Build the rustls client configuration shared by HTTP and upgrade forwarding
pub fn tls_client_config(secure: bool) -> Result<Arc<ClientConfig>, rustls::Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?;

    let config = if secure {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        warn!("TLS certificate verification disabled for the proxy target");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier::new(&provider)))
            .with_no_client_auth()
    };

    Ok(Arc::new(config))
}

/// Create the pooled client used to forward plain HTTP requests
pub fn create_http_client(tls: &Arc<ClientConfig>) -> HttpClient {
    let mut http_connector = HttpConnector::new();
    http_connector.set_nodelay(true);
    http_connector.enforce_http(false);

    let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(ClientConfig::clone(tls))
        .https_or_http()
        .enable_http1()
        .wrap_connector(http_connector);

    let client = Client::builder(TokioExecutor::new())
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .build(https_connector);

    debug!("Proxy HTTP client initialized");
    client
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_verifier_supports_common_schemes() {
        let verifier = NoVerifier::new(&rustls::crypto::ring::default_provider());
        let schemes = verifier.supported_verify_schemes();
        assert!(schemes.contains(&rustls::SignatureScheme::RSA_PKCS1_SHA256));
        assert!(schemes.contains(&rustls::SignatureScheme::ECDSA_NISTP256_SHA256));
        assert!(schemes.contains(&rustls::SignatureScheme::ED25519));
    }

    #[test]
    fn test_tls_configs_build() {
        assert!(tls_client_config(false).is_ok());
        assert!(tls_client_config(true).is_ok());
    }

    #[tokio::test]
    async fn test_client_creation() {
        let tls = tls_client_config(false).unwrap();
        let _client = create_http_client(&tls);
    }
}
