//! TLS client wrapping for hops reached over HTTPS.
//!
//! Two connectors are built on first use and shared by every dial: one that
//! verifies the hop's certificate against the webpki roots and one that
//! accepts any certificate (`insecure-skip`).

use crate::dial::{split_host_port, BoxedConn};
use crate::error::{ProxyError, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::sync::{Arc, OnceLock};
use tokio_rustls::TlsConnector;
use tracing::debug;

static VERIFIED: OnceLock<std::result::Result<TlsConnector, String>> = OnceLock::new();
static UNVERIFIED: OnceLock<std::result::Result<TlsConnector, String>> = OnceLock::new();

/// Run a TLS client handshake over `conn`, using the host part of `addr`
/// as the server name.
pub async fn wrap(conn: BoxedConn, addr: &str, insecure_skip_verify: bool) -> Result<BoxedConn> {
    let (host, _) = split_host_port(addr)?;
    let server_name =
        ServerName::try_from(host.to_string()).map_err(|_| ProxyError::InvalidServerName {
            addr: addr.to_string(),
        })?;

    let connector = connector(insecure_skip_verify)?;
    debug!(
        addr = addr,
        insecure_skip_verify = insecure_skip_verify,
        "starting TLS handshake with proxy hop"
    );
    let stream = connector
        .connect(server_name, conn)
        .await
        .map_err(|e| ProxyError::Tls {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;
    Ok(Box::new(stream))
}

fn connector(insecure_skip_verify: bool) -> Result<TlsConnector> {
    let cell = if insecure_skip_verify {
        &UNVERIFIED
    } else {
        &VERIFIED
    };
    cell.get_or_init(|| build_connector(insecure_skip_verify))
        .clone()
        .map_err(|e| ProxyError::Config(format!("TLS config error: {}", e)))
}

// Ring is named explicitly so a second provider elsewhere in the
// dependency tree cannot make the choice ambiguous.
fn build_connector(insecure_skip_verify: bool) -> std::result::Result<TlsConnector, String> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| e.to_string())?;

    let config = if insecure_skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipVerification(provider)))
            .with_no_client_auth()
    } else {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder
            .with_root_certificates(root_store)
            .with_no_client_auth()
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Accepts any server certificate. Handshake signatures are still checked
/// so the peer must hold the key for the certificate it presents.
#[derive(Debug)]
struct SkipVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
