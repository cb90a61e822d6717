//! Client TLS configuration.

use std::fs::File;
use std::io::BufReader;
use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;

use extidx_core::{ProtocolError, ProtocolResult};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, ring, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme, StreamOwned};

/// TLS stream over a blocking socket.
pub type TlsStream = StreamOwned<ClientConnection, TcpStream>;

/// Builds the rustls client configuration.
///
/// With a CA bundle the server certificate is verified against it;
/// otherwise any certificate is accepted.
pub(crate) fn client_config(ca_file: Option<&Path>) -> ProtocolResult<Arc<rustls::ClientConfig>> {
    let provider = Arc::new(ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(config_error)?;

    let config = match ca_file {
        Some(path) => builder
            .with_root_certificates(load_roots(path)?)
            .with_no_client_auth(),
        None => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)))
            .with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

/// Runs the TLS handshake to completion over `tcp`.
pub(crate) fn handshake(
    config: Arc<rustls::ClientConfig>,
    host: &str,
    mut tcp: TcpStream,
) -> ProtocolResult<TlsStream> {
    let name = ServerName::try_from(host.to_string()).map_err(config_error)?;
    let mut conn = ClientConnection::new(config, name).map_err(handshake_error)?;
    while conn.is_handshaking() {
        conn.complete_io(&mut tcp).map_err(handshake_error)?;
    }
    Ok(StreamOwned::new(conn, tcp))
}

fn load_roots(path: &Path) -> ProtocolResult<RootCertStore> {
    let file = File::open(path)
        .map_err(|e| config_error(format!("cannot open {}: {e}", path.display())))?;
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut BufReader::new(file)) {
        roots.add(cert.map_err(config_error)?).map_err(config_error)?;
    }
    if roots.is_empty() {
        return Err(config_error(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(roots)
}

fn config_error(detail: impl ToString) -> ProtocolError {
    ProtocolError::TlsConfig {
        detail: detail.to_string(),
    }
}

fn handshake_error(detail: impl ToString) -> ProtocolError {
    ProtocolError::TlsHandshake {
        detail: detail.to_string(),
    }
}

/// Accepts every server certificate but still checks handshake signatures.
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
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
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_config_without_roots() {
        assert!(client_config(None).is_ok());
    }

    #[test]
    fn test_missing_ca_file() {
        let err = client_config(Some(Path::new("/nonexistent/ca.pem"))).unwrap_err();
        assert!(matches!(err, ProtocolError::TlsConfig { .. }));
    }

    #[test]
    fn test_empty_ca_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not a certificate\n").unwrap();
        let err = client_config(Some(file.path())).unwrap_err();
        assert!(err.to_string().starts_with("external index: tls configuration error"));
    }

    #[test]
    fn test_ca_file_from_rcgen() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(cert.cert.pem().as_bytes()).unwrap();
        assert!(client_config(Some(file.path())).is_ok());
    }
}
