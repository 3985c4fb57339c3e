//! TLS contexts for secure connections

use crate::error::{NetworkError, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls::{self, ClientConfig, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// TLS configuration for client and server
///
/// Servers need a certificate chain and key; clients need a trust policy.
/// Either side may instead supply a prebuilt rustls config.
#[derive(Clone)]
pub struct TlsConfig {
    server_config: Option<Arc<ServerConfig>>,
    client_config: Option<Arc<ClientConfig>>,
    server_name: Option<ServerName<'static>>,
}

impl TlsConfig {
    /// Create an empty configuration
    ///
    /// Installs the ring crypto provider as process default if none is set.
    #[must_use]
    pub fn new() -> Self {
        let _ = rustls::crypto::ring::default_provider().install_default();

        Self {
            server_config: None,
            client_config: None,
            server_name: None,
        }
    }

    /// Load the server certificate chain and private key from PEM files
    pub fn with_server_cert_file(
        self,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let certs = parse_certs(BufReader::new(open(cert_path.as_ref())?))?;
        let key = parse_private_key(BufReader::new(open(key_path.as_ref())?))?;
        self.with_server_identity(certs, key)
    }

    /// Load the server certificate chain and private key from PEM bytes
    pub fn with_server_cert_pem(self, cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let certs = parse_certs(cert_pem)?;
        let key = parse_private_key(key_pem)?;
        self.with_server_identity(certs, key)
    }

    fn with_server_identity(
        mut self,
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self> {
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| NetworkError::tls(format!("Invalid server certificate: {}", e)))?;

        self.server_config = Some(Arc::new(config));
        Ok(self)
    }

    /// Use a caller-built server context
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_server_config(mut self, config: Arc<ServerConfig>) -> Self {
        self.server_config = Some(config);
        self
    }

    /// Accept any server certificate.
    ///
    /// Handshake signatures are still verified, but the certificate chain and
    /// name are not. Suitable for tests and closed networks only.
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_client_trust_all(mut self) -> Self {
        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(TrustAll::new()))
            .with_no_client_auth();

        self.client_config = Some(Arc::new(config));
        self
    }

    /// Trust the CA certificates in a PEM file
    pub fn with_client_ca_file(self, ca_path: impl AsRef<Path>) -> Result<Self> {
        let certs = parse_certs(BufReader::new(open(ca_path.as_ref())?))?;
        self.with_client_roots(certs)
    }

    /// Trust the CA certificates in PEM bytes
    pub fn with_client_ca_pem(self, ca_pem: &[u8]) -> Result<Self> {
        let certs = parse_certs(ca_pem)?;
        self.with_client_roots(certs)
    }

    fn with_client_roots(mut self, certs: Vec<CertificateDer<'static>>) -> Result<Self> {
        let mut roots = rustls::RootCertStore::empty();
        for cert in certs {
            roots
                .add(cert)
                .map_err(|e| NetworkError::tls(format!("Invalid CA certificate: {}", e)))?;
        }

        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        self.client_config = Some(Arc::new(config));
        Ok(self)
    }

    /// Use a caller-built client context
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_client_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.client_config = Some(config);
        self
    }

    /// Name presented and verified by clients; defaults to the connect IP
    pub fn with_server_name(mut self, name: impl Into<String>) -> Result<Self> {
        let name = ServerName::try_from(name.into())
            .map_err(|e| NetworkError::tls(format!("Invalid server name: {}", e)))?;
        self.server_name = Some(name);
        Ok(self)
    }

    /// TLS acceptor for servers
    #[must_use]
    pub fn acceptor(&self) -> Option<TlsAcceptor> {
        self.server_config
            .as_ref()
            .map(|config| TlsAcceptor::from(Arc::clone(config)))
    }

    /// TLS connector for clients
    #[must_use]
    pub fn connector(&self) -> Option<TlsConnector> {
        self.client_config
            .as_ref()
            .map(|config| TlsConnector::from(Arc::clone(config)))
    }

    #[must_use]
    pub fn has_server_config(&self) -> bool {
        self.server_config.is_some()
    }

    #[must_use]
    pub fn has_client_config(&self) -> bool {
        self.client_config.is_some()
    }

    /// Name the client sends when connecting to `address`
    #[must_use]
    pub fn server_name_for(&self, address: &SocketAddr) -> ServerName<'static> {
        self.server_name
            .clone()
            .unwrap_or_else(|| ServerName::IpAddress(address.ip().into()))
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("server", &self.has_server_config())
            .field("client", &self.has_client_config())
            .field("server_name", &self.server_name)
            .finish()
    }
}

fn open(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| {
        NetworkError::tls(format!("Failed to open '{}': {}", path.display(), e))
    })
}

fn parse_certs(mut reader: impl std::io::BufRead) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| NetworkError::tls(format!("Failed to parse certificates: {}", e)))?;

    if certs.is_empty() {
        return Err(NetworkError::tls("No certificates found in PEM data"));
    }
    Ok(certs)
}

fn parse_private_key(mut reader: impl std::io::BufRead) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| NetworkError::tls(format!("Failed to parse private key: {}", e)))?
        .ok_or_else(|| NetworkError::tls("No private key found in PEM data"))
}

/// Verifier accepting any certificate chain
#[derive(Debug)]
struct TrustAll {
    algorithms: rustls::crypto::WebPkiSupportedAlgorithms,
}

impl TrustAll {
    fn new() -> Self {
        Self {
            algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl rustls::client::danger::ServerCertVerifier for TrustAll {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
