//! TLS configuration and certificate material for qback.
//!
//! qback uses mutual TLS: the server requires a client certificate and both
//! peers verify each other against the same CA bundle. Material is read once
//! from a certificate directory and shared read-only across sessions:
//!
//! | File | Used by |
//! |------|---------|
//! | `ca.pem` | both |
//! | `server.pem`, `server.key` | server |
//! | `client.pem`, `client.key` | client |
//!
//! [`generate_dev_certs`] writes a development CA and leaf certificates in
//! this layout.

use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::{Error, Result};

/// CA bundle file name.
pub const CA_CERT_FILE: &str = "ca.pem";
/// CA private key file name (written by [`generate_dev_certs`] only).
pub const CA_KEY_FILE: &str = "ca.key";
/// Server certificate chain file name.
pub const SERVER_CERT_FILE: &str = "server.pem";
/// Server private key file name.
pub const SERVER_KEY_FILE: &str = "server.key";
/// Client certificate chain file name.
pub const CLIENT_CERT_FILE: &str = "client.pem";
/// Client private key file name.
pub const CLIENT_KEY_FILE: &str = "client.key";

/// Mutual TLS configuration for one side of a connection.
#[derive(Clone)]
pub struct TlsConfig {
    server: Option<Arc<rustls::ServerConfig>>,
    client: Option<Arc<rustls::ClientConfig>>,
    server_name: Option<ServerName<'static>>,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("server", &self.server.is_some())
            .field("client", &self.client.is_some())
            .field("server_name", &self.server_name)
            .finish()
    }
}

impl TlsConfig {
    /// Server configuration that requires client certificates signed by the CA.
    ///
    /// # Errors
    ///
    /// Returns an error if any PEM input is invalid or rustls rejects it.
    pub fn server(ca_pem: &[u8], cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let roots = root_store(ca_pem)?;
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| Error::Tls(format!("Failed to build client verifier: {e}")))?;

        let config = rustls::ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(parse_certs(cert_pem)?, parse_key(key_pem)?)
            .map_err(|e| Error::Tls(format!("Failed to build server config: {e}")))?;

        Ok(Self {
            server: Some(Arc::new(config)),
            client: None,
            server_name: None,
        })
    }

    /// Client configuration that presents its certificate and verifies the
    /// server against the CA and `server_name`.
    ///
    /// # Errors
    ///
    /// Returns an error if any PEM input or the server name is invalid.
    pub fn client(
        ca_pem: &[u8],
        cert_pem: &[u8],
        key_pem: &[u8],
        server_name: &str,
    ) -> Result<Self> {
        let roots = root_store(ca_pem)?;
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|e| Error::Tls(format!("Invalid server name '{server_name}': {e}")))?;

        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(parse_certs(cert_pem)?, parse_key(key_pem)?)
            .map_err(|e| Error::Tls(format!("Failed to build client config: {e}")))?;

        Ok(Self {
            server: None,
            client: Some(Arc::new(config)),
            server_name: Some(server_name),
        })
    }

    /// Load the server role from a certificate directory.
    ///
    /// # Errors
    ///
    /// Returns an error if a file is missing or invalid.
    pub fn server_from_dir(dir: &Path) -> Result<Self> {
        Self::server(
            &read_pem(&dir.join(CA_CERT_FILE))?,
            &read_pem(&dir.join(SERVER_CERT_FILE))?,
            &read_pem(&dir.join(SERVER_KEY_FILE))?,
        )
    }

    /// Load the client role from a certificate directory.
    ///
    /// # Errors
    ///
    /// Returns an error if a file is missing or invalid.
    pub fn client_from_dir(dir: &Path, server_name: &str) -> Result<Self> {
        Self::client(
            &read_pem(&dir.join(CA_CERT_FILE))?,
            &read_pem(&dir.join(CLIENT_CERT_FILE))?,
            &read_pem(&dir.join(CLIENT_KEY_FILE))?,
            server_name,
        )
    }

    /// Acceptor for the server role.
    #[must_use]
    pub fn acceptor(&self) -> Option<TlsAcceptor> {
        self.server.clone().map(TlsAcceptor::from)
    }

    /// Connector and expected server name for the client role.
    #[must_use]
    pub fn connector(&self) -> Option<(TlsConnector, ServerName<'static>)> {
        let config = self.client.clone()?;
        let name = self.server_name.clone()?;
        Some((TlsConnector::from(config), name))
    }

    /// Get the server configuration, if this is a server config.
    #[must_use]
    pub fn server_config(&self) -> Option<&rustls::ServerConfig> {
        self.server.as_deref()
    }

    /// Get the client configuration, if this is a client config.
    #[must_use]
    pub fn client_config(&self) -> Option<&rustls::ClientConfig> {
        self.client.as_deref()
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| Error::Tls(format!("Failed to read {}: {e}", path.display())))
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("Failed to parse certificate PEM: {e}")))?;
    if certs.is_empty() {
        return Err(Error::Tls("No certificates found in PEM input".to_string()));
    }
    Ok(certs)
}

fn parse_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut BufReader::new(pem))
        .map_err(|e| Error::Tls(format!("Failed to parse private key PEM: {e}")))?
        .ok_or_else(|| Error::Tls("No private key found in PEM input".to_string()))
}

fn root_store(ca_pem: &[u8]) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in parse_certs(ca_pem)? {
        roots
            .add(cert)
            .map_err(|e| Error::Tls(format!("Invalid CA certificate: {e}")))?;
    }
    Ok(roots)
}

/// PEM-encoded development certificate set.
#[derive(Debug, Clone)]
pub struct DevCertificates {
    /// CA certificate
    pub ca_cert: String,
    /// CA private key
    pub ca_key: String,
    /// Server certificate, signed by the CA
    pub server_cert: String,
    /// Server private key
    pub server_key: String,
    /// Client certificate, signed by the CA
    pub client_cert: String,
    /// Client private key
    pub client_key: String,
}

impl DevCertificates {
    /// Generate a fresh CA plus server and client certificates.
    ///
    /// `server_names` become the server certificate's subject alternative
    /// names; IP literals are encoded as IP SANs.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation or signing fails.
    pub fn generate(server_names: &[String]) -> Result<Self> {
        let tls_err = |what: &str, e: rcgen::Error| Error::Tls(format!("Failed to {what}: {e}"));

        let mut ca_params =
            CertificateParams::new(Vec::<String>::new()).map_err(|e| tls_err("create CA params", e))?;
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "qback development CA");
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca_key = KeyPair::generate().map_err(|e| tls_err("generate CA key", e))?;
        let ca_cert = ca_params
            .self_signed(&ca_key)
            .map_err(|e| tls_err("self-sign CA", e))?;

        let leaf = |sans: Vec<String>, common_name: &str, usage: ExtendedKeyUsagePurpose| {
            let mut params =
                CertificateParams::new(sans).map_err(|e| tls_err("create leaf params", e))?;
            params.distinguished_name.push(DnType::CommonName, common_name);
            params.key_usages = vec![
                KeyUsagePurpose::DigitalSignature,
                KeyUsagePurpose::KeyEncipherment,
            ];
            params.extended_key_usages = vec![usage];
            let key = KeyPair::generate().map_err(|e| tls_err("generate leaf key", e))?;
            let cert = params
                .signed_by(&key, &ca_cert, &ca_key)
                .map_err(|e| tls_err("sign leaf certificate", e))?;
            Ok::<_, Error>((cert.pem(), key.serialize_pem()))
        };

        let (server_cert, server_key) = leaf(
            server_names.to_vec(),
            "qback server",
            ExtendedKeyUsagePurpose::ServerAuth,
        )?;
        let (client_cert, client_key) = leaf(
            vec!["qback-client".to_string()],
            "qback client",
            ExtendedKeyUsagePurpose::ClientAuth,
        )?;

        Ok(Self {
            ca_cert: ca_cert.pem(),
            ca_key: ca_key.serialize_pem(),
            server_cert,
            server_key,
            client_cert,
            client_key,
        })
    }

    /// Server-role TLS configuration from this set.
    ///
    /// # Errors
    ///
    /// Returns an error if rustls rejects the material.
    pub fn server_config(&self) -> Result<TlsConfig> {
        TlsConfig::server(
            self.ca_cert.as_bytes(),
            self.server_cert.as_bytes(),
            self.server_key.as_bytes(),
        )
    }

    /// Client-role TLS configuration from this set.
    ///
    /// # Errors
    ///
    /// Returns an error if rustls rejects the material or the name.
    pub fn client_config(&self, server_name: &str) -> Result<TlsConfig> {
        TlsConfig::client(
            self.ca_cert.as_bytes(),
            self.client_cert.as_bytes(),
            self.client_key.as_bytes(),
            server_name,
        )
    }
}

/// Generate development certificates into `dir`.
///
/// Refuses to overwrite an existing `ca.pem` unless `force` is set. Returns
/// the paths written.
///
/// # Errors
///
/// Returns an error if generation fails or a file cannot be written.
pub fn generate_dev_certs(dir: &Path, server_names: &[String], force: bool) -> Result<Vec<PathBuf>> {
    let ca_path = dir.join(CA_CERT_FILE);
    if ca_path.exists() && !force {
        return Err(Error::AlreadyExists(ca_path.display().to_string()));
    }

    std::fs::create_dir_all(dir)?;
    let certs = DevCertificates::generate(server_names)?;

    let files = [
        (CA_CERT_FILE, &certs.ca_cert, false),
        (CA_KEY_FILE, &certs.ca_key, true),
        (SERVER_CERT_FILE, &certs.server_cert, false),
        (SERVER_KEY_FILE, &certs.server_key, true),
        (CLIENT_CERT_FILE, &certs.client_cert, false),
        (CLIENT_KEY_FILE, &certs.client_key, true),
    ];

    let mut written = Vec::with_capacity(files.len());
    for (name, content, private) in files {
        let path = dir.join(name);
        write_pem(&path, content, private)?;
        tracing::debug!("Wrote {}", path.display());
        written.push(path);
    }

    Ok(written)
}

#[cfg(unix)]
fn write_pem(path: &Path, content: &str, private: bool) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mode = if private { 0o600 } else { 0o644 };
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}

#[cfg(not(unix))]
fn write_pem(path: &Path, content: &str, _private: bool) -> Result<()> {
    std::fs::write(path, content)?;
    Ok(())
}
