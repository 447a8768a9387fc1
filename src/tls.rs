//! TLS options for the bridge connection
//!
//! Trust material, client identity and verification policy are resolved into
//! a `rustls::ClientConfig`. Unless overridden, the peer is verified only when
//! some trust material (CA file, CA directory or inline CA data) is configured.

use crate::error::{EventBusError, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{self, CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, Error as RustlsError, RootCertStore,
    SignatureScheme, SupportedCipherSuite,
};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Whether the server certificate chain is checked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerVerification {
    /// Reject servers whose chain does not lead to a trusted root
    Required,
    /// Accept any server certificate
    Disabled,
}

/// TLS settings; every field is optional
#[derive(Clone, Default)]
pub struct TlsOptions {
    /// PEM file with trusted CA certificates
    pub ca_file: Option<PathBuf>,
    /// Directory of PEM files with trusted CA certificates
    pub ca_path: Option<PathBuf>,
    /// Inline PEM with trusted CA certificates
    pub ca_data: Option<String>,
    /// Client certificate chain (PEM)
    pub cert_file: Option<PathBuf>,
    /// Client private key (PEM)
    pub key_file: Option<PathBuf>,
    /// Passphrase for an encrypted PKCS#8 client key
    pub key_passphrase: Option<String>,
    /// Allowed cipher suites, colon separated (e.g. `TLS13_AES_128_GCM_SHA256`)
    pub ciphers: Option<String>,
    /// Check the certificate against the host name
    pub verify_hostname: Option<bool>,
    /// Check the certificate chain
    pub verify_mode: Option<PeerVerification>,
    /// Pre-built config used as-is instead of the options above
    pub client_config: Option<Arc<ClientConfig>>,
}

impl fmt::Debug for TlsOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsOptions")
            .field("ca_file", &self.ca_file)
            .field("ca_path", &self.ca_path)
            .field("ca_data", &self.ca_data.as_ref().map(|_| "<pem>"))
            .field("cert_file", &self.cert_file)
            .field("key_file", &self.key_file)
            .field("key_passphrase", &self.key_passphrase.as_ref().map(|_| "<redacted>"))
            .field("ciphers", &self.ciphers)
            .field("verify_hostname", &self.verify_hostname)
            .field("verify_mode", &self.verify_mode)
            .field("client_config", &self.client_config.is_some())
            .finish()
    }
}

impl TlsOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    pub fn ca_path(mut self, dir: impl Into<PathBuf>) -> Self {
        self.ca_path = Some(dir.into());
        self
    }

    pub fn ca_data(mut self, pem: impl Into<String>) -> Self {
        self.ca_data = Some(pem.into());
        self
    }

    /// Present a client certificate
    pub fn client_cert(mut self, cert_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Self {
        self.cert_file = Some(cert_file.into());
        self.key_file = Some(key_file.into());
        self
    }

    pub fn key_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.key_passphrase = Some(passphrase.into());
        self
    }

    pub fn ciphers(mut self, ciphers: impl Into<String>) -> Self {
        self.ciphers = Some(ciphers.into());
        self
    }

    pub fn verify_hostname(mut self, verify: bool) -> Self {
        self.verify_hostname = Some(verify);
        self
    }

    pub fn verify_mode(mut self, mode: PeerVerification) -> Self {
        self.verify_mode = Some(mode);
        self
    }

    /// Use a fully built rustls config; all other options are ignored
    pub fn client_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.client_config = Some(config);
        self
    }

    pub fn has_trust_material(&self) -> bool {
        self.ca_file.is_some() || self.ca_path.is_some() || self.ca_data.is_some()
    }

    /// Verification mode after applying the default policy
    pub fn effective_verify_mode(&self) -> PeerVerification {
        self.verify_mode.unwrap_or(if self.has_trust_material() {
            PeerVerification::Required
        } else {
            PeerVerification::Disabled
        })
    }

    /// Hostname check after applying the default policy
    pub fn effective_verify_hostname(&self) -> bool {
        self.verify_hostname
            .unwrap_or(self.effective_verify_mode() == PeerVerification::Required)
    }

    /// Build a connector for these options
    pub fn connector(&self) -> Result<TlsConnector> {
        Ok(TlsConnector::from(self.build_client_config()?))
    }

    /// Resolve the options into a rustls client config
    pub fn build_client_config(&self) -> Result<Arc<ClientConfig>> {
        if let Some(config) = &self.client_config {
            return Ok(config.clone());
        }

        let provider = Arc::new(self.crypto_provider()?);

        let verifier: Arc<dyn ServerCertVerifier> = match self.effective_verify_mode() {
            PeerVerification::Disabled => {
                debug!("TLS peer verification disabled");
                Arc::new(NoVerification {
                    algorithms: provider.signature_verification_algorithms,
                })
            }
            PeerVerification::Required => {
                let roots = Arc::new(self.root_store()?);
                let webpki = WebPkiServerVerifier::builder_with_provider(roots, provider.clone())
                    .build()
                    .map_err(|e| EventBusError::Tls(e.to_string()))?;
                if self.effective_verify_hostname() {
                    webpki as Arc<dyn ServerCertVerifier>
                } else {
                    Arc::new(IgnoreHostname { inner: webpki }) as Arc<dyn ServerCertVerifier>
                }
            }
        };

        let builder = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| EventBusError::Tls(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(verifier);

        let config = match self.client_identity()? {
            Some((certs, key)) => builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| EventBusError::Tls(e.to_string()))?,
            None => builder.with_no_client_auth(),
        };

        Ok(Arc::new(config))
    }

    fn crypto_provider(&self) -> Result<CryptoProvider> {
        let mut provider = crypto::ring::default_provider();

        if let Some(list) = &self.ciphers {
            let wanted: Vec<String> = list
                .split([':', ','])
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(normalize_suite_name)
                .collect();

            let selected: Vec<SupportedCipherSuite> = provider
                .cipher_suites
                .iter()
                .copied()
                .filter(|suite| wanted.contains(&suite_name(suite)))
                .collect();

            if selected.is_empty() {
                return Err(EventBusError::Tls(format!(
                    "no supported cipher suites in '{}'",
                    list
                )));
            }
            provider.cipher_suites = selected;
        }

        Ok(provider)
    }

    fn root_store(&self) -> Result<RootCertStore> {
        let mut roots = RootCertStore::empty();

        if let Some(file) = &self.ca_file {
            for cert in pem_certs(&read_file(file)?, file)? {
                roots
                    .add(cert)
                    .map_err(|e| EventBusError::Tls(format!("{}: {}", file.display(), e)))?;
            }
        }

        if let Some(dir) = &self.ca_path {
            let entries = std::fs::read_dir(dir)
                .map_err(|e| EventBusError::Tls(format!("{}: {}", dir.display(), e)))?;
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                // Directories of hashed links often hold non-PEM files too
                match pem_certs(&read_file(&path)?, &path) {
                    Ok(certs) => {
                        let (added, ignored) = roots.add_parsable_certificates(certs);
                        debug!(path = %path.display(), added, ignored, "Loaded CA certificates");
                    }
                    Err(e) => debug!(path = %path.display(), error = %e, "Skipping CA file"),
                }
            }
        }

        if let Some(data) = &self.ca_data {
            for cert in pem_certs(data.as_bytes(), Path::new("<ca_data>"))? {
                roots
                    .add(cert)
                    .map_err(|e| EventBusError::Tls(format!("<ca_data>: {}", e)))?;
            }
        }

        if !self.has_trust_material() {
            let native = rustls_native_certs::load_native_certs();
            for e in &native.errors {
                warn!(error = %e, "Failed to load a native root certificate");
            }
            roots.add_parsable_certificates(native.certs);
        }

        if roots.is_empty() {
            return Err(EventBusError::Tls(
                "peer verification requires at least one trusted certificate".to_string(),
            ));
        }

        Ok(roots)
    }

    fn client_identity(&self) -> Result<Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>> {
        match (&self.cert_file, &self.key_file) {
            (None, None) => Ok(None),
            (Some(cert_file), Some(key_file)) => {
                let certs = pem_certs(&read_file(cert_file)?, cert_file)?;
                if certs.is_empty() {
                    return Err(EventBusError::Tls(format!(
                        "no certificate found in {}",
                        cert_file.display()
                    )));
                }
                let key = self.private_key(key_file)?;
                Ok(Some((certs, key)))
            }
            _ => Err(EventBusError::Tls(
                "client certificate and key must be configured together".to_string(),
            )),
        }
    }

    fn private_key(&self, path: &Path) -> Result<PrivateKeyDer<'static>> {
        let pem = read_file(path)?;

        if let Some(passphrase) = &self.key_passphrase {
            return decrypt_pkcs8(&pem, passphrase, path);
        }

        rustls_pemfile::private_key(&mut pem.as_slice())
            .map_err(|e| EventBusError::Tls(format!("{}: {}", path.display(), e)))?
            .ok_or_else(|| {
                EventBusError::Tls(format!("no private key found in {}", path.display()))
            })
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| EventBusError::Tls(format!("{}: {}", path.display(), e)))
}

fn pem_certs(mut pem: &[u8], origin: &Path) -> Result<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| EventBusError::Tls(format!("{}: {}", origin.display(), e)))
}

fn decrypt_pkcs8(pem: &[u8], passphrase: &str, origin: &Path) -> Result<PrivateKeyDer<'static>> {
    let invalid = |e: &dyn fmt::Display| EventBusError::Tls(format!("{}: {}", origin.display(), e));

    let (label, der) = pem_rfc7468::decode_vec(pem).map_err(|e| invalid(&e))?;
    if label != "ENCRYPTED PRIVATE KEY" {
        return Err(invalid(&format!("expected ENCRYPTED PRIVATE KEY, found {}", label)));
    }

    let info = pkcs8::EncryptedPrivateKeyInfo::try_from(der.as_slice()).map_err(|e| invalid(&e))?;
    let document = info.decrypt(passphrase.as_bytes()).map_err(|e| invalid(&e))?;

    Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        document.as_bytes().to_vec(),
    )))
}

fn suite_name(suite: &SupportedCipherSuite) -> String {
    normalize_suite_name(&format!("{:?}", suite.suite()))
}

/// TLS 1.3 suites are accepted with either the rustls (`TLS13_`) or IANA (`TLS_`) prefix
fn normalize_suite_name(name: &str) -> String {
    let upper = name.to_ascii_uppercase();
    match upper.strip_prefix("TLS13_") {
        Some(rest) => format!("TLS_{}", rest),
        None => upper,
    }
}

/// Accepts any server certificate
#[derive(Debug)]
struct NoVerification {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, RustlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, RustlsError> {
        crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, RustlsError> {
        crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Verifies the chain but tolerates a certificate issued for another name
#[derive(Debug)]
struct IgnoreHostname {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for IgnoreHostname {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, RustlsError> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(RustlsError::InvalidCertificate(
                CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. },
            )) => Ok(ServerCertVerified::assertion()),
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, RustlsError> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, RustlsError> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
