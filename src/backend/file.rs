//! File backend: every piece of material is a configured path.
//!
//! This is also the trust core embedded by the Puppet, cert-manager and
//! PKCS#11 backends, which only differ in where the paths come from and
//! how the certificate was obtained.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::CertificateDer;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use x509_parser::pem::Pem;

use crate::cache::CertCache;
use crate::config::{ProviderConfig, ProviderKind, RemoteSignerConfig, TlsPolicyConfig};
use crate::crypto::{self, MessageSigner, RsaKey};
use crate::provider::{self, EnrollOutcome, ProgressFn, SecurityProvider};
use crate::remote::{HttpRemoteSigner, RemoteSigner};
use crate::tls::{self, ClientIdentity, ServerIdentity};
use crate::trust::{CallerPolicy, CertIdentity, TrustEngine};
use crate::{Error, Result};

/// Locations of one identity's material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterialPaths {
    /// PEM private key.
    pub key: PathBuf,
    /// PEM certificate, leaf first.
    pub certificate: PathBuf,
    /// PEM CA bundle.
    pub ca: PathBuf,
    /// Peer certificate cache directory.
    pub cache: PathBuf,
}

#[derive(Clone)]
enum RemoteDelegate {
    Configured(RemoteSignerConfig),
    Signer(Arc<dyn RemoteSigner>),
}

impl fmt::Debug for RemoteDelegate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configured(c) => f.debug_tuple("Configured").field(&c.url).finish(),
            Self::Signer(_) => f.write_str("Signer(..)"),
        }
    }
}

/// Trust provider over files on disk.
#[derive(Debug, Clone)]
pub struct FileSecurity {
    identity: String,
    scheme: String,
    paths: MaterialPaths,
    tls: TlsPolicyConfig,
    engine: TrustEngine,
    cache: CertCache,
    remote: Option<RemoteDelegate>,
}

impl FileSecurity {
    /// Provider for `identity` over `paths`, taking policy, TLS and remote
    /// signing settings from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationInvalid`] for an empty identity or an
    /// invalid policy pattern.
    pub fn new(
        identity: impl Into<String>,
        paths: MaterialPaths,
        config: &ProviderConfig,
    ) -> Result<Self> {
        let identity = identity.into();
        if identity.is_empty() {
            return Err(Error::config("identity is not set"));
        }

        let policy = CallerPolicy::from_config(&config.policy)?;

        Ok(Self {
            engine: TrustEngine::new(&paths.ca, policy),
            cache: CertCache::new(&paths.cache),
            identity,
            scheme: config.caller_scheme.clone(),
            paths,
            tls: config.tls.clone(),
            remote: config.remote_signer.clone().map(RemoteDelegate::Configured),
        })
    }

    /// File backend from the `file` section.
    ///
    /// Key, certificate and CA are required. The identity defaults to the
    /// certificate's Common Name; the cache to `cache/` next to the
    /// certificate.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationInvalid`] when a required path or the
    /// identity cannot be determined.
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let file = &config.file;
        let required = |p: &Option<PathBuf>, name: &str| {
            p.clone()
                .ok_or_else(|| Error::config(format!("file.{name} is not set")))
        };

        let certificate = required(&file.certificate, "certificate")?;
        let paths = MaterialPaths {
            key: required(&file.key, "key")?,
            ca: required(&file.ca, "ca")?,
            cache: file.cache.clone().unwrap_or_else(|| {
                certificate
                    .parent()
                    .unwrap_or_else(|| Path::new("."))
                    .join("cache")
            }),
            certificate,
        };

        let identity = match &config.identity {
            Some(id) => id.clone(),
            None => common_name_of(&paths.certificate).ok_or_else(|| {
                Error::config(format!(
                    "identity is not set and {} has no common name",
                    paths.certificate.display()
                ))
            })?,
        };

        Self::new(identity, paths, config)
    }

    /// Delegate remote signing to `signer`.
    #[must_use]
    pub fn with_remote_signer(mut self, signer: Arc<dyn RemoteSigner>) -> Self {
        self.remote = Some(RemoteDelegate::Signer(signer));
        self
    }

    /// Material locations.
    #[must_use]
    pub fn paths(&self) -> &MaterialPaths {
        &self.paths
    }

    /// The trust engine over this provider's CA.
    #[must_use]
    pub fn engine(&self) -> &TrustEngine {
        &self.engine
    }

    pub(crate) fn tls_policy(&self) -> &TlsPolicyConfig {
        &self.tls
    }

    /// Problems with the CA bundle and cache directory only.
    pub(crate) fn validate_trust(&self, errors: &mut Vec<String>) {
        if let Err(e) = tls::load_root_store(&self.paths.ca) {
            errors.push(format!("CA bundle {}: {e}", self.paths.ca.display()));
        }
        if self.paths.cache.exists() && !self.paths.cache.is_dir() {
            errors.push(format!(
                "cache {} is not a directory",
                self.paths.cache.display()
            ));
        }
    }

    pub(crate) fn verify_with_certificate_file(
        &self,
        data: &[u8],
        signature: &[u8],
        cert_pem: Option<&[u8]>,
    ) -> (bool, String) {
        let own;
        let pem = match cert_pem {
            Some(pem) => pem,
            None => match fs::read(&self.paths.certificate) {
                Ok(bytes) => {
                    own = bytes;
                    &own
                }
                Err(e) => {
                    debug!(error = %e, "own certificate unavailable for verification");
                    return (false, String::new());
                }
            },
        };

        match crypto::verify_signature(data, signature, pem) {
            Some(name) => (true, name),
            None => (false, String::new()),
        }
    }

    pub(crate) async fn remote_sign(
        &self,
        cancel: &CancellationToken,
        payload: &[u8],
        tls: impl FnOnce() -> Result<rustls::ClientConfig>,
    ) -> Result<Vec<u8>> {
        match &self.remote {
            None => Err(Error::Signing("no remote signer configured".to_string())),
            Some(RemoteDelegate::Signer(signer)) => signer.sign(cancel, payload).await,
            Some(RemoteDelegate::Configured(config)) => {
                HttpRemoteSigner::new(config, tls()?)?
                    .sign(cancel, payload)
                    .await
            }
        }
    }
}

#[async_trait]
impl SecurityProvider for FileSecurity {
    fn kind(&self) -> ProviderKind {
        ProviderKind::File
    }

    fn identity(&self) -> &str {
        &self.identity
    }

    fn caller_name(&self) -> String {
        provider::caller_name(&self.scheme, &self.identity)
    }

    fn caller_identity(&self, caller: &str) -> Result<String> {
        provider::caller_identity(&self.scheme, caller)
    }

    fn validate(&self) -> (Vec<String>, bool) {
        let mut errors = Vec::new();

        match fs::read(&self.paths.key) {
            Ok(pem) => {
                if let Err(e) = RsaKey::from_pem(&pem) {
                    errors.push(format!("private key {}: {e}", self.paths.key.display()));
                }
            }
            Err(e) => errors.push(format!("private key {}: {e}", self.paths.key.display())),
        }

        match fs::read(&self.paths.certificate) {
            Ok(pem) => {
                if let Err(e) = crypto::decode_certificates(&pem) {
                    errors.push(format!(
                        "certificate {}: {e}",
                        self.paths.certificate.display()
                    ));
                }
            }
            Err(e) => errors.push(format!(
                "certificate {}: {e}",
                self.paths.certificate.display()
            )),
        }

        self.validate_trust(&mut errors);

        let ok = errors.is_empty();
        (errors, ok)
    }

    fn sign_bytes(&self, data: &[u8]) -> Result<Vec<u8>> {
        RsaKey::from_pem(&fs::read(&self.paths.key)?)?.sign(data)
    }

    fn verify_signature_bytes(
        &self,
        data: &[u8],
        signature: &[u8],
        cert_pem: Option<&[u8]>,
    ) -> (bool, String) {
        self.verify_with_certificate_file(data, signature, cert_pem)
    }

    fn tls_config(&self) -> Result<rustls::ServerConfig> {
        tls::server_config(
            &self.paths.ca,
            &self.tls,
            ServerIdentity::Files {
                certificate: self.paths.certificate.clone(),
                key: self.paths.key.clone(),
            },
        )
    }

    fn client_tls_config(&self) -> Result<rustls::ClientConfig> {
        tls::client_config(
            &self.paths.ca,
            &self.tls,
            ClientIdentity::when_present(&self.paths.certificate, &self.paths.key),
        )
    }

    fn verify_certificate(&self, cert_pem: &[u8], name: &str) -> Result<()> {
        self.engine.verify_certificate(cert_pem, name)
    }

    fn public_cert(&self) -> Result<CertificateDer<'static>> {
        let certs = crypto::decode_certificates(&self.public_cert_bytes()?)?;
        certs
            .into_iter()
            .next()
            .ok_or_else(|| Error::MalformedCertificate("empty certificate file".to_string()))
    }

    fn public_cert_bytes(&self) -> Result<Vec<u8>> {
        Ok(fs::read(&self.paths.certificate)?)
    }

    fn public_cert_pem(&self) -> Result<Pem> {
        decode_pem(&self.public_cert_bytes()?)
    }

    fn cache_public_data(&self, cert_pem: &[u8], identity: &str) -> Result<()> {
        self.cache.store(&self.engine, cert_pem, identity).map(|_| ())
    }

    fn cached_public_data(&self, identity: &str) -> Result<Vec<u8>> {
        self.cache.load(identity)
    }

    fn should_allow_caller(&self, name: &str, cert_pem: &[u8]) -> Result<bool> {
        self.engine.should_allow_caller(name, cert_pem)
    }

    async fn enroll(
        &self,
        _cancel: &CancellationToken,
        _max_wait: Duration,
        _progress: &ProgressFn<'_>,
    ) -> Result<EnrollOutcome> {
        Err(Error::EnrollmentUnsupported("file"))
    }

    fn is_remote_signing(&self) -> bool {
        self.remote.is_some()
    }

    async fn remote_sign_request(
        &self,
        cancel: &CancellationToken,
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        self.remote_sign(cancel, payload, || self.client_tls_config())
            .await
    }
}

/// First PEM block of `data`.
pub(crate) fn decode_pem(data: &[u8]) -> Result<Pem> {
    x509_parser::pem::parse_x509_pem(data)
        .map(|(_, pem)| pem)
        .map_err(|e| Error::MalformedCertificate(format!("invalid PEM: {e}")))
}

fn common_name_of(path: &Path) -> Option<String> {
    let pem = fs::read(path).ok()?;
    let certs = crypto::decode_certificates(&pem).ok()?;
    CertIdentity::from_der(certs.first()?.as_ref())
        .ok()?
        .common_name
}
