//! Puppet backend.
//!
//! Material lives in a Puppet agent SSL directory:
//!
//! ```text
//! <ssl>/                                  0771
//!   certs/<id>.pem, certs/ca.pem          0755
//!   private_keys/<id>.pem                 0750
//!   certificate_requests/<id>.pem         0755
//!   choria_security/public_certs/         0755  (peer cache)
//! ```
//!
//! and is obtained by enrolling against a Puppet CA.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::CertificateDer;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use x509_parser::pem::Pem;

use crate::backend::file::{FileSecurity, MaterialPaths};
use crate::config::{OsFamily, Platform, ProviderConfig, ProviderKind, PuppetConfig};
use crate::enroll::artifacts::{ArtifactLayout, CsrSubject};
use crate::enroll::discovery::resolve_puppet_ca;
use crate::enroll::puppet_ca::PuppetCa;
use crate::enroll::{Enrollment, PollStrategy, interruptible};
use crate::provider::{EnrollOutcome, ProgressFn, SecurityProvider};
use crate::{Error, Result};

/// Default Puppet poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Organizational unit requested in Puppet CSRs.
pub const ORGANIZATIONAL_UNIT: &str = "mcollective";

const SSL_DIR_MODE: u32 = 0o771;
const PRIVATE_KEYS_DIR_MODE: u32 = 0o750;
const PUBLIC_DIR_MODE: u32 = 0o755;

/// Trust provider over a Puppet SSL directory.
#[derive(Debug, Clone)]
pub struct PuppetSecurity {
    inner: FileSecurity,
    puppet: PuppetConfig,
    enrollment: Enrollment,
}

impl PuppetSecurity {
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationInvalid`] when neither the identity nor
    /// the SSL directory can be determined.
    pub fn new(config: &ProviderConfig, platform: &Platform) -> Result<Self> {
        let identity = derive_identity(config, platform)?;
        let ssl_dir = match &config.puppet.ssl_dir {
            Some(dir) => dir.clone(),
            None => default_ssl_dir(platform)?,
        };

        let layout = ssl_layout(&ssl_dir, &identity);
        let paths = MaterialPaths {
            key: layout.key.clone(),
            certificate: layout.certificate.clone(),
            ca: layout.ca.clone(),
            cache: ssl_dir.join("choria_security").join("public_certs"),
        };

        let mut dns_names = vec![identity.clone()];
        dns_names.extend(config.puppet.alt_names.iter().cloned());

        let enrollment = Enrollment {
            layout,
            subject: CsrSubject {
                common_name: identity.clone(),
                organizational_unit: ORGANIZATIONAL_UNIT.to_string(),
                dns_names,
            },
            strategy: PollStrategy::Fixed {
                interval: config
                    .enrollment
                    .poll_interval
                    .unwrap_or(DEFAULT_POLL_INTERVAL),
            },
        };

        debug!(identity = %identity, ssl_dir = %ssl_dir.display(), "puppet security initialised");

        Ok(Self {
            inner: FileSecurity::new(identity, paths, config)?,
            puppet: config.puppet.clone(),
            enrollment,
        })
    }

    /// The artifact layout inside the SSL directory.
    #[must_use]
    pub fn layout(&self) -> &ArtifactLayout {
        &self.enrollment.layout
    }
}

/// Identity for the Puppet backend.
///
/// Explicit configuration first, then the certname override, then the host
/// name for privileged processes or `<login>.mcollective` otherwise.
///
/// # Errors
///
/// Returns [`Error::ConfigurationInvalid`] when the required host or login
/// name is unknown.
pub fn derive_identity(config: &ProviderConfig, platform: &Platform) -> Result<String> {
    if let Some(identity) = &config.identity {
        return Ok(identity.clone());
    }
    if let Some(certname) = &platform.certname_override {
        return Ok(certname.clone());
    }

    if platform.privileged {
        platform
            .hostname
            .clone()
            .ok_or_else(|| Error::config("cannot determine host name for the puppet identity"))
    } else {
        platform
            .user
            .as_ref()
            .map(|user| format!("{user}.mcollective"))
            .ok_or_else(|| Error::config("cannot determine login name for the puppet identity"))
    }
}

/// Default Puppet SSL directory for the platform.
///
/// # Errors
///
/// Returns [`Error::ConfigurationInvalid`] for an unprivileged process
/// without a home directory.
pub fn default_ssl_dir(platform: &Platform) -> Result<PathBuf> {
    if platform.privileged {
        return Ok(match platform.os {
            OsFamily::Windows => PathBuf::from(r"C:\ProgramData\PuppetLabs\puppet\etc\ssl"),
            OsFamily::Unix => PathBuf::from("/etc/puppetlabs/puppet/ssl"),
        });
    }

    platform
        .home
        .as_ref()
        .map(|home| home.join(".puppetlabs").join("etc").join("puppet").join("ssl"))
        .ok_or_else(|| Error::config("cannot determine home directory for the puppet SSL dir"))
}

fn ssl_layout(ssl_dir: &Path, identity: &str) -> ArtifactLayout {
    let certs = ssl_dir.join("certs");
    let private_keys = ssl_dir.join("private_keys");
    let requests = ssl_dir.join("certificate_requests");
    let security = ssl_dir.join("choria_security");
    let public_certs = security.join("public_certs");
    let pem = format!("{identity}.pem");

    ArtifactLayout {
        key: private_keys.join(&pem),
        csr: requests.join(&pem),
        certificate: certs.join(&pem),
        ca: certs.join("ca.pem"),
        directories: vec![
            (ssl_dir.to_path_buf(), SSL_DIR_MODE),
            (certs, PUBLIC_DIR_MODE),
            (private_keys, PRIVATE_KEYS_DIR_MODE),
            (requests, PUBLIC_DIR_MODE),
            (security, PUBLIC_DIR_MODE),
            (public_certs, PUBLIC_DIR_MODE),
        ],
    }
}

#[async_trait]
impl SecurityProvider for PuppetSecurity {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Puppet
    }

    fn identity(&self) -> &str {
        self.inner.identity()
    }

    fn caller_name(&self) -> String {
        self.inner.caller_name()
    }

    fn caller_identity(&self, caller: &str) -> Result<String> {
        self.inner.caller_identity(caller)
    }

    fn validate(&self) -> (Vec<String>, bool) {
        self.inner.validate()
    }

    fn sign_bytes(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.inner.sign_bytes(data)
    }

    fn verify_signature_bytes(
        &self,
        data: &[u8],
        signature: &[u8],
        cert_pem: Option<&[u8]>,
    ) -> (bool, String) {
        self.inner.verify_signature_bytes(data, signature, cert_pem)
    }

    fn tls_config(&self) -> Result<rustls::ServerConfig> {
        self.inner.tls_config()
    }

    fn client_tls_config(&self) -> Result<rustls::ClientConfig> {
        self.inner.client_tls_config()
    }

    fn verify_certificate(&self, cert_pem: &[u8], name: &str) -> Result<()> {
        self.inner.verify_certificate(cert_pem, name)
    }

    fn public_cert(&self) -> Result<CertificateDer<'static>> {
        self.inner.public_cert()
    }

    fn public_cert_bytes(&self) -> Result<Vec<u8>> {
        self.inner.public_cert_bytes()
    }

    fn public_cert_pem(&self) -> Result<Pem> {
        self.inner.public_cert_pem()
    }

    fn cache_public_data(&self, cert_pem: &[u8], identity: &str) -> Result<()> {
        self.inner.cache_public_data(cert_pem, identity)
    }

    fn cached_public_data(&self, identity: &str) -> Result<Vec<u8>> {
        self.inner.cached_public_data(identity)
    }

    fn should_allow_caller(&self, name: &str, cert_pem: &[u8]) -> Result<bool> {
        self.inner.should_allow_caller(name, cert_pem)
    }

    async fn enroll(
        &self,
        cancel: &CancellationToken,
        max_wait: Duration,
        progress: &ProgressFn<'_>,
    ) -> Result<EnrollOutcome> {
        // SRV discovery is network activity too
        if self.enrollment.layout.complete() {
            info!(identity = %self.identity(), "already enrolled, nothing to do");
            return Ok(EnrollOutcome::AlreadyEnrolled);
        }

        let deadline = Instant::now() + max_wait;
        let base = interruptible(cancel, deadline, resolve_puppet_ca(&self.puppet)).await?;
        info!(identity = %self.identity(), ca = %base, "enrolling with puppet CA");

        let ca = PuppetCa::new(base, self.identity(), &self.enrollment.layout.ca);
        self.enrollment
            .run_until(&ca, cancel, deadline, progress)
            .await
    }

    fn is_remote_signing(&self) -> bool {
        self.inner.is_remote_signing()
    }

    async fn remote_sign_request(
        &self,
        cancel: &CancellationToken,
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        self.inner.remote_sign_request(cancel, payload).await
    }
}
