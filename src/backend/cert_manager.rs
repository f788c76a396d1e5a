//! cert-manager backend.
//!
//! Enrolls by creating a `CertificateRequest` in the pod's namespace and
//! keeps the resulting material in `cert_manager.ssl_dir`:
//! `key.pem`, `csr.pem`, `cert.pem`, `ca.pem` and `cache/`.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::CertificateDer;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use x509_parser::pem::Pem;

use crate::backend::file::{FileSecurity, MaterialPaths};
use crate::config::{CertManagerConfig, Platform, ProviderConfig, ProviderKind};
use crate::enroll::artifacts::{ArtifactLayout, CsrSubject};
use crate::enroll::cert_manager_api::CertManagerApi;
use crate::enroll::{Enrollment, PollStrategy};
use crate::provider::{EnrollOutcome, ProgressFn, SecurityProvider};
use crate::{Error, Result};

/// Organizational unit requested in cert-manager CSRs.
pub const ORGANIZATIONAL_UNIT: &str = "choria";

const DIRECTORY_MODE: u32 = 0o700;

/// Default backoff while waiting for the issuer.
pub const DEFAULT_STRATEGY: PollStrategy = PollStrategy::Exponential {
    initial: Duration::from_secs(1),
    max: Duration::from_secs(20),
    factor: 2.0,
};

/// Trust provider enrolled through cert-manager.
#[derive(Debug, Clone)]
pub struct CertManagerSecurity {
    inner: FileSecurity,
    config: CertManagerConfig,
    namespace: String,
    enrollment: Enrollment,
}

impl CertManagerSecurity {
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationInvalid`] when `ssl_dir`, `issuer`, the
    /// identity or the namespace is missing.
    pub fn new(config: &ProviderConfig, platform: &Platform) -> Result<Self> {
        let cm = &config.cert_manager;

        let ssl_dir = cm
            .ssl_dir
            .clone()
            .ok_or_else(|| Error::config("cert_manager.ssl_dir is not set"))?;
        if cm.issuer.is_empty() {
            return Err(Error::config("cert_manager.issuer is not set"));
        }

        let identity = config
            .identity
            .clone()
            .or_else(|| platform.certname_override.clone())
            .or_else(|| platform.hostname.clone())
            .ok_or_else(|| Error::config("cannot determine the cert-manager identity"))?;

        let namespace = match &cm.namespace {
            Some(ns) => ns.clone(),
            None => service_account_namespace(&cm.service_account_dir)?,
        };

        let layout = ArtifactLayout {
            key: ssl_dir.join("key.pem"),
            csr: ssl_dir.join("csr.pem"),
            certificate: ssl_dir.join("cert.pem"),
            ca: ssl_dir.join("ca.pem"),
            directories: vec![
                (ssl_dir.clone(), DIRECTORY_MODE),
                (ssl_dir.join("cache"), DIRECTORY_MODE),
            ],
        };

        let paths = MaterialPaths {
            key: layout.key.clone(),
            certificate: layout.certificate.clone(),
            ca: layout.ca.clone(),
            cache: ssl_dir.join("cache"),
        };

        let mut dns_names = vec![identity.clone()];
        dns_names.extend(cm.alt_names.iter().cloned());

        let strategy = match config.enrollment.poll_interval {
            Some(interval) => PollStrategy::Fixed { interval },
            None => DEFAULT_STRATEGY,
        };

        debug!(identity = %identity, namespace = %namespace, "cert-manager security initialised");

        Ok(Self {
            enrollment: Enrollment {
                layout,
                subject: CsrSubject {
                    common_name: identity.clone(),
                    organizational_unit: ORGANIZATIONAL_UNIT.to_string(),
                    dns_names,
                },
                strategy,
            },
            inner: FileSecurity::new(identity, paths, config)?,
            config: cm.clone(),
            namespace,
        })
    }

    /// Namespace holding the `CertificateRequest`.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

fn service_account_namespace(dir: &Path) -> Result<String> {
    let path = dir.join("namespace");
    let ns = std::fs::read_to_string(&path)
        .map_err(|e| {
            Error::config(format!(
                "cert_manager.namespace is not set and {} is unreadable: {e}",
                path.display()
            ))
        })?
        .trim()
        .to_string();

    if ns.is_empty() {
        return Err(Error::config(format!("{} is empty", path.display())));
    }
    Ok(ns)
}

#[async_trait]
impl SecurityProvider for CertManagerSecurity {
    fn kind(&self) -> ProviderKind {
        ProviderKind::CertManager
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
        if self.enrollment.layout.complete() {
            info!(identity = %self.identity(), "already enrolled, nothing to do");
            return Ok(EnrollOutcome::AlreadyEnrolled);
        }

        let api = CertManagerApi::new(&self.config, self.identity(), &self.namespace)?;
        info!(
            identity = %self.identity(),
            namespace = %self.namespace,
            issuer = %self.config.issuer,
            "enrolling with cert-manager"
        );

        self.enrollment.run(&api, cancel, max_wait, progress).await
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OsFamily;
    use pretty_assertions::assert_eq;

    fn platform() -> Platform {
        Platform {
            privileged: false,
            os: OsFamily::Unix,
            home: None,
            user: None,
            hostname: Some("pod-1".into()),
            certname_override: None,
        }
    }

    fn config(dir: &Path) -> ProviderConfig {
        let mut config = ProviderConfig::default();
        config.provider = ProviderKind::CertManager;
        config.cert_manager.ssl_dir = Some(dir.join("ssl"));
        config.cert_manager.issuer = "choria-ca".into();
        config.cert_manager.service_account_dir = dir.join("sa");
        config
    }

    #[test]
    fn namespace_comes_from_the_service_account() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sa")).unwrap();
        std::fs::write(dir.path().join("sa/namespace"), "choria\n").unwrap();

        let provider = CertManagerSecurity::new(&config(dir.path()), &platform()).unwrap();

        assert_eq!(provider.namespace(), "choria");
        assert_eq!(provider.identity(), "pod-1");
        assert_eq!(provider.kind(), ProviderKind::CertManager);
        assert_eq!(provider.enrollment.strategy, DEFAULT_STRATEGY);
        assert_eq!(
            provider.enrollment.layout.certificate,
            dir.path().join("ssl/cert.pem")
        );
    }

    #[test]
    fn configured_namespace_needs_no_service_account() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.cert_manager.namespace = Some("other".into());
        config.identity = Some("rip.mcollective".into());

        let provider = CertManagerSecurity::new(&config, &platform()).unwrap();

        assert_eq!(provider.namespace(), "other");
        assert_eq!(provider.identity(), "rip.mcollective");
    }

    #[test]
    fn missing_settings_fail_construction() {
        let dir = tempfile::tempdir().unwrap();

        let mut no_dir = config(dir.path());
        no_dir.cert_manager.ssl_dir = None;
        assert!(matches!(
            CertManagerSecurity::new(&no_dir, &platform()),
            Err(Error::ConfigurationInvalid(_))
        ));

        let mut no_issuer = config(dir.path());
        no_issuer.cert_manager.issuer.clear();
        assert!(CertManagerSecurity::new(&no_issuer, &platform()).is_err());

        // no namespace configured and no service account on disk
        assert!(CertManagerSecurity::new(&config(dir.path()), &platform()).is_err());
    }

    #[test]
    fn poll_interval_override_is_fixed() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.cert_manager.namespace = Some("choria".into());
        config.enrollment.poll_interval = Some(Duration::from_secs(3));

        let provider = CertManagerSecurity::new(&config, &platform()).unwrap();

        assert_eq!(
            provider.enrollment.strategy,
            PollStrategy::Fixed {
                interval: Duration::from_secs(3)
            }
        );
    }
}
