//! Certificate trust engine.
//!
//! Verifies PEM certificate chains against the configured CA bundle and
//! combines the result with the [`CallerPolicy`] to authorize callers.
//!
//! # Authorization
//!
//! ```text
//! names(cert) match privileged_users?
//!   yes → chain-only verification            → privileged
//!   no  → chain + name verification for name → allow_list(name)? → not privileged
//!                                                              └─ no → CallerNotAllowed
//! ```
//!
//! Privilege is decided from the names embedded in the certificate, not from
//! the caller name being authorized, so a trusted privileged certificate may
//! act as any caller.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::UnixTime;
use rustls::server::WebPkiClientVerifier;
use tracing::debug;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use crate::crypto::decode_certificates;
use crate::tls;
use crate::trust::identity::CertIdentity;
use crate::trust::policy::CallerPolicy;
use crate::{Error, Result};

/// Prefix selecting email SAN matching in [`TrustEngine::verify_certificate`].
pub const EMAIL_NAME_PREFIX: &str = "email:";

/// Chain verification and caller authorization against one CA bundle.
#[derive(Debug, Clone)]
pub struct TrustEngine {
    ca_path: PathBuf,
    policy: CallerPolicy,
    provider: Arc<CryptoProvider>,
}

impl TrustEngine {
    /// Create an engine reading trust anchors from `ca_path` on every call.
    pub fn new(ca_path: impl Into<PathBuf>, policy: CallerPolicy) -> Self {
        Self {
            ca_path: ca_path.into(),
            policy,
            provider: tls::default_provider(),
        }
    }

    /// CA bundle location.
    #[must_use]
    pub fn ca_path(&self) -> &Path {
        &self.ca_path
    }

    /// Compiled caller policy.
    #[must_use]
    pub fn policy(&self) -> &CallerPolicy {
        &self.policy
    }

    /// Verify a PEM chain (leaf first, intermediates after) for client
    /// authentication and, unless `name` is empty, for `name`.
    ///
    /// A `name` of the form `email:<address>` is matched only against the
    /// email SANs when the leaf carries any.
    ///
    /// # Errors
    ///
    /// [`Error::TrustStoreUnavailable`], [`Error::MalformedCertificate`],
    /// [`Error::UntrustedCertificate`] or [`Error::NameMismatch`].
    pub fn verify_certificate(&self, cert_pem: &[u8], name: &str) -> Result<()> {
        let roots = tls::load_root_store(&self.ca_path)?;
        let chain = decode_certificates(cert_pem)?;
        let Some((leaf, intermediates)) = chain.split_first() else {
            return Err(Error::MalformedCertificate("empty certificate chain".to_string()));
        };

        let (_, parsed) = X509Certificate::from_der(leaf.as_ref())
            .map_err(|e| Error::MalformedCertificate(format!("cannot parse certificate: {e}")))?;
        let identity = CertIdentity::from_x509(&parsed)?;

        let verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::new(roots), self.provider.clone())
                .build()
                .map_err(|e| Error::TrustStoreUnavailable(e.to_string()))?;

        verifier
            .verify_client_cert(leaf, intermediates, UnixTime::now())
            .map_err(|e| Error::UntrustedCertificate(format!("{}: {e}", identity.display_name())))?;

        if !identity.san_emails.is_empty() {
            if let Some(email) = name.strip_prefix(EMAIL_NAME_PREFIX) {
                if identity.san_emails.iter().any(|e| e == email) {
                    return Ok(());
                }
                return Err(Error::NameMismatch {
                    requested: email.to_string(),
                    valid: identity.san_emails.join(", "),
                });
            }
        }

        if name.is_empty() || identity.matches_name(name) {
            return Ok(());
        }

        Err(Error::NameMismatch {
            requested: name.to_string(),
            valid: identity.display_name().to_string(),
        })
    }

    /// Decide whether the holder of `cert_pem` may make a request as `name`.
    ///
    /// Returns `Ok(true)` for privileged certificates and `Ok(false)` for
    /// ordinary callers that passed both verification and the allow list.
    ///
    /// # Errors
    ///
    /// Any error of [`TrustEngine::verify_certificate`], or
    /// [`Error::CallerNotAllowed`] when a valid caller is not allow-listed.
    pub fn should_allow_caller(&self, name: &str, cert_pem: &[u8]) -> Result<bool> {
        let chain = decode_certificates(cert_pem)?;
        let Some(leaf) = chain.first() else {
            return Err(Error::MalformedCertificate("empty certificate chain".to_string()));
        };
        let identity = CertIdentity::from_der(leaf.as_ref())?;

        if self.policy.is_privileged(identity.names()) {
            self.verify_certificate(cert_pem, "")?;
            debug!(
                caller = name,
                certificate = identity.display_name(),
                "privileged certificate accepted"
            );
            return Ok(true);
        }

        self.verify_certificate(cert_pem, name)?;

        if !self.policy.is_allowed(name) {
            return Err(Error::CallerNotAllowed(name.to_string()));
        }

        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;
    use crate::testing::{LeafSpec, TestPki, issue_from, self_signed_ca};
    use rcgen::ExtendedKeyUsagePurpose;

    fn engine(pki: &TestPki, allow: &[&str], privileged: &[&str]) -> TrustEngine {
        let policy = CallerPolicy::from_config(&PolicyConfig {
            allow_list: allow.iter().map(ToString::to_string).collect(),
            privileged_users: privileged.iter().map(ToString::to_string).collect(),
        })
        .unwrap();
        TrustEngine::new(pki.ca_path(), policy)
    }

    fn ecdsa(cn: &str) -> LeafSpec<'_> {
        LeafSpec {
            cn,
            ecdsa: true,
            ..LeafSpec::default()
        }
    }

    // ── verify_certificate ───────────────────────────────────────────────────

    #[test]
    fn verifies_cn_and_dns_sans() {
        let pki = TestPki::new();
        let leaf = pki.issue_with(&LeafSpec {
            dns: vec!["rip.example.net"],
            ..ecdsa("rip.mcollective")
        });
        let e = engine(&pki, &[], &[]);

        e.verify_certificate(leaf.cert_pem.as_bytes(), "rip.mcollective")
            .unwrap();
        e.verify_certificate(leaf.cert_pem.as_bytes(), "rip.example.net")
            .unwrap();
        e.verify_certificate(leaf.cert_pem.as_bytes(), "").unwrap();
    }

    #[test]
    fn wrong_name_names_the_actual_identity() {
        let pki = TestPki::new();
        let leaf = pki.issue_with(&ecdsa("rip.mcollective"));
        let e = engine(&pki, &[], &[]);

        let err = e
            .verify_certificate(leaf.cert_pem.as_bytes(), "bob")
            .unwrap_err();

        assert!(matches!(err, Error::NameMismatch { .. }));
        assert!(err.to_string().contains("rip.mcollective"));
    }

    #[test]
    fn foreign_ca_is_untrusted() {
        let pki = TestPki::new();
        let (_, other) = self_signed_ca("Other CA");
        let leaf = issue_from(&other, &ecdsa("rip.mcollective"));

        let err = engine(&pki, &[], &[])
            .verify_certificate(leaf.cert_pem.as_bytes(), "rip.mcollective")
            .unwrap_err();

        assert!(matches!(err, Error::UntrustedCertificate(_)));
    }

    #[test]
    fn expired_leaf_is_untrusted() {
        let pki = TestPki::new();
        let leaf = pki.issue_with(&LeafSpec {
            expired: true,
            ..ecdsa("rip.mcollective")
        });

        let err = engine(&pki, &[], &[])
            .verify_certificate(leaf.cert_pem.as_bytes(), "rip.mcollective")
            .unwrap_err();

        assert!(matches!(err, Error::UntrustedCertificate(_)));
    }

    #[test]
    fn server_only_usage_is_rejected_for_client_auth() {
        let pki = TestPki::new();
        let leaf = pki.issue_with(&LeafSpec {
            usages: vec![ExtendedKeyUsagePurpose::ServerAuth],
            ..ecdsa("rip.mcollective")
        });

        let err = engine(&pki, &[], &[])
            .verify_certificate(leaf.cert_pem.as_bytes(), "rip.mcollective")
            .unwrap_err();

        assert!(matches!(err, Error::UntrustedCertificate(_)));
    }

    #[test]
    fn intermediates_in_the_presented_chain_are_used() {
        let pki = TestPki::new();
        let (inter_pem, inter) = pki.intermediate("Test Intermediate");
        let leaf = issue_from(&inter, &ecdsa("rip.mcollective"));
        let e = engine(&pki, &[], &[]);

        // leaf alone cannot be chained to the root
        assert!(matches!(
            e.verify_certificate(leaf.cert_pem.as_bytes(), "rip.mcollective"),
            Err(Error::UntrustedCertificate(_))
        ));

        let chain = format!("{}{}", leaf.cert_pem, inter_pem);
        e.verify_certificate(chain.as_bytes(), "rip.mcollective")
            .unwrap();
    }

    #[test]
    fn email_names_only_match_email_sans() {
        let pki = TestPki::new();
        let leaf = pki.issue_with(&LeafSpec {
            emails: vec!["rip@example.net"],
            ..ecdsa("rip.mcollective")
        });
        let e = engine(&pki, &[], &[]);

        e.verify_certificate(leaf.cert_pem.as_bytes(), "email:rip@example.net")
            .unwrap();
        assert!(matches!(
            e.verify_certificate(leaf.cert_pem.as_bytes(), "email:bob@example.net"),
            Err(Error::NameMismatch { .. })
        ));
        // plain names still go through CN/DNS matching
        e.verify_certificate(leaf.cert_pem.as_bytes(), "rip.mcollective")
            .unwrap();
    }

    #[test]
    fn missing_ca_bundle_is_reported() {
        let pki = TestPki::new();
        let leaf = pki.issue_with(&ecdsa("rip.mcollective"));
        let e = TrustEngine::new(
            "/nonexistent/ca.pem",
            CallerPolicy::from_config(&PolicyConfig::default()).unwrap(),
        );

        assert!(matches!(
            e.verify_certificate(leaf.cert_pem.as_bytes(), ""),
            Err(Error::TrustStoreUnavailable(_))
        ));
    }

    #[test]
    fn garbage_is_malformed() {
        let pki = TestPki::new();
        assert!(matches!(
            engine(&pki, &[], &[]).verify_certificate(b"garbage", ""),
            Err(Error::MalformedCertificate(_))
        ));
    }

    // ── should_allow_caller ──────────────────────────────────────────────────

    #[test]
    fn privileged_certificate_may_act_as_anyone() {
        let pki = TestPki::new();
        let leaf = pki.issue_with(&ecdsa("1.privileged.mcollective"));
        let e = engine(&pki, &[r"\.mcollective$"], &[r"\.privileged\.mcollective$"]);

        assert!(
            e.should_allow_caller("anyone.else", leaf.cert_pem.as_bytes())
                .unwrap()
        );
    }

    #[test]
    fn untrusted_privileged_certificate_is_rejected() {
        let pki = TestPki::new();
        let (_, other) = self_signed_ca("Other CA");
        let leaf = issue_from(&other, &ecdsa("1.privileged.mcollective"));
        let e = engine(&pki, &[], &[r"\.privileged\.mcollective$"]);

        assert!(matches!(
            e.should_allow_caller("anyone.else", leaf.cert_pem.as_bytes()),
            Err(Error::UntrustedCertificate(_))
        ));
    }

    #[test]
    fn ordinary_caller_needs_name_match_and_allow_list() {
        let pki = TestPki::new();
        let leaf = pki.issue_with(&ecdsa("rip.mcollective"));
        let e = engine(&pki, &[r"\.mcollective$"], &[r"\.privileged\.mcollective$"]);

        assert!(
            !e.should_allow_caller("rip.mcollective", leaf.cert_pem.as_bytes())
                .unwrap()
        );
        assert!(matches!(
            e.should_allow_caller("bob", leaf.cert_pem.as_bytes()),
            Err(Error::NameMismatch { .. })
        ));
    }

    #[test]
    fn valid_caller_outside_allow_list_is_refused() {
        let pki = TestPki::new();
        let leaf = pki.issue_with(&ecdsa("rip.example.net"));
        let e = engine(&pki, &[r"\.mcollective$"], &[]);

        assert!(matches!(
            e.should_allow_caller("rip.example.net", leaf.cert_pem.as_bytes()),
            Err(Error::CallerNotAllowed(_))
        ));
    }

    #[test]
    fn privilege_can_come_from_a_dns_san() {
        let pki = TestPki::new();
        let leaf = pki.issue_with(&LeafSpec {
            dns: vec!["ops.privileged.mcollective"],
            ..ecdsa("ops.example.net")
        });
        let e = engine(&pki, &[], &[r"\.privileged\.mcollective$"]);

        assert!(
            e.should_allow_caller("someone", leaf.cert_pem.as_bytes())
                .unwrap()
        );
    }
}
