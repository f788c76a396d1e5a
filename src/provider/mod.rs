//! Security provider abstraction.
//!
//! Every trust backend (plain files, Puppet CA, cert-manager, PKCS#11
//! token) implements [`SecurityProvider`], so the message and connector
//! layers can sign, verify and open TLS connections without knowing which
//! mechanism established the identity.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐
//! │ Arc<dyn SecurityProvider>│
//! └────────────┬─────────────┘
//!              │
//!   ┌──────────┼──────────────┬──────────────┐
//!   ▼          ▼              ▼              ▼
//! File      Puppet        CertManager      Pkcs11
//!   ▲          │ embeds       │ embeds       │ embeds
//!   └──────────┴──────────────┴──────────────┘
//!   (trust engine, cache, TLS builder)
//! ```
//!
//! # Thread Safety
//!
//! Implementations are `Send + Sync` and read their configuration without
//! locking; only the PKCS#11 session is serialized internally.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use rustls::pki_types::CertificateDer;
use tokio_util::sync::CancellationToken;
use x509_parser::pem::Pem;

use crate::config::ProviderKind;
use crate::{Error, Result};

pub use crate::enroll::{EnrollOutcome, ProgressFn};

/// The trust contract shared by every backend.
#[async_trait]
pub trait SecurityProvider: Send + Sync + fmt::Debug {
    /// Which backend this is.
    fn kind(&self) -> ProviderKind;

    /// The identity this process acts as.
    fn identity(&self) -> &str;

    /// Identity formatted as a caller token, `<scheme>=<identity>`.
    fn caller_name(&self) -> String;

    /// Identity from a caller token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCallerFormat`] if `caller` is not
    /// `<scheme>=<identity>`.
    fn caller_identity(&self, caller: &str) -> Result<String>;

    /// Every problem with the configured material, and whether there were
    /// none. Never mutates state.
    fn validate(&self) -> (Vec<String>, bool);

    /// RSA PKCS#1 v1.5 SHA-256 signature over `data`.
    fn sign_bytes(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Verify `signature` over `data` against `cert_pem`, or against this
    /// provider's own certificate when `None`.
    ///
    /// Returns `(true, <signer CN>)` on success and `(false, "")` on any
    /// failure.
    fn verify_signature_bytes(
        &self,
        data: &[u8],
        signature: &[u8],
        cert_pem: Option<&[u8]>,
    ) -> (bool, String);

    /// SHA-256 digest of `data`.
    fn checksum_bytes(&self, data: &[u8]) -> [u8; 32] {
        crate::crypto::checksum(data)
    }

    /// Server-side TLS configuration requiring client certificates.
    fn tls_config(&self) -> Result<rustls::ServerConfig>;

    /// Client-side TLS configuration presenting this identity when
    /// available.
    fn client_tls_config(&self) -> Result<rustls::ClientConfig>;

    /// Verify a PEM chain for client use and, unless empty, for `name`.
    ///
    /// # Errors
    ///
    /// [`Error::TrustStoreUnavailable`], [`Error::MalformedCertificate`],
    /// [`Error::UntrustedCertificate`] or [`Error::NameMismatch`].
    fn verify_certificate(&self, cert_pem: &[u8], name: &str) -> Result<()>;

    /// This identity's leaf certificate.
    fn public_cert(&self) -> Result<CertificateDer<'static>>;

    /// This identity's certificate file contents.
    fn public_cert_bytes(&self) -> Result<Vec<u8>>;

    /// This identity's leaf certificate as a decoded PEM block.
    fn public_cert_pem(&self) -> Result<Pem>;

    /// Validate a peer certificate and cache it under `identity`.
    ///
    /// # Errors
    ///
    /// [`Error::CertificateRejected`] when the certificate fails validation.
    fn cache_public_data(&self, cert_pem: &[u8], identity: &str) -> Result<()>;

    /// Previously cached certificate for `identity`.
    ///
    /// # Errors
    ///
    /// [`Error::NotCached`] when nothing is cached.
    fn cached_public_data(&self, identity: &str) -> Result<Vec<u8>>;

    /// Whether the holder of `cert_pem` may act as `name`; `Ok(true)` means
    /// privileged.
    fn should_allow_caller(&self, name: &str, cert_pem: &[u8]) -> Result<bool>;

    /// Obtain a CA-signed certificate.
    ///
    /// # Errors
    ///
    /// [`Error::EnrollmentUnsupported`] for backends without an enrollment
    /// protocol; otherwise see [`crate::enroll::Enrollment::run`].
    async fn enroll(
        &self,
        cancel: &CancellationToken,
        max_wait: Duration,
        progress: &ProgressFn<'_>,
    ) -> Result<EnrollOutcome>;

    /// Whether signing is delegated to a remote signer.
    fn is_remote_signing(&self) -> bool;

    /// Have the remote signer sign `payload`.
    ///
    /// # Errors
    ///
    /// [`Error::Signing`] when no remote signer is configured or it refuses.
    async fn remote_sign_request(
        &self,
        cancel: &CancellationToken,
        payload: &[u8],
    ) -> Result<Vec<u8>>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Caller tokens
// ─────────────────────────────────────────────────────────────────────────────

/// `<scheme>=<identity>`.
#[must_use]
pub fn caller_name(scheme: &str, identity: &str) -> String {
    format!("{scheme}={identity}")
}

/// Parse `<scheme>=<identity>` where identity is word characters, dots and
/// dashes.
///
/// # Errors
///
/// Returns [`Error::InvalidCallerFormat`] for anything else.
pub fn caller_identity(scheme: &str, caller: &str) -> Result<String> {
    let pattern = format!(r"^{}=([\w\.\-]+)$", regex::escape(scheme));
    let re = Regex::new(&pattern).map_err(|e| Error::config(format!("caller scheme: {e}")))?;

    re.captures(caller)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| Error::InvalidCallerFormat(caller.to_string()))
}
