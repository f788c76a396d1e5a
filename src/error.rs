//! Error types for the trust provider

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for the trust provider
pub type Result<T> = std::result::Result<T, Error>;

/// Trust provider errors
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or contradictory configuration; fatal at construction
    #[error("Configuration error: {0}")]
    ConfigurationInvalid(String),

    /// The CA bundle could not be read or contained no usable anchors
    #[error("Trust store unavailable: {0}")]
    TrustStoreUnavailable(String),

    /// Bytes that should hold a certificate do not decode as one
    #[error("Malformed certificate: {0}")]
    MalformedCertificate(String),

    /// The certificate chain did not verify against the CA bundle
    #[error("Untrusted certificate: {0}")]
    UntrustedCertificate(String),

    /// The certificate chain is valid but not for the requested name
    #[error("Name mismatch: certificate is valid for {valid}, not {requested}")]
    NameMismatch {
        /// Name the caller asked for
        requested: String,
        /// Names the certificate actually carries
        valid: String,
    },

    /// The caller holds a valid certificate but is not on the allow list
    #[error("Caller not allowed: {0} does not match any allow list entry")]
    CallerNotAllowed(String),

    /// Key material is neither PKCS#1 nor PKCS#8 RSA
    #[error("Unsupported key type: {0}")]
    UnsupportedKeyType(String),

    /// Enrollment refuses to overwrite an existing private key
    #[error("Private key already exists: {}", .0.display())]
    KeyAlreadyExists(PathBuf),

    /// Enrollment refuses to overwrite an existing CSR
    #[error("Certificate signing request already exists: {}", .0.display())]
    CsrAlreadyExists(PathBuf),

    /// The backend has no enrollment protocol
    #[error("Enrollment is not supported by the {0} provider")]
    EnrollmentUnsupported(&'static str),

    /// The poll loop reached its deadline without a signed certificate
    #[error("Enrollment timed out after {attempts} attempt(s){}", last_error_suffix(.last_error.as_deref()))]
    EnrollmentTimedOut {
        /// Number of certificate fetch attempts made
        attempts: u32,
        /// Text of the most recent CA-side failure, if any
        last_error: Option<String>,
    },

    /// Enrollment was cancelled by the caller
    #[error("Enrollment interrupted after {attempts} attempt(s)")]
    EnrollmentInterrupted {
        /// Number of certificate fetch attempts made
        attempts: u32,
    },

    /// No cached certificate exists for the identity
    #[error("No cached certificate for {0}")]
    NotCached(String),

    /// A certificate offered for caching failed validation
    #[error("Certificate for {identity} rejected: {reason}")]
    CertificateRejected {
        /// Identity the certificate was offered for
        identity: String,
        /// Why it was rejected
        reason: String,
    },

    /// A caller token does not have the `<scheme>=<identity>` shape
    #[error("Invalid caller format: {0}")]
    InvalidCallerFormat(String),

    /// Signature creation failed
    #[error("Signing failed: {0}")]
    Signing(String),

    /// PKCS#11 driver or token failure
    #[error("Token error: {0}")]
    Token(String),

    /// A remote endpoint answered with a non-success status
    #[error("Transport error: {0}")]
    Transport(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
}

impl Error {
    /// Whether the error is an expected verification/authorization outcome
    /// rather than a local fault.
    #[must_use]
    pub fn is_trust_failure(&self) -> bool {
        matches!(
            self,
            Self::UntrustedCertificate(_)
                | Self::NameMismatch { .. }
                | Self::CallerNotAllowed(_)
                | Self::MalformedCertificate(_)
                | Self::CertificateRejected { .. }
        )
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::ConfigurationInvalid(msg.into())
    }
}

fn last_error_suffix(last: Option<&str>) -> String {
    last.map(|e| format!(": last error: {e}")).unwrap_or_default()
}
