//! Certificate identity extraction.
//!
//! Parses an X.509 DER-encoded certificate and extracts the names used for
//! trust decisions: Common Name, Organisational Unit, and the DNS, email and
//! URI entries of the Subject Alternative Name extension.

use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::FromDer;

use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Certificate identity
// ─────────────────────────────────────────────────────────────────────────────

/// Identity fields extracted from a certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertIdentity {
    /// Certificate Common Name (CN).
    pub common_name: Option<String>,

    /// First Organisational Unit (OU) in the subject.
    pub organizational_unit: Option<String>,

    /// Subject Alternative Name DNS entries.
    pub san_dns_names: Vec<String>,

    /// Subject Alternative Name RFC 822 (email) entries.
    pub san_emails: Vec<String>,

    /// Subject Alternative Name URI entries.
    pub san_uris: Vec<String>,

    /// Whether the certificate carries a SAN extension at all.
    pub has_san_extension: bool,
}

impl CertIdentity {
    /// Parse a DER-encoded certificate and extract its identity fields.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedCertificate`] if the certificate cannot be
    /// parsed or its SAN extension is malformed.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::MalformedCertificate(format!("cannot parse certificate: {e}")))?;

        Self::from_x509(&cert)
    }

    /// Extract identity fields from an already parsed certificate.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedCertificate`] if the SAN extension is malformed.
    pub fn from_x509(cert: &X509Certificate<'_>) -> Result<Self> {
        let mut id = Self {
            common_name: extract_cn(cert),
            organizational_unit: extract_ou(cert),
            ..Self::default()
        };

        let san = cert
            .subject_alternative_name()
            .map_err(|e| Error::MalformedCertificate(format!("invalid SAN extension: {e}")))?;

        if let Some(san_ext) = san {
            id.has_san_extension = true;
            for name in &san_ext.value.general_names {
                match name {
                    GeneralName::DNSName(dns) => id.san_dns_names.push((*dns).to_owned()),
                    GeneralName::RFC822Name(email) => id.san_emails.push((*email).to_owned()),
                    GeneralName::URI(uri) => id.san_uris.push((*uri).to_owned()),
                    _ => {}
                }
            }
        }

        Ok(id)
    }

    /// The Common Name followed by every DNS SAN, without duplicates.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::with_capacity(1 + self.san_dns_names.len());
        if let Some(cn) = self.common_name.as_deref() {
            names.push(cn);
        }
        for dns in &self.san_dns_names {
            if !names.contains(&dns.as_str()) {
                names.push(dns);
            }
        }
        names
    }

    /// Whether `name` equals the Common Name or one of the DNS SANs.
    #[must_use]
    pub fn matches_name(&self, name: &str) -> bool {
        self.common_name.as_deref() == Some(name) || self.san_dns_names.iter().any(|d| d == name)
    }

    /// Label for logs and error messages: the CN, else the first DNS SAN.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.common_name
            .as_deref()
            .or_else(|| self.san_dns_names.first().map(String::as_str))
            .unwrap_or("<unknown>")
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Extraction helpers
// ─────────────────────────────────────────────────────────────────────────────

fn extract_cn(cert: &X509Certificate<'_>) -> Option<String> {
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_owned)
}

fn extract_ou(cert: &X509Certificate<'_>) -> Option<String> {
    cert.subject()
        .iter_organizational_unit()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_owned)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
