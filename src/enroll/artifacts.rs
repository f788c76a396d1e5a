//! Enrollment artifacts on disk: private key, CSR, signed certificate and
//! CA bundle.
//!
//! Key and CSR are created at most once. `write_new_*` refuse to replace an
//! existing file; `ensure_*` load what is there and only create what is
//! missing.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use rcgen::string::Ia5String;
use rcgen::{CertificateParams, DistinguishedName, DnType, SanType};
use tracing::{debug, info};

use crate::crypto::{RsaKey, checksum_hex};
use crate::{Error, Result};

/// Mode for private keys and CSRs.
pub const PRIVATE_FILE_MODE: u32 = 0o600;

/// Mode for certificates and cache entries.
pub const PUBLIC_FILE_MODE: u32 = 0o644;

/// Subject of a certificate signing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrSubject {
    /// Common Name; the enrolling identity.
    pub common_name: String,
    /// Fixed organizational marker.
    pub organizational_unit: String,
    /// Additional DNS names requested as SANs.
    pub dns_names: Vec<String>,
}

/// A CSR together with its SHA-256 digest and whether it was already on disk.
#[derive(Debug, Clone)]
pub struct CsrArtifact {
    /// PEM encoded request.
    pub pem: String,
    /// Lowercase hex SHA-256 of the PEM bytes.
    pub digest: String,
    /// Whether the request came from an earlier, possibly interrupted run.
    pub preexisting: bool,
}

/// Where one identity's enrollment artifacts live.
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    /// Private key.
    pub key: PathBuf,
    /// Certificate signing request.
    pub csr: PathBuf,
    /// Signed certificate.
    pub certificate: PathBuf,
    /// CA bundle.
    pub ca: PathBuf,
    /// Directories to create, with their modes, parents first.
    pub directories: Vec<(PathBuf, u32)>,
}

impl ArtifactLayout {
    /// Whether key, CA and certificate all exist.
    #[must_use]
    pub fn complete(&self) -> bool {
        self.key.is_file() && self.ca.is_file() && self.certificate.is_file()
    }

    /// Create every directory, then (re)apply its mode.
    pub fn prepare_directories(&self) -> Result<()> {
        for (dir, mode) in &self.directories {
            create_dir_with_mode(dir, *mode)?;
        }
        Ok(())
    }

    /// Generate and persist a new RSA-2048 key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyAlreadyExists`] if a key is already present.
    pub fn write_new_key(&self) -> Result<RsaKey> {
        if self.key.exists() {
            return Err(Error::KeyAlreadyExists(self.key.clone()));
        }

        let key = RsaKey::generate()?;
        write_with_mode(&self.key, key.to_pkcs8_pem()?.as_bytes(), PRIVATE_FILE_MODE)?;
        info!(path = %self.key.display(), bits = key.bits(), "generated private key");
        Ok(key)
    }

    /// Load the key, creating it first if absent.
    pub fn ensure_key(&self) -> Result<RsaKey> {
        if self.key.exists() {
            debug!(path = %self.key.display(), "using existing private key");
            return RsaKey::from_pem(&fs::read(&self.key)?);
        }
        self.write_new_key()
    }

    /// Build and persist a new CSR for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CsrAlreadyExists`] if a CSR is already present.
    pub fn write_new_csr(&self, key: &RsaKey, subject: &CsrSubject) -> Result<CsrArtifact> {
        if self.csr.exists() {
            return Err(Error::CsrAlreadyExists(self.csr.clone()));
        }

        let pem = build_csr(key, subject)?;
        write_with_mode(&self.csr, pem.as_bytes(), PRIVATE_FILE_MODE)?;
        let digest = checksum_hex(pem.as_bytes());
        info!(path = %self.csr.display(), %digest, "created certificate signing request");

        Ok(CsrArtifact {
            pem,
            digest,
            preexisting: false,
        })
    }

    /// Load the CSR, creating it first if absent.
    pub fn ensure_csr(&self, key: &RsaKey, subject: &CsrSubject) -> Result<CsrArtifact> {
        if self.csr.exists() {
            let pem = fs::read_to_string(&self.csr)?;
            let digest = checksum_hex(pem.as_bytes());
            debug!(path = %self.csr.display(), %digest, "using existing certificate signing request");
            return Ok(CsrArtifact {
                pem,
                digest,
                preexisting: true,
            });
        }
        self.write_new_csr(key, subject)
    }

    /// Persist the CA bundle.
    pub fn write_ca(&self, pem: &str) -> Result<()> {
        write_with_mode(&self.ca, pem.as_bytes(), PUBLIC_FILE_MODE)
    }

    /// Persist the signed certificate.
    pub fn write_certificate(&self, pem: &str) -> Result<()> {
        write_with_mode(&self.certificate, pem.as_bytes(), PUBLIC_FILE_MODE)
    }
}

/// PEM CSR with CN, OU and DNS SANs from `subject`, signed by `key`.
pub fn build_csr(key: &RsaKey, subject: &CsrSubject) -> Result<String> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, subject.common_name.as_str());
    dn.push(
        DnType::OrganizationalUnitName,
        subject.organizational_unit.as_str(),
    );
    params.distinguished_name = dn;

    params.subject_alt_names = subject
        .dns_names
        .iter()
        .map(|name| {
            Ia5String::try_from(name.as_str())
                .map(SanType::DnsName)
                .map_err(|e| Error::config(format!("invalid DNS name '{name}': {e}")))
        })
        .collect::<Result<_>>()?;

    let signer = key.to_rcgen()?;
    params
        .serialize_request(&signer)
        .and_then(|csr| csr.pem())
        .map_err(|e| Error::Signing(format!("cannot build CSR: {e}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// File helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Write `data` to `path` as a whole file with `mode` on unix.
pub(crate) fn write_with_mode(path: &Path, data: &[u8], mode: u32) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }

    let mut file = options.open(path)?;
    file.write_all(data)?;
    file.sync_all()?;
    set_mode(path, mode)
}

pub(crate) fn create_dir_with_mode(path: &Path, mode: u32) -> Result<()> {
    fs::create_dir_all(path)?;
    set_mode(path, mode)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(dir: &Path) -> ArtifactLayout {
        ArtifactLayout {
            key: dir.join("keys/me.pem"),
            csr: dir.join("csr/me.pem"),
            certificate: dir.join("certs/me.pem"),
            ca: dir.join("certs/ca.pem"),
            directories: vec![
                (dir.join("keys"), 0o750),
                (dir.join("csr"), 0o755),
                (dir.join("certs"), 0o755),
            ],
        }
    }

    fn subject() -> CsrSubject {
        CsrSubject {
            common_name: "rip.mcollective".into(),
            organizational_unit: "mcollective".into(),
            dns_names: vec!["rip.example.net".into()],
        }
    }

    #[test]
    fn ensure_key_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let l = layout(dir.path());
        l.prepare_directories().unwrap();

        let first = l.ensure_key().unwrap();
        let second = l.ensure_key().unwrap();

        assert_eq!(first.to_pkcs8_der().unwrap(), second.to_pkcs8_der().unwrap());
    }

    #[test]
    fn write_new_key_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let l = layout(dir.path());
        l.prepare_directories().unwrap();
        l.write_new_key().unwrap();

        assert!(matches!(l.write_new_key(), Err(Error::KeyAlreadyExists(_))));
    }

    #[test]
    fn ensure_csr_returns_the_same_request_and_digest() {
        let dir = tempfile::tempdir().unwrap();
        let l = layout(dir.path());
        l.prepare_directories().unwrap();
        let key = l.ensure_key().unwrap();

        let first = l.ensure_csr(&key, &subject()).unwrap();
        let second = l.ensure_csr(&key, &subject()).unwrap();

        assert!(!first.preexisting);
        assert!(second.preexisting);
        assert_eq!(first.pem, second.pem);
        assert_eq!(first.digest, second.digest);
        assert_eq!(first.digest, checksum_hex(first.pem.as_bytes()));
        assert!(matches!(
            l.write_new_csr(&key, &subject()),
            Err(Error::CsrAlreadyExists(_))
        ));
    }

    #[test]
    fn csr_carries_subject_and_sans() {
        use x509_parser::prelude::FromDer;

        let key = RsaKey::generate().unwrap();
        let pem = build_csr(&key, &subject()).unwrap();
        let (_, block) = x509_parser::pem::parse_x509_pem(pem.as_bytes()).unwrap();
        let (_, csr) =
            x509_parser::certification_request::X509CertificationRequest::from_der(&block.contents)
                .unwrap();

        let info = &csr.certification_request_info;
        let cn = info.subject.iter_common_name().next().unwrap().as_str().unwrap();
        let ou = info
            .subject
            .iter_organizational_unit()
            .next()
            .unwrap()
            .as_str()
            .unwrap();
        assert_eq!(cn, "rip.mcollective");
        assert_eq!(ou, "mcollective");
    }

    #[test]
    fn complete_requires_key_ca_and_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let l = layout(dir.path());
        l.prepare_directories().unwrap();
        l.ensure_key().unwrap();
        assert!(!l.complete());

        l.write_ca("ca").unwrap();
        assert!(!l.complete());

        l.write_certificate("cert").unwrap();
        assert!(l.complete());
    }

    #[cfg(unix)]
    #[test]
    fn modes_are_applied() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let l = layout(dir.path());
        l.prepare_directories().unwrap();
        l.ensure_key().unwrap();

        let mode = |p: &Path| fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&l.key), 0o600);
        assert_eq!(mode(&dir.path().join("keys")), 0o750);
    }
}
