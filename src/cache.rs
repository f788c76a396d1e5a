//! On-disk cache of accepted peer certificates.
//!
//! Entries are `<dir>/<identity>.pem`, written only after the certificate
//! passes the same trust decision as [`TrustEngine::should_allow_caller`].
//! Reads are not re-validated.

use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::enroll::artifacts::{PUBLIC_FILE_MODE, write_with_mode};
use crate::trust::TrustEngine;
use crate::{Error, Result};

/// Certificate cache rooted at one directory.
#[derive(Debug, Clone)]
pub struct CertCache {
    dir: PathBuf,
}

impl CertCache {
    /// Cache stored under `dir`; the directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Cache directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Location of the entry for `identity`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CertificateRejected`] for identities that are not a
    /// plain file name.
    pub fn path_for(&self, identity: &str) -> Result<PathBuf> {
        if identity.is_empty()
            || identity.contains(['/', '\\'])
            || identity.starts_with('.')
            || identity.contains("..")
        {
            return Err(Error::CertificateRejected {
                identity: identity.to_string(),
                reason: "identity is not usable as a cache key".to_string(),
            });
        }
        Ok(self.dir.join(format!("{identity}.pem")))
    }

    /// Validate `cert_pem` for `identity` and store it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CertificateRejected`] if the certificate does not pass
    /// the caller decision, or an IO error if it cannot be written.
    pub fn store(&self, engine: &TrustEngine, cert_pem: &[u8], identity: &str) -> Result<PathBuf> {
        let path = self.path_for(identity)?;

        let privileged = engine
            .should_allow_caller(identity, cert_pem)
            .map_err(|e| Error::CertificateRejected {
                identity: identity.to_string(),
                reason: e.to_string(),
            })?;

        std::fs::create_dir_all(&self.dir)?;
        write_with_mode(&path, cert_pem, PUBLIC_FILE_MODE)?;

        debug!(identity, privileged, path = %path.display(), "cached public certificate");
        Ok(path)
    }

    /// Previously stored certificate for `identity`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotCached`] if there is no entry.
    pub fn load(&self, identity: &str) -> Result<Vec<u8>> {
        let path = self.path_for(identity)?;
        match std::fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(Error::NotCached(identity.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
