//! Puppet CA HTTP protocol.
//!
//! | Step | Request | Trust |
//! |------|---------|-------|
//! | CA bundle | `GET /puppet-ca/v1/certificate/ca` | none, first contact |
//! | submit CSR | `PUT /puppet-ca/v1/certificate_request/<id>` | fetched CA |
//! | fetch cert | `GET /puppet-ca/v1/certificate/<id>` | fetched CA |
//!
//! Every request carries `environment=production`; bodies are raw PEM.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;
use url::Url;

use crate::enroll::{CertificateAuthority, SignedMaterial, as_directory};
use crate::tls;
use crate::{Error, Result};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for one identity's exchange with a Puppet CA.
#[derive(Debug, Clone)]
pub struct PuppetCa {
    base: Url,
    identity: String,
    ca_path: PathBuf,
}

impl PuppetCa {
    /// `ca_path` is where the fetched CA bundle is stored and later read
    /// back to authenticate the CA.
    pub fn new(base: Url, identity: impl Into<String>, ca_path: impl Into<PathBuf>) -> Self {
        Self {
            base: as_directory(base),
            identity: identity.into(),
            ca_path: ca_path.into(),
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        let mut url = self
            .base
            .join(path)
            .map_err(|e| Error::config(format!("invalid puppet CA path {path}: {e}")))?;
        url.set_query(Some("environment=production"));
        Ok(url)
    }

    fn insecure_client() -> Result<reqwest::Client> {
        Ok(reqwest::Client::builder()
            .use_preconfigured_tls(tls::insecure_client_config()?)
            .timeout(HTTP_TIMEOUT)
            .build()?)
    }

    fn trusted_client(&self) -> Result<reqwest::Client> {
        let ca = std::fs::read(&self.ca_path)?;
        Ok(reqwest::Client::builder()
            .use_preconfigured_tls(tls::pinned_client_config(&ca)?)
            .timeout(HTTP_TIMEOUT)
            .build()?)
    }
}

#[async_trait]
impl CertificateAuthority for PuppetCa {
    async fn fetch_ca(&self) -> Result<Option<String>> {
        let url = self.endpoint("puppet-ca/v1/certificate/ca")?;
        debug!(url = %url, "fetching puppet CA bundle");

        let response = Self::insecure_client()?.get(url.clone()).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(Error::Transport(format!("{url} returned {status}: {body}")));
        }

        Ok(Some(body))
    }

    async fn submit_csr(&self, csr_pem: &str, preexisting: bool) -> Result<()> {
        let url = self.endpoint(&format!(
            "puppet-ca/v1/certificate_request/{}",
            self.identity
        ))?;
        debug!(url = %url, preexisting, "submitting certificate request");

        let response = self
            .trusted_client()?
            .put(url.clone())
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(csr_pem.to_string())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Transport(format!("{url} returned {status}: {body}")));
        }

        Ok(())
    }

    async fn fetch_certificate(&self) -> Result<Option<SignedMaterial>> {
        let url = self.endpoint(&format!("puppet-ca/v1/certificate/{}", self.identity))?;

        let response = self.trusted_client()?.get(url.clone()).send().await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let body = response.text().await?;
        if !status.is_success() {
            return Err(Error::Transport(format!("{url} returned {status}: {body}")));
        }

        Ok(Some(SignedMaterial {
            certificate: body,
            ca: None,
        }))
    }

    fn tolerate_resubmit_failure(&self) -> bool {
        true
    }
}
