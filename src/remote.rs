//! Remote signing delegate.
//!
//! When configured, request signing is handed to an external service that
//! holds the authority to sign on the caller's behalf. The exchange is one
//! JSON POST:
//!
//! ```text
//! → {"request": "<base64 payload>", "token": "<bearer token>"}
//! ← {"secure_request": "<base64 signed payload>", "error": ""}
//! ```

use std::path::PathBuf;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::RemoteSignerConfig;
use crate::{Error, Result};

/// Something that signs request payloads on the caller's behalf.
#[async_trait]
pub trait RemoteSigner: Send + Sync {
    /// Sign `payload`, returning the signed form.
    async fn sign(&self, cancel: &CancellationToken, payload: &[u8]) -> Result<Vec<u8>>;
}

#[derive(Debug, Serialize)]
struct SignRequest<'a> {
    request: String,
    token: &'a str,
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    #[serde(default)]
    secure_request: String,
    #[serde(default)]
    error: String,
}

/// [`RemoteSigner`] talking JSON over HTTPS.
#[derive(Debug)]
pub struct HttpRemoteSigner {
    url: String,
    token_file: Option<PathBuf>,
    http: reqwest::Client,
}

impl HttpRemoteSigner {
    /// Build a signer using `tls` for the connection to the signing service.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] if the HTTP client cannot be built.
    pub fn new(config: &RemoteSignerConfig, tls: rustls::ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            url: config.url.clone(),
            token_file: config.token_file.clone(),
            http,
        })
    }

    fn token(&self) -> Result<String> {
        match &self.token_file {
            Some(path) => Ok(std::fs::read_to_string(path)?.trim().to_string()),
            None => Ok(String::new()),
        }
    }
}

#[async_trait]
impl RemoteSigner for HttpRemoteSigner {
    async fn sign(&self, cancel: &CancellationToken, payload: &[u8]) -> Result<Vec<u8>> {
        let token = self.token()?;
        let body = SignRequest {
            request: STANDARD.encode(payload),
            token: &token,
        };

        debug!(url = %self.url, bytes = payload.len(), "requesting remote signature");

        let send = self.http.post(&self.url).json(&body).send();
        let response = tokio::select! {
            () = cancel.cancelled() => {
                return Err(Error::Signing("remote signing cancelled".to_string()));
            }
            r = send => r?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transport(format!(
                "remote signer {} returned {status}",
                self.url
            )));
        }

        let reply: SignResponse = response.json().await?;
        if !reply.error.is_empty() {
            return Err(Error::Signing(format!("remote signer: {}", reply.error)));
        }
        if reply.secure_request.is_empty() {
            return Err(Error::Signing("remote signer returned no request".to_string()));
        }

        STANDARD
            .decode(reply.secure_request.as_bytes())
            .map_err(|e| Error::Signing(format!("remote signer returned invalid base64: {e}")))
    }
}
