//! cert-manager `CertificateRequest` client.
//!
//! Talks to the in-cluster Kubernetes API with the pod's service-account
//! token. The request is named after the identity; the signed certificate
//! and CA arrive together in its status as base64 PEM.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::CertManagerConfig;
use crate::crypto;
use crate::enroll::{CertificateAuthority, SignedMaterial, as_directory};
use crate::tls;
use crate::{Error, Result};

const API_GROUP: &str = "cert-manager.io";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Usages requested for every certificate.
pub const USAGES: [&str; 4] = [
    "digital signature",
    "key encipherment",
    "server auth",
    "client auth",
];

// ─────────────────────────────────────────────────────────────────────────────
// Resource shapes
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CertificateRequest<'a> {
    api_version: &'a str,
    kind: &'a str,
    metadata: Metadata<'a>,
    spec: Spec<'a>,
}

#[derive(Debug, Serialize)]
struct Metadata<'a> {
    name: &'a str,
    namespace: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Spec<'a> {
    request: String,
    #[serde(rename = "isCA")]
    is_ca: bool,
    usages: &'a [&'a str],
    issuer_ref: IssuerRef<'a>,
}

#[derive(Debug, Serialize)]
struct IssuerRef<'a> {
    name: &'a str,
    kind: &'a str,
    group: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct RequestState {
    #[serde(default)]
    status: Status,
}

#[derive(Debug, Default, Deserialize)]
struct Status {
    #[serde(default)]
    certificate: Option<String>,
    #[serde(default)]
    ca: Option<String>,
    #[serde(default)]
    conditions: Vec<Condition>,
}

#[derive(Debug, Deserialize)]
struct Condition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────────────────────────

/// `CertificateRequest` lifecycle for one identity.
#[derive(Debug)]
pub struct CertManagerApi {
    base: Url,
    namespace: String,
    name: String,
    issuer: String,
    issuer_kind: String,
    replace: bool,
    token: String,
    http: reqwest::Client,
}

impl CertManagerApi {
    /// Build a client from the service-account directory.
    ///
    /// Reads `token` and, when present, `ca.crt` to authenticate the API
    /// server.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationInvalid`] if the token cannot be read or
    /// the API URL is invalid.
    pub fn new(config: &CertManagerConfig, identity: &str, namespace: &str) -> Result<Self> {
        let sa = &config.service_account_dir;
        let token = std::fs::read_to_string(sa.join("token"))
            .map_err(|e| {
                Error::config(format!(
                    "cannot read service account token in {}: {e}",
                    sa.display()
                ))
            })?
            .trim()
            .to_string();

        let base = Url::parse(&config.api_url)
            .map_err(|e| Error::config(format!("invalid cert_manager.api_url: {e}")))?;

        Ok(Self {
            base: as_directory(base),
            namespace: namespace.to_string(),
            name: identity.to_string(),
            issuer: config.issuer.clone(),
            issuer_kind: config.issuer_kind.clone(),
            replace: config.replace,
            token,
            http: api_client(&sa.join("ca.crt"))?,
        })
    }

    fn collection_url(&self) -> Result<Url> {
        self.base
            .join(&format!(
                "apis/{API_GROUP}/v1/namespaces/{}/certificaterequests",
                self.namespace
            ))
            .map_err(|e| Error::config(format!("invalid API path: {e}")))
    }

    fn item_url(&self) -> Result<Url> {
        self.base
            .join(&format!(
                "apis/{API_GROUP}/v1/namespaces/{}/certificaterequests/{}",
                self.namespace, self.name
            ))
            .map_err(|e| Error::config(format!("invalid API path: {e}")))
    }

    async fn create(&self, csr_pem: &str) -> Result<StatusCode> {
        let body = CertificateRequest {
            api_version: "cert-manager.io/v1",
            kind: "CertificateRequest",
            metadata: Metadata {
                name: &self.name,
                namespace: &self.namespace,
            },
            spec: Spec {
                request: STANDARD.encode(csr_pem.as_bytes()),
                is_ca: false,
                usages: &USAGES,
                issuer_ref: IssuerRef {
                    name: &self.issuer,
                    kind: &self.issuer_kind,
                    group: API_GROUP,
                },
            },
        };

        let response = self
            .http
            .post(self.collection_url()?)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() || status == StatusCode::CONFLICT {
            return Ok(status);
        }

        let text = response.text().await.unwrap_or_default();
        Err(Error::Transport(format!(
            "creating CertificateRequest {} returned {status}: {text}",
            self.name
        )))
    }

    async fn delete(&self) -> Result<()> {
        let response = self
            .http
            .delete(self.item_url()?)
            .bearer_auth(&self.token)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }

        Err(Error::Transport(format!(
            "deleting CertificateRequest {} returned {status}",
            self.name
        )))
    }
}

#[async_trait]
impl CertificateAuthority for CertManagerApi {
    async fn fetch_ca(&self) -> Result<Option<String>> {
        Ok(None)
    }

    async fn submit_csr(&self, csr_pem: &str, _preexisting: bool) -> Result<()> {
        if self.create(csr_pem).await? != StatusCode::CONFLICT {
            info!(name = %self.name, namespace = %self.namespace, "created CertificateRequest");
            return Ok(());
        }

        if !self.replace {
            return Err(Error::Transport(format!(
                "CertificateRequest {}/{} already exists",
                self.namespace, self.name
            )));
        }

        warn!(name = %self.name, namespace = %self.namespace, "replacing existing CertificateRequest");
        self.delete().await?;

        match self.create(csr_pem).await? {
            StatusCode::CONFLICT => Err(Error::Transport(format!(
                "CertificateRequest {}/{} still exists after delete",
                self.namespace, self.name
            ))),
            _ => Ok(()),
        }
    }

    async fn fetch_certificate(&self) -> Result<Option<SignedMaterial>> {
        let response = self
            .http
            .get(self.item_url()?)
            .bearer_auth(&self.token)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(Error::Transport(format!(
                "reading CertificateRequest {} returned {status}",
                self.name
            )));
        }

        let state: RequestState = response.json().await?;

        if let Some(c) = state
            .status
            .conditions
            .iter()
            .find(|c| (c.kind == "Denied" || c.kind == "Failed") && c.status == "True")
        {
            return Err(Error::Transport(format!(
                "CertificateRequest {} {}: {} {}",
                self.name,
                c.kind.to_lowercase(),
                c.reason,
                c.message
            )));
        }

        let Some(certificate) = state.status.certificate.filter(|c| !c.is_empty()) else {
            debug!(name = %self.name, "CertificateRequest not issued yet");
            return Ok(None);
        };

        let certificate = decode_pem_field("certificate", &certificate)?;
        let ca = match state.status.ca.filter(|c| !c.is_empty()) {
            Some(ca) => Some(decode_pem_field("ca", &ca)?),
            None => {
                let root = crypto::chain_root(&certificate);
                if root.is_none() {
                    warn!(
                        name = %self.name,
                        "issuer returned no CA and no chain; ca.pem stays missing and the next run requests a new certificate"
                    );
                }
                root
            }
        };

        Ok(Some(SignedMaterial { certificate, ca }))
    }
}

fn decode_pem_field(field: &str, value: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(value.as_bytes())
        .map_err(|e| Error::MalformedCertificate(format!("status.{field} is not base64: {e}")))?;
    String::from_utf8(bytes)
        .map_err(|e| Error::MalformedCertificate(format!("status.{field} is not PEM: {e}")))
}

fn api_client(ca_path: &Path) -> Result<reqwest::Client> {
    let tls = if ca_path.is_file() {
        tls::pinned_client_config(&std::fs::read(ca_path)?)?
    } else {
        warn!(path = %ca_path.display(), "no service account CA, API server is not authenticated");
        tls::insecure_client_config()?
    };

    Ok(reqwest::Client::builder()
        .use_preconfigured_tls(tls)
        .timeout(HTTP_TIMEOUT)
        .build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{bearer_token, body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const COLLECTION: &str = "/apis/cert-manager.io/v1/namespaces/choria/certificaterequests";
    const ITEM: &str = "/apis/cert-manager.io/v1/namespaces/choria/certificaterequests/rip.mcollective";

    fn api(server: &MockServer, sa: &Path, replace: bool) -> CertManagerApi {
        std::fs::write(sa.join("token"), "tok\n").unwrap();
        let config = CertManagerConfig {
            api_url: server.uri(),
            service_account_dir: sa.to_path_buf(),
            issuer: "choria-ca".into(),
            replace,
            ..CertManagerConfig::default()
        };
        CertManagerApi::new(&config, "rip.mcollective", "choria").unwrap()
    }

    #[tokio::test]
    async fn creates_request_with_issuer_and_usages() {
        let server = MockServer::start().await;
        let sa = tempfile::tempdir().unwrap();
        Mock::given(method("POST"))
            .and(path(COLLECTION))
            .and(bearer_token("tok"))
            .and(body_partial_json(serde_json::json!({
                "apiVersion": "cert-manager.io/v1",
                "kind": "CertificateRequest",
                "metadata": {"name": "rip.mcollective", "namespace": "choria"},
                "spec": {
                    "request": STANDARD.encode("CSR PEM"),
                    "isCA": false,
                    "usages": USAGES,
                    "issuerRef": {"name": "choria-ca", "kind": "Issuer", "group": "cert-manager.io"},
                },
            })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        api(&server, sa.path(), false)
            .submit_csr("CSR PEM", false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn conflict_without_replace_fails() {
        let server = MockServer::start().await;
        let sa = tempfile::tempdir().unwrap();
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(409))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let err = api(&server, sa.path(), false)
            .submit_csr("CSR PEM", false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn conflict_with_replace_deletes_and_recreates() {
        let server = MockServer::start().await;
        let sa = tempfile::tempdir().unwrap();
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(409))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(ITEM))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        api(&server, sa.path(), true)
            .submit_csr("CSR PEM", false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn issued_request_yields_certificate_and_ca() {
        let server = MockServer::start().await;
        let sa = tempfile::tempdir().unwrap();
        Mock::given(method("GET"))
            .and(path(ITEM))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": {
                    "certificate": STANDARD.encode("CERT PEM"),
                    "ca": STANDARD.encode("CA PEM"),
                    "conditions": [{"type": "Ready", "status": "True"}],
                }
            })))
            .mount(&server)
            .await;

        let material = api(&server, sa.path(), false)
            .fetch_certificate()
            .await
            .unwrap()
            .unwrap();

        assert_eq!(material.certificate, "CERT PEM");
        assert_eq!(material.ca.as_deref(), Some("CA PEM"));
    }

    #[tokio::test]
    async fn missing_ca_falls_back_to_the_chain_root() {
        let pki = crate::testing::TestPki::new();
        let leaf = pki.issue("rip.mcollective", &[]);
        let chain = format!("{}{}", leaf.cert_pem, pki.ca_pem);
        let server = MockServer::start().await;
        let sa = tempfile::tempdir().unwrap();
        Mock::given(method("GET"))
            .and(path(ITEM))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": {"certificate": STANDARD.encode(&chain)}
            })))
            .mount(&server)
            .await;

        let material = api(&server, sa.path(), false)
            .fetch_certificate()
            .await
            .unwrap()
            .unwrap();

        assert_eq!(material.certificate, chain);
        let ca = material.ca.expect("CA from chain");
        assert_eq!(
            crypto::decode_certificates(ca.as_bytes()).unwrap(),
            crypto::decode_certificates(pki.ca_pem.as_bytes()).unwrap()
        );
    }

    #[tokio::test]
    async fn lone_certificate_without_ca_leaves_ca_unset() {
        let server = MockServer::start().await;
        let sa = tempfile::tempdir().unwrap();
        Mock::given(method("GET"))
            .and(path(ITEM))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": {"certificate": STANDARD.encode("CERT PEM")}
            })))
            .mount(&server)
            .await;

        let material = api(&server, sa.path(), false)
            .fetch_certificate()
            .await
            .unwrap()
            .unwrap();

        assert_eq!(material.ca, None);
    }

    #[tokio::test]
    async fn api_url_path_prefix_is_preserved() {
        let server = MockServer::start().await;
        let sa = tempfile::tempdir().unwrap();
        std::fs::write(sa.path().join("token"), "tok\n").unwrap();
        let config = CertManagerConfig {
            api_url: format!("{}/k8s", server.uri()),
            service_account_dir: sa.path().to_path_buf(),
            issuer: "choria-ca".into(),
            ..CertManagerConfig::default()
        };
        Mock::given(method("POST"))
            .and(path(format!("/k8s{COLLECTION}")))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        CertManagerApi::new(&config, "rip.mcollective", "choria")
            .unwrap()
            .submit_csr("CSR PEM", false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn pending_request_is_not_ready() {
        let server = MockServer::start().await;
        let sa = tempfile::tempdir().unwrap();
        Mock::given(method("GET"))
            .and(path(ITEM))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": {"conditions": [{"type": "Ready", "status": "False", "reason": "Pending"}]}
            })))
            .mount(&server)
            .await;

        assert_eq!(
            api(&server, sa.path(), false)
                .fetch_certificate()
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn denied_request_is_an_error() {
        let server = MockServer::start().await;
        let sa = tempfile::tempdir().unwrap();
        Mock::given(method("GET"))
            .and(path(ITEM))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": {"conditions": [{
                    "type": "Denied", "status": "True",
                    "reason": "PolicyViolation", "message": "no"
                }]}
            })))
            .mount(&server)
            .await;

        let err = api(&server, sa.path(), false)
            .fetch_certificate()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("PolicyViolation"));
    }

    #[test]
    fn missing_token_is_a_configuration_error() {
        let sa = tempfile::tempdir().unwrap();
        let config = CertManagerConfig {
            service_account_dir: sa.path().to_path_buf(),
            ..CertManagerConfig::default()
        };
        assert!(matches!(
            CertManagerApi::new(&config, "rip.mcollective", "choria"),
            Err(Error::ConfigurationInvalid(_))
        ));
    }
}
