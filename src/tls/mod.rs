//! TLS configuration building.
//!
//! Provides:
//! - [`server_config`] / [`client_config`]: mutual-TLS `rustls` configs
//!   from identity material plus the [`TlsPolicyConfig`]
//! - [`load_certs`] / [`load_private_key`] / [`load_root_store`]: PEM file
//!   loading
//! - [`provider_for`]: the `aws-lc-rs` crypto provider narrowed to the
//!   configured cipher suites and key-exchange groups
//!
//! The protocol floor is TLS 1.3. The CA bundle serves as both the server
//! verification roots and the accepted client CAs.

pub mod verifier;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::ResolvesClientCert;
use rustls::client::danger::ServerCertVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::danger::ClientCertVerifier;
use rustls::server::{ResolvesServerCert, WebPkiClientVerifier};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tracing::debug;

use crate::config::TlsPolicyConfig;
use crate::tls::verifier::{InsecureVerifier, LegacyCnVerifier};
use crate::{Error, Result};

static PROTOCOL_VERSIONS: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS13];

// ─────────────────────────────────────────────────────────────────────────────
// Identity material
// ─────────────────────────────────────────────────────────────────────────────

/// Certificate a server presents.
#[derive(Debug, Clone)]
pub enum ServerIdentity {
    /// PEM certificate chain and private key on disk.
    Files {
        /// Certificate chain, leaf first.
        certificate: PathBuf,
        /// Private key.
        key: PathBuf,
    },
    /// Certificate chosen per handshake, e.g. backed by a hardware token.
    Resolver(Arc<dyn ResolvesServerCert>),
}

/// Certificate a client presents, if any.
#[derive(Debug, Clone)]
pub enum ClientIdentity {
    /// Server-trust-only configuration.
    None,
    /// PEM certificate chain and private key on disk.
    Files {
        /// Certificate chain, leaf first.
        certificate: PathBuf,
        /// Private key.
        key: PathBuf,
    },
    /// Certificate chosen per handshake.
    Resolver(Arc<dyn ResolvesClientCert>),
}

impl ClientIdentity {
    /// [`ClientIdentity::Files`] when both files exist, otherwise
    /// [`ClientIdentity::None`].
    #[must_use]
    pub fn when_present(certificate: &Path, key: &Path) -> Self {
        if certificate.is_file() && key.is_file() {
            Self::Files {
                certificate: certificate.to_path_buf(),
                key: key.to_path_buf(),
            }
        } else {
            Self::None
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Public: config builders
// ─────────────────────────────────────────────────────────────────────────────

/// Build a `rustls::ServerConfig` requiring client certificates signed by
/// the CA at `ca`.
///
/// With `disable_verify` set, client certificates are not requested and the
/// CA bundle is not read.
///
/// # Errors
///
/// Returns an error if any certificate or key file cannot be read or parsed,
/// the cipher policy selects nothing, or rustls rejects the combination
/// (e.g. mismatched cert/key pair).
pub fn server_config(
    ca: &Path,
    policy: &TlsPolicyConfig,
    identity: ServerIdentity,
) -> Result<ServerConfig> {
    let provider = provider_for(policy)?;
    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(PROTOCOL_VERSIONS)?;

    let builder = if policy.disable_verify {
        builder.with_no_client_auth()
    } else {
        let roots = Arc::new(load_root_store(ca)?);
        let verifier: Arc<dyn ClientCertVerifier> =
            WebPkiClientVerifier::builder_with_provider(roots, provider)
                .build()
                .map_err(|e| Error::TrustStoreUnavailable(format!("client verifier: {e}")))?;
        builder.with_client_cert_verifier(verifier)
    };

    let config = match identity {
        ServerIdentity::Files { certificate, key } => builder
            .with_single_cert(load_certs(&certificate)?, load_private_key(&key)?)
            .map_err(|e| Error::config(format!("TLS config error (cert/key mismatch?): {e}")))?,
        ServerIdentity::Resolver(resolver) => builder.with_cert_resolver(resolver),
    };

    debug!(
        ca = %ca.display(),
        disable_verify = policy.disable_verify,
        "TLS server config built"
    );

    Ok(config)
}

/// Build a `rustls::ClientConfig` trusting the CA at `ca`.
///
/// `backward_compat_verification` installs [`LegacyCnVerifier`];
/// `disable_verify` installs [`InsecureVerifier`] and skips the CA bundle.
///
/// # Errors
///
/// See [`server_config`].
pub fn client_config(
    ca: &Path,
    policy: &TlsPolicyConfig,
    identity: ClientIdentity,
) -> Result<ClientConfig> {
    let provider = provider_for(policy)?;
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(PROTOCOL_VERSIONS)?;

    let builder = if policy.disable_verify {
        let verifier: Arc<dyn ServerCertVerifier> = Arc::new(InsecureVerifier::new(provider));
        builder
            .dangerous()
            .with_custom_certificate_verifier(verifier)
    } else if policy.backward_compat_verification {
        let roots = Arc::new(load_root_store(ca)?);
        let verifier: Arc<dyn ServerCertVerifier> =
            Arc::new(LegacyCnVerifier::new(roots, provider)?);
        builder
            .dangerous()
            .with_custom_certificate_verifier(verifier)
    } else {
        builder.with_root_certificates(load_root_store(ca)?)
    };

    let config = match identity {
        ClientIdentity::None => builder.with_no_client_auth(),
        ClientIdentity::Files { certificate, key } => builder
            .with_client_auth_cert(load_certs(&certificate)?, load_private_key(&key)?)
            .map_err(|e| Error::config(format!("TLS client auth error (cert/key mismatch?): {e}")))?,
        ClientIdentity::Resolver(resolver) => builder.with_client_cert_resolver(resolver),
    };

    debug!(
        ca = %ca.display(),
        disable_verify = policy.disable_verify,
        legacy = policy.backward_compat_verification,
        "TLS client config built"
    );

    Ok(config)
}

/// Client config for bootstrap requests made before any trust exists.
///
/// # Errors
///
/// Fails only if the default provider cannot be restricted to TLS 1.3.
pub fn insecure_client_config() -> Result<ClientConfig> {
    let provider = default_provider();
    let verifier: Arc<dyn ServerCertVerifier> = Arc::new(InsecureVerifier::new(provider.clone()));
    Ok(ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(PROTOCOL_VERSIONS)?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth())
}

/// Client config trusting exactly the certificates in `ca_pem`.
///
/// # Errors
///
/// Returns [`Error::TrustStoreUnavailable`] if `ca_pem` yields no anchors.
pub fn pinned_client_config(ca_pem: &[u8]) -> Result<ClientConfig> {
    let roots = root_store_from_pem(ca_pem, "<memory>")?;
    Ok(ClientConfig::builder_with_provider(default_provider())
        .with_protocol_versions(PROTOCOL_VERSIONS)?
        .with_root_certificates(roots)
        .with_no_client_auth())
}

// ─────────────────────────────────────────────────────────────────────────────
// Public: crypto provider
// ─────────────────────────────────────────────────────────────────────────────

/// The unrestricted `aws-lc-rs` provider.
#[must_use]
pub fn default_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// The `aws-lc-rs` provider restricted to the configured cipher suites and
/// curves, in configuration order.
///
/// Names are matched case-insensitively against the rustls names, e.g.
/// `TLS13_AES_256_GCM_SHA384` or `X25519`. Empty lists keep the defaults.
///
/// # Errors
///
/// Returns [`Error::ConfigurationInvalid`] if a non-empty list selects
/// nothing supported.
pub fn provider_for(policy: &TlsPolicyConfig) -> Result<Arc<CryptoProvider>> {
    let mut provider = rustls::crypto::aws_lc_rs::default_provider();

    if !policy.cipher_suites.is_empty() {
        let available = std::mem::take(&mut provider.cipher_suites);
        provider.cipher_suites = select(&policy.cipher_suites, &available, |s| {
            format!("{:?}", s.suite())
        });
        if provider.cipher_suites.is_empty() {
            return Err(Error::config(format!(
                "no supported cipher suite in {:?}",
                policy.cipher_suites
            )));
        }
    }

    if !policy.curves.is_empty() {
        let available = std::mem::take(&mut provider.kx_groups);
        provider.kx_groups = select(&policy.curves, &available, |g| format!("{:?}", g.name()));
        if provider.kx_groups.is_empty() {
            return Err(Error::config(format!(
                "no supported curve in {:?}",
                policy.curves
            )));
        }
    }

    Ok(Arc::new(provider))
}

fn select<T: Copy>(wanted: &[String], available: &[T], name: impl Fn(&T) -> String) -> Vec<T> {
    wanted
        .iter()
        .filter_map(|w| {
            available
                .iter()
                .find(|a| name(*a).eq_ignore_ascii_case(w))
                .copied()
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Public: PEM loading
// ─────────────────────────────────────────────────────────────────────────────

/// Load all certificates from a PEM file.
///
/// # Errors
///
/// Returns [`Error::Io`] if the file cannot be read and
/// [`Error::MalformedCertificate`] if it holds no certificate.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem_data = fs::read(path)?;
    crate::crypto::decode_certificates(&pem_data).map_err(|e| match e {
        Error::MalformedCertificate(msg) => {
            Error::MalformedCertificate(format!("{}: {msg}", path.display()))
        }
        other => other,
    })
}

/// Load the first private key from a PEM file.
///
/// Supports RSA (`RSA PRIVATE KEY`), PKCS#8 (`PRIVATE KEY`), and EC keys.
///
/// # Errors
///
/// Returns [`Error::Io`] if the file cannot be read and
/// [`Error::UnsupportedKeyType`] if it holds no private key.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem_data = fs::read(path)?;
    rustls_pemfile::private_key(&mut pem_data.as_slice())
        .map_err(|e| {
            Error::UnsupportedKeyType(format!("cannot parse '{}': {e}", path.display()))
        })?
        .ok_or_else(|| {
            Error::UnsupportedKeyType(format!("no private key found in '{}'", path.display()))
        })
}

/// Load a CA bundle into a root store.
///
/// # Errors
///
/// Returns [`Error::TrustStoreUnavailable`] if the file cannot be read or
/// holds no usable trust anchor.
pub fn load_root_store(path: &Path) -> Result<RootCertStore> {
    let pem_data = fs::read(path)
        .map_err(|e| Error::TrustStoreUnavailable(format!("cannot read '{}': {e}", path.display())))?;
    root_store_from_pem(&pem_data, &path.display().to_string())
}

fn root_store_from_pem(pem: &[u8], origin: &str) -> Result<RootCertStore> {
    let certs = crate::crypto::decode_certificates(pem)
        .map_err(|e| Error::TrustStoreUnavailable(format!("{origin}: {e}")))?;

    let mut store = RootCertStore::empty();
    let (added, ignored) = store.add_parsable_certificates(certs);
    if added == 0 {
        return Err(Error::TrustStoreUnavailable(format!(
            "{origin}: no usable CA certificate ({ignored} ignored)"
        )));
    }

    Ok(store)
}
