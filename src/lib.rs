//! Trust Provider Library
//!
//! Pluggable identity and trust for a fleet of agents and clients that talk
//! over a message bus and authenticate each other with X.509 certificates.
//!
//! # Features
//!
//! - **Four backends**: plain files, Puppet CA, Kubernetes cert-manager and
//!   PKCS#11 tokens behind one [`SecurityProvider`] contract
//! - **Trust engine**: chain verification, CN/SAN/email name matching and
//!   regex caller policy with privileged callers
//! - **Message signing**: RSA PKCS#1 v1.5 SHA-256 signatures and verification
//! - **TLS material**: TLS 1.3 mutual-TLS configs with cipher/curve policy
//!   and legacy Common Name verification
//! - **Enrollment**: cancellable, deadline-bound CSR submission and
//!   certificate polling against Puppet or cert-manager
//!
//! # Example
//!
//! ```no_run
//! use trust_provider::{backend, config::{Platform, ProviderConfig}};
//!
//! # fn main() -> trust_provider::Result<()> {
//! let config = ProviderConfig::load(None)?;
//! let provider = backend::from_config(&config, &Platform::detect())?;
//!
//! let signature = provider.sign_bytes(b"hello")?;
//! assert!(provider.verify_signature_bytes(b"hello", &signature, None).0);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod cache;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod enroll;
pub mod error;
pub mod provider;
pub mod remote;
pub mod tls;
pub mod trust;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
pub use provider::{EnrollOutcome, SecurityProvider};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` overrides `level`. `format` selects `json` output; anything
/// else logs plain text.
///
/// # Errors
///
/// Returns [`Error::ConfigurationInvalid`] if a global subscriber is already
/// installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };

    installed.map_err(|e| Error::config(format!("failed to install tracing subscriber: {e}")))
}
