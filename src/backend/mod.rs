//! Backend management
//!
//! [`from_config`] turns a [`ProviderConfig`] into the configured
//! [`SecurityProvider`]. Construction-time misconfiguration is fatal: no
//! partially working backend is ever returned.

pub mod cert_manager;
pub mod file;
pub mod pkcs11;
pub mod puppet;

use std::sync::Arc;

use tracing::info;

use crate::Result;
use crate::config::{Platform, ProviderConfig, ProviderKind};
use crate::provider::SecurityProvider;

pub use cert_manager::CertManagerSecurity;
pub use file::{FileSecurity, MaterialPaths};
pub use pkcs11::Pkcs11Security;
pub use puppet::PuppetSecurity;

/// Build the backend selected by `config.provider`.
///
/// # Errors
///
/// Returns [`crate::Error::ConfigurationInvalid`] (or [`crate::Error::Token`]
/// for PKCS#11) when the backend cannot be constructed.
pub fn from_config(
    config: &ProviderConfig,
    platform: &Platform,
) -> Result<Arc<dyn SecurityProvider>> {
    let provider: Arc<dyn SecurityProvider> = match config.provider {
        ProviderKind::File => Arc::new(FileSecurity::from_config(config)?),
        ProviderKind::Puppet => Arc::new(PuppetSecurity::new(config, platform)?),
        ProviderKind::CertManager => Arc::new(CertManagerSecurity::new(config, platform)?),
        ProviderKind::Pkcs11 => Arc::new(Pkcs11Security::new(config)?),
    };

    info!(
        provider = %provider.kind(),
        identity = %provider.identity(),
        remote_signing = provider.is_remote_signing(),
        "security provider ready"
    );

    Ok(provider)
}
