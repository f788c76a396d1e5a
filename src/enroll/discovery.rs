//! Puppet CA endpoint discovery.
//!
//! Resolution order:
//! 1. `puppet.ca_url`, verbatim
//! 2. `puppet.ca_host` / `puppet.ca_port`
//! 3. DNS SRV `_x-puppet-ca._tcp.<puppet.srv_domain>`
//! 4. `puppet:8140`

use hickory_resolver::TokioResolver;
use tracing::{debug, warn};
use url::Url;

use crate::config::PuppetConfig;
use crate::{Error, Result};

/// Default CA host when nothing else is configured.
pub const DEFAULT_CA_HOST: &str = "puppet";

/// Default Puppet CA port.
pub const DEFAULT_CA_PORT: u16 = 8140;

/// SRV service label for the Puppet CA.
pub const PUPPET_CA_SRV: &str = "_x-puppet-ca._tcp";

/// One SRV answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvTarget {
    /// Lower is preferred.
    pub priority: u16,
    /// Higher is preferred among equal priorities.
    pub weight: u16,
    /// Target host without the trailing dot.
    pub host: String,
    /// Target port.
    pub port: u16,
}

/// Base URL of the Puppet CA.
///
/// # Errors
///
/// Returns [`Error::ConfigurationInvalid`] if an explicit URL or host does
/// not form a valid URL. SRV failures fall through to the default.
pub async fn resolve_puppet_ca(config: &PuppetConfig) -> Result<Url> {
    if let Some(url) = &config.ca_url {
        return Url::parse(url)
            .map_err(|e| Error::config(format!("invalid puppet.ca_url '{url}': {e}")));
    }

    if let Some(host) = &config.ca_host {
        return endpoint_url(host, config.ca_port.unwrap_or(DEFAULT_CA_PORT));
    }

    if let Some(domain) = &config.srv_domain {
        match lookup_srv(domain).await {
            Ok(Some(target)) => {
                debug!(host = %target.host, port = target.port, "puppet CA found via SRV");
                return endpoint_url(&target.host, target.port);
            }
            Ok(None) => warn!(domain = %domain, "no puppet CA SRV records, using default"),
            Err(e) => warn!(domain = %domain, error = %e, "puppet CA SRV lookup failed, using default"),
        }
    }

    endpoint_url(DEFAULT_CA_HOST, config.ca_port.unwrap_or(DEFAULT_CA_PORT))
}

/// `https://<host>:<port>`.
pub fn endpoint_url(host: &str, port: u16) -> Result<Url> {
    Url::parse(&format!("https://{host}:{port}"))
        .map_err(|e| Error::config(format!("invalid CA endpoint {host}:{port}: {e}")))
}

/// Preferred target: lowest priority, then highest weight.
#[must_use]
pub fn pick_srv(mut targets: Vec<SrvTarget>) -> Option<SrvTarget> {
    targets.sort_by(|a, b| a.priority.cmp(&b.priority).then(b.weight.cmp(&a.weight)));
    targets.into_iter().next()
}

async fn lookup_srv(domain: &str) -> Result<Option<SrvTarget>> {
    let resolver = TokioResolver::builder_tokio()
        .map_err(|e| Error::Transport(format!("failed to create resolver: {e}")))?
        .build();

    let name = format!("{PUPPET_CA_SRV}.{}", domain.trim_end_matches('.'));
    debug!(name = %name, "querying puppet CA SRV records");

    let lookup = resolver
        .srv_lookup(name.as_str())
        .await
        .map_err(|e| Error::Transport(format!("SRV lookup of {name} failed: {e}")))?;

    let targets = lookup
        .iter()
        .map(|srv| SrvTarget {
            priority: srv.priority(),
            weight: srv.weight(),
            host: srv.target().to_utf8().trim_end_matches('.').to_string(),
            port: srv.port(),
        })
        .collect();

    Ok(pick_srv(targets))
}
