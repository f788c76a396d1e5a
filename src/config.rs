//! Configuration management
//!
//! A [`ProviderConfig`] is loaded once at startup from an optional YAML file
//! layered with `TRUST_PROVIDER_`-prefixed environment variables, e.g.
//!
//! ```yaml
//! provider: puppet
//! policy:
//!   allow_list: ['\.mcollective$']
//!   privileged_users: ['\.privileged\.mcollective$']
//! tls:
//!   backward_compat_verification: true
//! puppet:
//!   srv_domain: example.net
//! enrollment:
//!   max_wait: 5m
//! ```
//!
//! Facts about the running process that influence default paths and
//! identities are collected separately in [`Platform`] so they can be
//! injected instead of read from global state.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Environment variable that overrides any derived certificate name.
pub const CERTNAME_OVERRIDE_ENV: &str = "MCOLLECTIVE_CERTNAME";

/// Which backend implements the security provider contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Plain files supplied by the operator
    #[default]
    File,
    /// Puppet SSL directory plus Puppet CA enrollment
    Puppet,
    /// Kubernetes cert-manager `CertificateRequest` enrollment
    CertManager,
    /// Key and certificate held on a PKCS#11 token
    Pkcs11,
}

impl ProviderKind {
    /// Stable lowercase name used in logs and errors
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Puppet => "puppet",
            Self::CertManager => "cert_manager",
            Self::Pkcs11 => "pkcs11",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Backend selection
    pub provider: ProviderKind,
    /// Explicit identity; takes precedence over any derived identity
    pub identity: Option<String>,
    /// Scheme used when formatting caller tokens (`<scheme>=<identity>`)
    pub caller_scheme: String,
    /// Caller authorization policy
    pub policy: PolicyConfig,
    /// TLS policy
    pub tls: TlsPolicyConfig,
    /// File backend material
    pub file: FileConfig,
    /// Puppet backend settings
    pub puppet: PuppetConfig,
    /// cert-manager backend settings
    pub cert_manager: CertManagerConfig,
    /// PKCS#11 backend settings
    pub pkcs11: Pkcs11Config,
    /// Enrollment polling settings
    pub enrollment: EnrollmentConfig,
    /// Optional remote signing delegate
    pub remote_signer: Option<RemoteSignerConfig>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            identity: None,
            caller_scheme: "choria".to_string(),
            policy: PolicyConfig::default(),
            tls: TlsPolicyConfig::default(),
            file: FileConfig::default(),
            puppet: PuppetConfig::default(),
            cert_manager: CertManagerConfig::default(),
            pkcs11: Pkcs11Config::default(),
            enrollment: EnrollmentConfig::default(),
            remote_signer: None,
        }
    }
}

impl ProviderConfig {
    /// Load configuration from an optional YAML file and the environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationInvalid`] if the file does not exist or
    /// the merged configuration does not deserialize.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("TRUST_PROVIDER_").split("__"));

        figment
            .extract()
            .map_err(|e| Error::ConfigurationInvalid(e.to_string()))
    }
}

/// Regex policy applied to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Caller identities that may be accepted at all
    pub allow_list: Vec<String>,
    /// Certificate names that may act on behalf of any caller
    pub privileged_users: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            allow_list: vec![r"\.mcollective$".to_string(), r"\.choria$".to_string()],
            privileged_users: vec![
                r"\.privileged\.mcollective$".to_string(),
                r"\.privileged\.choria$".to_string(),
            ],
        }
    }
}

/// TLS policy shared by every backend.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TlsPolicyConfig {
    /// Skip peer verification entirely
    pub disable_verify: bool,
    /// Accept peers whose certificates carry no SAN extension by matching
    /// the server name against the Common Name
    pub backward_compat_verification: bool,
    /// Cipher suite names, e.g. `TLS13_AES_256_GCM_SHA384`; empty keeps the defaults
    pub cipher_suites: Vec<String>,
    /// Key exchange group names, e.g. `X25519`, `secp384r1`; empty keeps the defaults
    pub curves: Vec<String>,
}

/// Material locations for the file backend.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    /// PEM private key
    pub key: Option<PathBuf>,
    /// PEM public certificate, optionally followed by intermediates
    pub certificate: Option<PathBuf>,
    /// PEM CA bundle
    pub ca: Option<PathBuf>,
    /// Directory holding cached peer certificates
    pub cache: Option<PathBuf>,
}

/// Puppet backend settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PuppetConfig {
    /// SSL directory; derived from the platform when unset
    pub ssl_dir: Option<PathBuf>,
    /// Explicit CA host; disables SRV discovery
    pub ca_host: Option<String>,
    /// Explicit CA port
    pub ca_port: Option<u16>,
    /// Domain used for `_x-puppet-ca._tcp` SRV discovery
    pub srv_domain: Option<String>,
    /// Full CA base URL, overriding host discovery
    pub ca_url: Option<String>,
    /// Additional DNS names requested in the CSR
    pub alt_names: Vec<String>,
}

/// cert-manager backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CertManagerConfig {
    /// Directory holding key, CSR, certificate, CA and cache
    pub ssl_dir: Option<PathBuf>,
    /// Namespace; read from the service account when unset
    pub namespace: Option<String>,
    /// Issuer name referenced by the `CertificateRequest`
    pub issuer: String,
    /// `Issuer` or `ClusterIssuer`
    pub issuer_kind: String,
    /// Delete and recreate a conflicting `CertificateRequest`
    pub replace: bool,
    /// Kubernetes API base URL
    pub api_url: String,
    /// Service account directory (token, ca.crt, namespace)
    pub service_account_dir: PathBuf,
    /// Additional DNS names requested in the CSR
    pub alt_names: Vec<String>,
}

impl Default for CertManagerConfig {
    fn default() -> Self {
        Self {
            ssl_dir: None,
            namespace: None,
            issuer: String::new(),
            issuer_kind: "Issuer".to_string(),
            replace: false,
            api_url: "https://kubernetes.default.svc".to_string(),
            service_account_dir: PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount"),
            alt_names: Vec::new(),
        }
    }
}

/// PKCS#11 backend settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Pkcs11Config {
    /// Path to the PKCS#11 driver module
    pub driver: Option<PathBuf>,
    /// Slot id; the sole slot with a token is used when unset
    pub slot: Option<u64>,
    /// User PIN; prompted for interactively when unset
    pub pin: Option<String>,
    /// PEM CA bundle
    pub ca: Option<PathBuf>,
    /// Directory holding cached peer certificates
    pub cache: Option<PathBuf>,
}

/// Enrollment polling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrollmentConfig {
    /// Default overall deadline for the certificate poll loop
    #[serde(with = "humantime_serde")]
    pub max_wait: Duration,
    /// Override the backend's fixed poll interval
    #[serde(with = "humantime_serde::option")]
    pub poll_interval: Option<Duration>,
}

impl Default for EnrollmentConfig {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(240),
            poll_interval: None,
        }
    }
}

/// Remote signing delegate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSignerConfig {
    /// Endpoint that accepts signing requests
    pub url: String,
    /// File holding the bearer token presented to the signer
    pub token_file: Option<PathBuf>,
    /// Request timeout
    #[serde(with = "humantime_serde", default = "default_remote_timeout")]
    pub timeout: Duration,
}

fn default_remote_timeout() -> Duration {
    Duration::from_secs(10)
}

// ─────────────────────────────────────────────────────────────────────────────
// Platform facts
// ─────────────────────────────────────────────────────────────────────────────

/// Operating system family, for default path selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    /// Linux, BSD, macOS
    Unix,
    /// Windows
    Windows,
}

/// Facts about the running process used to derive default paths and
/// identities.
#[derive(Debug, Clone)]
pub struct Platform {
    /// Running as the superuser
    pub privileged: bool,
    /// OS family
    pub os: OsFamily,
    /// Home directory of the running user
    pub home: Option<PathBuf>,
    /// Login name of the running user
    pub user: Option<String>,
    /// Host name of the machine
    pub hostname: Option<String>,
    /// Value of [`CERTNAME_OVERRIDE_ENV`], if set
    pub certname_override: Option<String>,
}

impl Platform {
    /// Collect platform facts from the running process.
    #[must_use]
    pub fn detect() -> Self {
        let os = if cfg!(windows) {
            OsFamily::Windows
        } else {
            OsFamily::Unix
        };

        Self {
            privileged: detect_privileged(),
            os,
            home: dirs::home_dir(),
            user: std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .ok()
                .filter(|u| !u.is_empty()),
            hostname: detect_hostname(),
            certname_override: std::env::var(CERTNAME_OVERRIDE_ENV)
                .ok()
                .filter(|v| !v.is_empty()),
        }
    }
}

#[cfg(unix)]
fn detect_privileged() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(unix))]
fn detect_privileged() -> bool {
    false
}

fn detect_hostname() -> Option<String> {
    hostname::get()
        .ok()
        .map(|h| h.to_string_lossy().trim().to_string())
        .filter(|h| !h.is_empty())
}

/// Human readable duration (de)serialization, e.g. `"30s"`, `"5m"`, `"250ms"`
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize a Duration as milliseconds when sub-second, seconds otherwise
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(*duration))
    }

    /// Deserialize a human readable duration string
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn format_duration(duration: Duration) -> String {
        if duration.subsec_millis() == 0 {
            format!("{}s", duration.as_secs())
        } else {
            format!("{}ms", duration.as_millis())
        }
    }

    /// Parse `"250ms"`, `"30s"`, `"5m"`, `"1h"` or a bare number of seconds.
    ///
    /// # Errors
    ///
    /// Returns a message when the number is malformed or the duration
    /// overflows.
    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        // "ms" must be checked before "s"
        let (digits, scale, millis) = if let Some(ms) = s.strip_suffix("ms") {
            (ms, 1, true)
        } else if let Some(secs) = s.strip_suffix('s') {
            (secs, 1, false)
        } else if let Some(mins) = s.strip_suffix('m') {
            (mins, 60, false)
        } else if let Some(hours) = s.strip_suffix('h') {
            (hours, 3600, false)
        } else {
            (s, 1, false)
        };

        let n = digits.trim().parse::<u64>().map_err(|e| e.to_string())?;
        let n = n
            .checked_mul(scale)
            .ok_or_else(|| format!("duration '{s}' is too large"))?;

        Ok(if millis {
            Duration::from_millis(n)
        } else {
            Duration::from_secs(n)
        })
    }

    /// Same as the parent module for `Option<Duration>`
    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        /// Serialize an optional duration
        ///
        /// # Errors
        ///
        /// Returns a serialization error if the serializer fails.
        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => serializer.serialize_some(&super::format_duration(*d)),
                None => serializer.serialize_none(),
            }
        }

        /// Deserialize an optional duration
        ///
        /// # Errors
        ///
        /// Returns a deserialization error if the string cannot be parsed as a duration.
        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<String>::deserialize(deserializer)?
                .map(|s| super::parse_duration(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_policy_carries_mcollective_patterns() {
        let cfg = ProviderConfig::default();
        assert_eq!(cfg.provider, ProviderKind::File);
        assert_eq!(cfg.caller_scheme, "choria");
        assert!(cfg.policy.allow_list.iter().any(|p| p == r"\.mcollective$"));
        assert!(
            cfg.policy
                .privileged_users
                .iter()
                .any(|p| p == r"\.privileged\.mcollective$")
        );
    }

    #[test]
    fn load_reads_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("provider.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            "provider: cert_manager\nidentity: rip.mcollective\ncert_manager:\n  issuer: choria-ca\n  replace: true\nenrollment:\n  max_wait: 2m\n  poll_interval: 500ms"
        )
        .unwrap();
        drop(f);

        let cfg = ProviderConfig::load(Some(&path)).unwrap();

        assert_eq!(cfg.provider, ProviderKind::CertManager);
        assert_eq!(cfg.identity.as_deref(), Some("rip.mcollective"));
        assert_eq!(cfg.cert_manager.issuer, "choria-ca");
        assert!(cfg.cert_manager.replace);
        assert_eq!(cfg.cert_manager.issuer_kind, "Issuer");
        assert_eq!(cfg.enrollment.max_wait, Duration::from_secs(120));
        assert_eq!(
            cfg.enrollment.poll_interval,
            Some(Duration::from_millis(500))
        );
    }

    #[test]
    fn load_fails_for_missing_file() {
        let err = ProviderConfig::load(Some(Path::new("/nonexistent/provider.yaml"))).unwrap_err();
        assert!(matches!(err, Error::ConfigurationInvalid(_)));
        assert!(err.to_string().contains("Config file not found"));
    }

    #[test]
    fn tls_policy_deserialises_from_yaml() {
        let yaml = "disable_verify: false\nbackward_compat_verification: true\ncipher_suites: [TLS13_AES_256_GCM_SHA384]\ncurves: [X25519]";
        let tls: TlsPolicyConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(tls.backward_compat_verification);
        assert_eq!(tls.cipher_suites, vec!["TLS13_AES_256_GCM_SHA384"]);
        assert_eq!(tls.curves, vec!["X25519"]);
    }

    #[test]
    fn parse_duration_handles_all_suffixes() {
        use humantime_serde::parse_duration;
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("42").unwrap(), Duration::from_secs(42));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn oversized_durations_are_rejected() {
        use humantime_serde::parse_duration;
        let err = parse_duration("999999999999999999m").unwrap_err();
        assert!(err.contains("too large"), "{err}");
        assert!(parse_duration("999999999999999999h").is_err());
        assert_eq!(
            parse_duration("18446744073709551615s").unwrap(),
            Duration::from_secs(u64::MAX)
        );
    }

    #[test]
    fn platform_detection_finds_a_hostname() {
        let platform = Platform::detect();
        let hostname = platform.hostname.expect("hostname");
        assert!(!hostname.is_empty());
        assert_eq!(hostname, hostname.trim());
    }

    #[cfg(unix)]
    #[test]
    fn privilege_follows_the_effective_uid() {
        assert_eq!(Platform::detect().privileged, nix::unistd::geteuid().is_root());
    }

    #[test]
    fn remote_signer_timeout_defaults_to_ten_seconds() {
        let rs: RemoteSignerConfig = serde_yaml::from_str("url: https://signer.example.net/sign").unwrap();
        assert_eq!(rs.timeout, Duration::from_secs(10));
        assert!(rs.token_file.is_none());
    }
}
