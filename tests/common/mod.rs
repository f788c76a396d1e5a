//! Shared PKI and provider fixtures for integration tests.

#![allow(dead_code)]

use std::path::PathBuf;

use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, IsCa, Issuer, KeyPair, SanType,
};
use rcgen::string::Ia5String;
use tempfile::TempDir;

use trust_provider::config::{FileConfig, PolicyConfig, ProviderConfig, ProviderKind};
use trust_provider::crypto::RsaKey;

/// A leaf certificate and key in PEM.
pub struct Leaf {
    pub cert_pem: String,
    pub key_pem: String,
}

/// A root CA in a temporary directory.
pub struct Pki {
    pub dir: TempDir,
    pub ca_pem: String,
    issuer: Issuer<'static, KeyPair>,
}

impl Pki {
    pub fn new() -> Self {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "Integration Root CA");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);

        let ca_pem = params.self_signed(&key).unwrap().pem();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ca.pem"), &ca_pem).unwrap();

        Self {
            dir,
            ca_pem,
            issuer: Issuer::new(params, key),
        }
    }

    pub fn ca_path(&self) -> PathBuf {
        self.dir.path().join("ca.pem")
    }

    /// RSA leaf for `cn` with `dns` SANs.
    pub fn issue(&self, cn: &str, dns: &[&str]) -> Leaf {
        let rsa = RsaKey::generate().unwrap();
        let key = rsa.to_rcgen().unwrap();

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cn);
        params.distinguished_name = dn;
        params.subject_alt_names = dns
            .iter()
            .map(|d| SanType::DnsName(Ia5String::try_from(*d).unwrap()))
            .collect();

        Leaf {
            cert_pem: params.signed_by(&key, &self.issuer).unwrap().pem(),
            key_pem: rsa.to_pkcs8_pem().unwrap(),
        }
    }

    /// Sign a PEM CSR the way a CA would.
    pub fn sign_csr(&self, csr_pem: &str) -> String {
        CertificateSigningRequestParams::from_pem(csr_pem)
            .unwrap()
            .signed_by(&self.issuer)
            .unwrap()
            .pem()
    }

    /// File backend configuration for a freshly issued `cn` leaf.
    pub fn file_config(&self, cn: &str, policy: PolicyConfig) -> ProviderConfig {
        let leaf = self.issue(cn, &[]);
        let certificate = self.dir.path().join(format!("{cn}.pem"));
        let key = self.dir.path().join(format!("{cn}.key"));
        std::fs::write(&certificate, &leaf.cert_pem).unwrap();
        std::fs::write(&key, &leaf.key_pem).unwrap();

        ProviderConfig {
            provider: ProviderKind::File,
            policy,
            file: FileConfig {
                key: Some(key),
                certificate: Some(certificate),
                ca: Some(self.ca_path()),
                cache: Some(self.dir.path().join("cache")),
            },
            ..ProviderConfig::default()
        }
    }
}

pub fn policy(allow: &[&str], privileged: &[&str]) -> PolicyConfig {
    PolicyConfig {
        allow_list: allow.iter().map(ToString::to_string).collect(),
        privileged_users: privileged.iter().map(ToString::to_string).collect(),
    }
}
