//! Throwaway PKI for unit tests.

use std::path::{Path, PathBuf};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, SanType, date_time_ymd,
};
use rcgen::string::Ia5String;
use tempfile::TempDir;

use crate::crypto::RsaKey;

/// A leaf certificate and its private key in PEM.
pub(crate) struct Leaf {
    pub cert_pem: String,
    pub key_pem: String,
}

impl Leaf {
    /// Write `<stem>.pem` and `<stem>.key` under `dir`.
    pub fn write(&self, dir: &Path, stem: &str) -> (PathBuf, PathBuf) {
        let cert = dir.join(format!("{stem}.pem"));
        let key = dir.join(format!("{stem}.key"));
        std::fs::write(&cert, &self.cert_pem).unwrap();
        std::fs::write(&key, &self.key_pem).unwrap();
        (cert, key)
    }
}

/// Knobs for leaf issuance.
#[derive(Default)]
pub(crate) struct LeafSpec<'a> {
    pub cn: &'a str,
    pub dns: Vec<&'a str>,
    pub emails: Vec<&'a str>,
    pub usages: Vec<ExtendedKeyUsagePurpose>,
    pub expired: bool,
    pub ecdsa: bool,
}

/// A root CA with its key, backed by a temporary directory.
pub(crate) struct TestPki {
    pub dir: TempDir,
    pub ca_pem: String,
    issuer: Issuer<'static, KeyPair>,
}

impl TestPki {
    pub fn new() -> Self {
        let (ca_pem, issuer) = self_signed_ca("Test Root CA");
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ca.pem"), &ca_pem).unwrap();
        Self { dir, ca_pem, issuer }
    }

    pub fn ca_path(&self) -> PathBuf {
        self.dir.path().join("ca.pem")
    }

    /// RSA leaf with the CN as its only SAN-free name plus `dns` SANs.
    pub fn issue(&self, cn: &str, dns: &[&str]) -> Leaf {
        self.issue_with(&LeafSpec {
            cn,
            dns: dns.to_vec(),
            ..LeafSpec::default()
        })
    }

    pub fn issue_with(&self, spec: &LeafSpec<'_>) -> Leaf {
        issue_from(&self.issuer, spec)
    }

    /// An intermediate CA signed by this root; returns its PEM and issuer.
    pub fn intermediate(&self, cn: &str) -> (String, Issuer<'static, KeyPair>) {
        let key = KeyPair::generate().unwrap();
        let params = ca_params(cn);
        let cert = params.signed_by(&key, &self.issuer).unwrap();
        (cert.pem(), Issuer::new(params, key))
    }
}

pub(crate) fn self_signed_ca(cn: &str) -> (String, Issuer<'static, KeyPair>) {
    let key = KeyPair::generate().unwrap();
    let params = ca_params(cn);
    let cert = params.self_signed(&key).unwrap();
    (cert.pem(), Issuer::new(params, key))
}

fn ca_params(cn: &str) -> CertificateParams {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, cn);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params
}

pub(crate) fn issue_from(issuer: &Issuer<'_, KeyPair>, spec: &LeafSpec<'_>) -> Leaf {
    let (key_pair, key_pem) = if spec.ecdsa {
        let kp = KeyPair::generate().unwrap();
        let pem = kp.serialize_pem();
        (kp, pem)
    } else {
        let rsa = RsaKey::generate().unwrap();
        (rsa.to_rcgen().unwrap(), rsa.to_pkcs8_pem().unwrap())
    };

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, spec.cn);
    params.distinguished_name = dn;

    let mut sans = Vec::new();
    for dns in &spec.dns {
        sans.push(SanType::DnsName(Ia5String::try_from(*dns).unwrap()));
    }
    for email in &spec.emails {
        sans.push(SanType::Rfc822Name(Ia5String::try_from(*email).unwrap()));
    }
    params.subject_alt_names = sans;
    params.extended_key_usages.clone_from(&spec.usages);

    if spec.expired {
        params.not_before = date_time_ymd(2000, 1, 1);
        params.not_after = date_time_ymd(2001, 1, 1);
    }

    let cert = params.signed_by(&key_pair, issuer).unwrap();
    Leaf {
        cert_pem: cert.pem(),
        key_pem,
    }
}
