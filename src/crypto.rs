//! Signing and verification primitives.
//!
//! Every backend signs with RSA PKCS#1 v1.5 over SHA-256. Keys held on disk
//! are parsed per call; either PKCS#1 (`RSA PRIVATE KEY`) or PKCS#8
//! (`PRIVATE KEY`) encodings are accepted.

use std::fmt;

use aws_lc_rs::encoding::{AsDer, Pkcs8V1Der};
use aws_lc_rs::rand::SystemRandom;
use aws_lc_rs::rsa::KeySize;
use aws_lc_rs::signature::{self, RsaKeyPair, UnparsedPublicKey};
use rustls::pki_types::CertificateDer;
use rustls_pemfile::Item;
use sha2::{Digest, Sha256};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;
use x509_parser::public_key::PublicKey;

use crate::{Error, Result};

/// DER `DigestInfo` header for SHA-256 (RFC 8017 §9.2, note 1).
///
/// Tokens exposing only the raw `CKM_RSA_PKCS` mechanism need this prefix in
/// front of the digest to produce a standard PKCS#1 v1.5 signature.
pub const SHA256_DIGEST_INFO_PREFIX: [u8; 19] = [
    0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01,
    0x05, 0x00, 0x04, 0x20,
];

/// Anything able to produce an RSA PKCS#1 v1.5 SHA-256 signature.
pub trait MessageSigner: Send + Sync {
    /// Sign `data`, hashing it with SHA-256 first.
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// SHA-256 digest of `data`.
#[must_use]
pub fn checksum(data: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Lowercase hex SHA-256 digest of `data`.
#[must_use]
pub fn checksum_hex(data: &[u8]) -> String {
    hex::encode(checksum(data))
}

/// `DigestInfo || SHA-256(data)`, the input a raw RSA PKCS#1 mechanism signs.
#[must_use]
pub fn sha256_digest_info(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(SHA256_DIGEST_INFO_PREFIX.len() + 32);
    out.extend_from_slice(&SHA256_DIGEST_INFO_PREFIX);
    out.extend_from_slice(&checksum(data));
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// RSA private keys
// ─────────────────────────────────────────────────────────────────────────────

/// An RSA private key held in memory.
pub struct RsaKey {
    inner: RsaKeyPair,
}

impl fmt::Debug for RsaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RsaKey")
            .field("bits", &(self.inner.public_modulus_len() * 8))
            .finish_non_exhaustive()
    }
}

impl RsaKey {
    /// Generate a fresh 2048 bit key.
    pub fn generate() -> Result<Self> {
        let inner = RsaKeyPair::generate(KeySize::Rsa2048)
            .map_err(|_| Error::Signing("RSA key generation failed".to_string()))?;
        Ok(Self { inner })
    }

    /// Parse the first private key found in PEM data.
    ///
    /// The DER body is tried as PKCS#1 first and PKCS#8 second, regardless
    /// of the PEM label.
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let der = first_private_key_der(pem)?;

        if let Ok(inner) = RsaKeyPair::from_der(&der) {
            return Ok(Self { inner });
        }

        RsaKeyPair::from_pkcs8(&der)
            .map(|inner| Self { inner })
            .map_err(|e| Error::UnsupportedKeyType(format!("not an RSA PKCS#1 or PKCS#8 key: {e}")))
    }

    /// PKCS#8 DER encoding of the key.
    pub fn to_pkcs8_der(&self) -> Result<Vec<u8>> {
        let der: Pkcs8V1Der<'static> = AsDer::<Pkcs8V1Der<'static>>::as_der(&self.inner)
            .map_err(|_| Error::Signing("cannot encode RSA key as PKCS#8".to_string()))?;
        Ok(der.as_ref().to_vec())
    }

    /// Convert into an `rcgen` key pair for CSR construction.
    pub fn to_rcgen(&self) -> Result<rcgen::KeyPair> {
        let der = self.to_pkcs8_der()?;
        rcgen::KeyPair::from_pkcs8_der_and_sign_algo(
            &rustls::pki_types::PrivatePkcs8KeyDer::from(der),
            &rcgen::PKCS_RSA_SHA256,
        )
        .map_err(|e| Error::UnsupportedKeyType(format!("rcgen rejected key: {e}")))
    }

    /// PKCS#8 PEM encoding of the key.
    pub fn to_pkcs8_pem(&self) -> Result<String> {
        Ok(self.to_rcgen()?.serialize_pem())
    }

    /// Modulus length in bits.
    #[must_use]
    pub fn bits(&self) -> usize {
        self.inner.public_modulus_len() * 8
    }
}

impl MessageSigner for RsaKey {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut sig = vec![0u8; self.inner.public_modulus_len()];
        self.inner
            .sign(&signature::RSA_PKCS1_SHA256, &SystemRandom::new(), data, &mut sig)
            .map_err(|_| Error::Signing("RSA PKCS#1 v1.5 signing failed".to_string()))?;
        Ok(sig)
    }
}

fn first_private_key_der(pem: &[u8]) -> Result<Vec<u8>> {
    for item in rustls_pemfile::read_all(&mut &pem[..]) {
        match item {
            Ok(Item::Pkcs1Key(k)) => return Ok(k.secret_pkcs1_der().to_vec()),
            Ok(Item::Pkcs8Key(k)) => return Ok(k.secret_pkcs8_der().to_vec()),
            Ok(Item::Sec1Key(_)) => {
                return Err(Error::UnsupportedKeyType(
                    "EC keys are not supported for signing".to_string(),
                ));
            }
            Ok(_) => {}
            Err(e) => return Err(Error::UnsupportedKeyType(format!("invalid PEM: {e:?}"))),
        }
    }

    Err(Error::UnsupportedKeyType("no private key found in PEM data".to_string()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Certificates
// ─────────────────────────────────────────────────────────────────────────────

/// Decode every `CERTIFICATE` block in PEM data.
///
/// # Errors
///
/// Returns [`Error::MalformedCertificate`] if the data is not PEM or holds
/// no certificate.
pub fn decode_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::MalformedCertificate(format!("invalid PEM: {e}")))?;

    if certs.is_empty() {
        return Err(Error::MalformedCertificate(
            "no PEM certificate found".to_string(),
        ));
    }

    Ok(certs)
}

/// PEM `CERTIFICATE` block for DER bytes.
#[must_use]
pub fn certificate_pem(der: &[u8]) -> String {
    pem::encode_config(&pem::Pem::new("CERTIFICATE", der.to_vec()), lf())
}

/// Last certificate of a PEM chain holding at least two, re-encoded.
///
/// CAs that return the issued leaf followed by its issuers put the root
/// last.
#[must_use]
pub fn chain_root(chain_pem: &str) -> Option<String> {
    let blocks = pem::parse_many(chain_pem).ok()?;
    let certs: Vec<&pem::Pem> = blocks.iter().filter(|b| b.tag() == "CERTIFICATE").collect();
    match certs.as_slice() {
        [_, .., root] => Some(pem::encode_config(root, lf())),
        _ => None,
    }
}

fn lf() -> pem::EncodeConfig {
    pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF)
}

/// Verify an RSA PKCS#1 v1.5 SHA-256 signature against the leaf of
/// `cert_pem`.
///
/// Returns the signer's Common Name on success and `None` on any decode,
/// parse or verification failure.
#[must_use]
pub fn verify_signature(data: &[u8], sig: &[u8], cert_pem: &[u8]) -> Option<String> {
    let certs = decode_certificates(cert_pem).ok()?;
    let leaf = certs.first()?;
    let (_, cert) = X509Certificate::from_der(leaf.as_ref()).ok()?;

    if !matches!(cert.public_key().parsed(), Ok(PublicKey::RSA(_))) {
        return None;
    }

    let key = UnparsedPublicKey::new(
        &signature::RSA_PKCS1_2048_8192_SHA256,
        cert.public_key().subject_public_key.data.as_ref(),
    );
    key.verify(data, sig).ok()?;

    Some(
        cert.subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or_default()
            .to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestPki;

    #[test]
    fn der_converts_to_parseable_pem() {
        let pki = TestPki::new();
        let leaf = pki.issue("token.mcollective", &[]);
        let der = decode_certificates(leaf.cert_pem.as_bytes()).unwrap();

        let pem = certificate_pem(der[0].as_ref());

        assert_eq!(decode_certificates(pem.as_bytes()).unwrap(), der);
        assert!(!pem.contains('\r'));
        assert!(pem.lines().all(|l| l.len() <= 64 || l.starts_with("-----")));
    }

    #[test]
    fn chain_root_is_the_last_of_several() {
        let pki = TestPki::new();
        let leaf = pki.issue("rip.mcollective", &[]);
        let chain = format!("{}{}", leaf.cert_pem, pki.ca_pem);

        let root = chain_root(&chain).unwrap();

        assert_eq!(
            decode_certificates(root.as_bytes()).unwrap(),
            decode_certificates(pki.ca_pem.as_bytes()).unwrap()
        );
        assert_eq!(chain_root(&leaf.cert_pem), None);
        assert_eq!(chain_root("not pem"), None);
    }

    #[test]
    fn checksum_is_sha256() {
        assert_eq!(
            checksum_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn digest_info_prefixes_the_digest() {
        let di = sha256_digest_info(b"abc");
        assert_eq!(di.len(), 51);
        assert_eq!(&di[..19], &SHA256_DIGEST_INFO_PREFIX);
        assert_eq!(&di[19..], &checksum(b"abc"));
    }

    #[test]
    fn generated_key_round_trips_through_pkcs8_pem() {
        let key = RsaKey::generate().unwrap();
        assert_eq!(key.bits(), 2048);

        let pem = key.to_pkcs8_pem().unwrap();
        assert!(pem.contains("BEGIN PRIVATE KEY"));

        let parsed = RsaKey::from_pem(pem.as_bytes()).unwrap();
        assert_eq!(parsed.to_pkcs8_der().unwrap(), key.to_pkcs8_der().unwrap());
    }

    #[test]
    fn ec_keys_are_rejected() {
        let ec = rcgen::KeyPair::generate().unwrap();
        let err = RsaKey::from_pem(ec.serialize_pem().as_bytes()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedKeyType(_)));
    }

    #[test]
    fn garbage_is_not_a_key() {
        let err = RsaKey::from_pem(b"hello world").unwrap_err();
        assert!(matches!(err, Error::UnsupportedKeyType(_)));
    }

    #[test]
    fn decode_certificates_rejects_empty_input() {
        assert!(matches!(
            decode_certificates(b""),
            Err(Error::MalformedCertificate(_))
        ));
    }

    #[test]
    fn verify_signature_fails_closed_on_garbage() {
        assert_eq!(verify_signature(b"data", b"sig", b"not a cert"), None);
    }
}
