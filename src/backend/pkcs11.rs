//! PKCS#11 backend.
//!
//! The private key never leaves the token. Message signatures use the raw
//! `CKM_RSA_PKCS` mechanism over a SHA-256 `DigestInfo`; TLS handshakes use
//! `CKM_SHA256_RSA_PKCS_PSS` through a [`rustls::sign::SigningKey`] adapter.
//! Trust decisions, caching and caller policy are delegated to an embedded
//! [`FileSecurity`] over the configured CA bundle.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::mechanism::rsa::{PkcsMgfType, PkcsPssParams};
use cryptoki::mechanism::{Mechanism, MechanismType};
use cryptoki::object::{Attribute, AttributeType, ObjectClass, ObjectHandle};
use cryptoki::session::{Session, UserType};
use cryptoki::types::AuthPin;
use parking_lot::Mutex;
use rustls::client::ResolvesClientCert;
use rustls::pki_types::CertificateDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::{CertifiedKey, Signer, SigningKey};
use rustls::{SignatureAlgorithm, SignatureScheme};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use x509_parser::pem::Pem;

use crate::backend::file::{self, FileSecurity, MaterialPaths};
use crate::config::{Pkcs11Config, ProviderConfig, ProviderKind};
use crate::crypto::{self, MessageSigner};
use crate::provider::{EnrollOutcome, ProgressFn, SecurityProvider};
use crate::tls::{self, ClientIdentity, ServerIdentity};
use crate::trust::CertIdentity;
use crate::{Error, Result};

fn token_error(context: &str) -> impl FnOnce(cryptoki::error::Error) -> Error + '_ {
    move |e| Error::Token(format!("{context}: {e}"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Token session
// ─────────────────────────────────────────────────────────────────────────────

/// A logged-in session holding one private key and one certificate.
pub struct Token {
    // keeps the module loaded for the session's lifetime
    _context: Pkcs11,
    session: Mutex<Session>,
    key: ObjectHandle,
    certificate: CertificateDer<'static>,
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl Token {
    /// Load `driver`, open a read-only session on the chosen slot and log in.
    ///
    /// # Errors
    ///
    /// [`Error::Token`] for any driver failure or when the token does not
    /// hold exactly one private key and one certificate.
    pub fn open(driver: &Path, slot: Option<u64>, pin: &str) -> Result<Self> {
        let context = Pkcs11::new(driver).map_err(token_error("loading driver"))?;
        context
            .initialize(CInitializeArgs::OsThreads)
            .map_err(token_error("initializing driver"))?;

        let slots = context
            .get_slots_with_token()
            .map_err(token_error("listing slots"))?;
        let ids: Vec<u64> = slots.iter().map(cryptoki::slot::Slot::id).collect();
        let index = choose_slot(&ids, slot)?;
        debug!(slot = ids[index], "opening PKCS#11 session");

        let session = context
            .open_ro_session(slots[index])
            .map_err(token_error("opening session"))?;
        session
            .login(UserType::User, Some(&AuthPin::new(pin.into())))
            .map_err(token_error("logging in"))?;

        let key = sole_object(&session, ObjectClass::PRIVATE_KEY, "private key")?;
        let cert_handle = sole_object(&session, ObjectClass::CERTIFICATE, "certificate")?;
        let der = session
            .get_attributes(cert_handle, &[AttributeType::Value])
            .map_err(token_error("reading certificate"))?
            .into_iter()
            .find_map(|attr| match attr {
                Attribute::Value(v) => Some(v),
                _ => None,
            })
            .ok_or_else(|| Error::Token("certificate object has no value".to_string()))?;

        Ok(Self {
            _context: context,
            session: Mutex::new(session),
            key,
            certificate: CertificateDer::from(der),
        })
    }

    /// The token's certificate.
    #[must_use]
    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.certificate
    }

    /// Whether the session still answers.
    pub fn probe(&self) -> Result<()> {
        self.session
            .lock()
            .get_session_info()
            .map(|_| ())
            .map_err(token_error("querying session"))
    }

    fn sign_with(&self, mechanism: &Mechanism<'_>, data: &[u8]) -> Result<Vec<u8>> {
        self.session
            .lock()
            .sign(mechanism, self.key, data)
            .map_err(token_error("signing"))
    }

    /// RSA-PSS-SHA256 signature over `message`, hashed on the token.
    pub fn sign_pss_sha256(&self, message: &[u8]) -> Result<Vec<u8>> {
        let params = PkcsPssParams {
            hash_alg: MechanismType::SHA256,
            mgf: PkcsMgfType::MGF1_SHA256,
            s_len: 32.into(),
        };
        self.sign_with(&Mechanism::Sha256RsaPkcsPss(params), message)
    }
}

impl MessageSigner for Token {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        // the token only performs the raw RSA primitive
        self.sign_with(&Mechanism::RsaPkcs, &crypto::sha256_digest_info(data))
    }
}

fn sole_object(session: &Session, class: ObjectClass, what: &str) -> Result<ObjectHandle> {
    let found = session
        .find_objects(&[Attribute::Class(class)])
        .map_err(token_error("searching objects"))?;

    match found.as_slice() {
        [handle] => Ok(*handle),
        other => Err(Error::Token(format!(
            "expected exactly one {what} on the token, found {}",
            other.len()
        ))),
    }
}

/// Index into `available` of the slot to use: the configured id, or the
/// sole slot holding a token.
fn choose_slot(available: &[u64], configured: Option<u64>) -> Result<usize> {
    match configured {
        Some(id) => available
            .iter()
            .position(|s| *s == id)
            .ok_or_else(|| Error::Token(format!("slot {id} has no token"))),
        None => match available {
            [_] => Ok(0),
            [] => Err(Error::Token("no slot holds a token".to_string())),
            _ => Err(Error::Token(format!(
                "{} slots hold tokens, set pkcs11.slot",
                available.len()
            ))),
        },
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// rustls adapters
// ─────────────────────────────────────────────────────────────────────────────

fn offers_pss(offered: &[SignatureScheme]) -> bool {
    offered.contains(&SignatureScheme::RSA_PSS_SHA256)
}

#[derive(Debug)]
struct TokenSigningKey {
    token: Arc<Token>,
}

impl SigningKey for TokenSigningKey {
    fn choose_scheme(&self, offered: &[SignatureScheme]) -> Option<Box<dyn Signer>> {
        offers_pss(offered).then(|| {
            Box::new(TokenSigner {
                token: Arc::clone(&self.token),
            }) as Box<dyn Signer>
        })
    }

    fn algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::RSA
    }
}

#[derive(Debug)]
struct TokenSigner {
    token: Arc<Token>,
}

impl Signer for TokenSigner {
    fn sign(&self, message: &[u8]) -> std::result::Result<Vec<u8>, rustls::Error> {
        self.token
            .sign_pss_sha256(message)
            .map_err(|e| rustls::Error::General(e.to_string()))
    }

    fn scheme(&self) -> SignatureScheme {
        SignatureScheme::RSA_PSS_SHA256
    }
}

/// Hands out the token-backed certificate on both sides of a handshake.
#[derive(Debug)]
struct TokenCertResolver {
    certified: Arc<CertifiedKey>,
}

impl ResolvesClientCert for TokenCertResolver {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        offers_pss(sigschemes).then(|| Arc::clone(&self.certified))
    }

    fn has_certs(&self) -> bool {
        true
    }
}

impl ResolvesServerCert for TokenCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        offers_pss(client_hello.signature_schemes()).then(|| Arc::clone(&self.certified))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Provider
// ─────────────────────────────────────────────────────────────────────────────

/// Trust provider backed by a PKCS#11 token.
#[derive(Debug)]
pub struct Pkcs11Security {
    inner: FileSecurity,
    token: Arc<Token>,
    certificate_pem: String,
    resolver: Arc<TokenCertResolver>,
}

impl Pkcs11Security {
    /// Open the configured token and take the identity from its certificate.
    ///
    /// The PIN is prompted for on the terminal when not configured.
    ///
    /// # Errors
    ///
    /// [`Error::ConfigurationInvalid`] for missing driver or CA paths,
    /// [`Error::Token`] when the token cannot be used.
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let p11 = &config.pkcs11;
        let driver = p11
            .driver
            .as_ref()
            .ok_or_else(|| Error::config("pkcs11.driver is not set"))?;
        let paths = material_paths(p11)?;

        let pin = match &p11.pin {
            Some(pin) => pin.clone(),
            None => rpassword::prompt_password("PKCS#11 PIN: ")?,
        };

        let token = Arc::new(Token::open(driver, p11.slot, &pin)?);
        Self::with_token(token, paths, config)
    }

    /// Provider over an already opened token.
    ///
    /// # Errors
    ///
    /// [`Error::MalformedCertificate`] when the token certificate has no
    /// Common Name.
    pub fn with_token(
        token: Arc<Token>,
        paths: MaterialPaths,
        config: &ProviderConfig,
    ) -> Result<Self> {
        let identity = CertIdentity::from_der(token.certificate().as_ref())?
            .common_name
            .ok_or_else(|| {
                Error::MalformedCertificate("token certificate has no common name".to_string())
            })?;
        info!(identity = %identity, "using PKCS#11 token identity");

        let key: Arc<dyn SigningKey> = Arc::new(TokenSigningKey {
            token: Arc::clone(&token),
        });
        let certified = Arc::new(CertifiedKey::new(vec![token.certificate().clone()], key));

        Ok(Self {
            inner: FileSecurity::new(identity, paths, config)?,
            certificate_pem: crypto::certificate_pem(token.certificate().as_ref()),
            resolver: Arc::new(TokenCertResolver { certified }),
            token,
        })
    }
}

fn material_paths(config: &Pkcs11Config) -> Result<MaterialPaths> {
    let ca = config
        .ca
        .clone()
        .ok_or_else(|| Error::config("pkcs11.ca is not set"))?;
    let cache = config.cache.clone().unwrap_or_else(|| {
        ca.parent()
            .unwrap_or_else(|| Path::new("."))
            .join("cache")
    });

    // key and certificate live on the token
    Ok(MaterialPaths {
        key: PathBuf::new(),
        certificate: PathBuf::new(),
        ca,
        cache,
    })
}

#[async_trait]
impl SecurityProvider for Pkcs11Security {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Pkcs11
    }

    fn identity(&self) -> &str {
        self.inner.identity()
    }

    fn caller_name(&self) -> String {
        self.inner.caller_name()
    }

    fn caller_identity(&self, caller: &str) -> Result<String> {
        self.inner.caller_identity(caller)
    }

    fn validate(&self) -> (Vec<String>, bool) {
        let mut errors = Vec::new();
        if let Err(e) = self.token.probe() {
            errors.push(e.to_string());
        }
        self.inner.validate_trust(&mut errors);

        let ok = errors.is_empty();
        (errors, ok)
    }

    fn sign_bytes(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.token.sign(data)
    }

    fn verify_signature_bytes(
        &self,
        data: &[u8],
        signature: &[u8],
        cert_pem: Option<&[u8]>,
    ) -> (bool, String) {
        let cert = cert_pem.unwrap_or(self.certificate_pem.as_bytes());
        self.inner
            .verify_with_certificate_file(data, signature, Some(cert))
    }

    fn tls_config(&self) -> Result<rustls::ServerConfig> {
        tls::server_config(
            &self.inner.paths().ca,
            self.inner.tls_policy(),
            ServerIdentity::Resolver(self.resolver.clone()),
        )
    }

    fn client_tls_config(&self) -> Result<rustls::ClientConfig> {
        tls::client_config(
            &self.inner.paths().ca,
            self.inner.tls_policy(),
            ClientIdentity::Resolver(self.resolver.clone()),
        )
    }

    fn verify_certificate(&self, cert_pem: &[u8], name: &str) -> Result<()> {
        self.inner.verify_certificate(cert_pem, name)
    }

    fn public_cert(&self) -> Result<CertificateDer<'static>> {
        Ok(self.token.certificate().clone())
    }

    fn public_cert_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.certificate_pem.clone().into_bytes())
    }

    fn public_cert_pem(&self) -> Result<Pem> {
        file::decode_pem(self.certificate_pem.as_bytes())
    }

    fn cache_public_data(&self, cert_pem: &[u8], identity: &str) -> Result<()> {
        self.inner.cache_public_data(cert_pem, identity)
    }

    fn cached_public_data(&self, identity: &str) -> Result<Vec<u8>> {
        self.inner.cached_public_data(identity)
    }

    fn should_allow_caller(&self, name: &str, cert_pem: &[u8]) -> Result<bool> {
        self.inner.should_allow_caller(name, cert_pem)
    }

    async fn enroll(
        &self,
        _cancel: &CancellationToken,
        _max_wait: Duration,
        _progress: &ProgressFn<'_>,
    ) -> Result<EnrollOutcome> {
        Err(Error::EnrollmentUnsupported("pkcs11"))
    }

    fn is_remote_signing(&self) -> bool {
        self.inner.is_remote_signing()
    }

    async fn remote_sign_request(
        &self,
        cancel: &CancellationToken,
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        self.inner
            .remote_sign(cancel, payload, || self.client_tls_config())
            .await
    }
}
