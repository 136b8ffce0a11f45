//! # Identities, Keypairs and Credentials
//!
//! A Plume identity is an email-shaped name, `local@domain`. It is the routing
//! key used by relay servers and the common name (CN) of every certificate a
//! participant presents.
//!
//! ## Identity rules
//!
//! - exactly one `@`
//! - a non-empty local part made of RFC 5322 `atext` characters and dots
//!   (no leading, trailing or doubled dot)
//! - a non-empty domain of dot-separated labels (`[A-Za-z0-9-]`, no label
//!   starting or ending with `-`)
//! - no display-name syntax: whitespace, quotes, angle brackets and commas are
//!   rejected, so a parsed identity always round-trips to the input string
//!
//! ## Keys
//!
//! Keys are Ed25519. The same key signs TLS handshakes, signs address
//! assertions and (converted to X25519) opens sealed payloads addressed to its
//! certificate.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{self, CryptoError};

/// Characters allowed in the local part besides ASCII alphanumerics and `.`.
const LOCAL_SPECIALS: &str = "!#$%&'*+-/=?^_`{|}~";

/// Maximum identity length (RFC 5321 path limit).
pub const MAX_IDENTITY_LEN: usize = 254;

/// Reasons an identity string is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("identity is empty")]
    Empty,
    #[error("identity is longer than {MAX_IDENTITY_LEN} bytes")]
    TooLong,
    #[error("identity has no '@'")]
    MissingAt,
    #[error("identity has more than one '@'")]
    MultipleAt,
    #[error("identity has an empty local part")]
    EmptyLocal,
    #[error("identity has an empty domain")]
    EmptyDomain,
    #[error("invalid local part {0:?}")]
    InvalidLocal(String),
    #[error("invalid domain {0:?}")]
    InvalidDomain(String),
}

/// An email-shaped participant name, `local@domain`.
///
/// Equality is exact string equality; the domain is compared
/// case-insensitively only when it is used for routing decisions
/// (see [`Identity::in_domain`]).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity {
    address: String,
    at: usize,
}

impl Identity {
    /// Parse and validate an identity string.
    pub fn parse(s: &str) -> Result<Self, IdentityError> {
        if s.is_empty() {
            return Err(IdentityError::Empty);
        }
        if s.len() > MAX_IDENTITY_LEN {
            return Err(IdentityError::TooLong);
        }

        let mut ats = s.match_indices('@');
        let at = ats.next().map(|(i, _)| i).ok_or(IdentityError::MissingAt)?;
        if ats.next().is_some() {
            return Err(IdentityError::MultipleAt);
        }

        let (local, domain) = (&s[..at], &s[at + 1..]);
        if local.is_empty() {
            return Err(IdentityError::EmptyLocal);
        }
        if domain.is_empty() {
            return Err(IdentityError::EmptyDomain);
        }
        if !valid_local(local) {
            return Err(IdentityError::InvalidLocal(local.to_string()));
        }
        if !valid_domain(domain) {
            return Err(IdentityError::InvalidDomain(domain.to_string()));
        }

        Ok(Self {
            address: s.to_string(),
            at,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.address
    }

    pub fn local(&self) -> &str {
        &self.address[..self.at]
    }

    pub fn domain(&self) -> &str {
        &self.address[self.at + 1..]
    }

    /// Whether this identity is homed in `domain` (ASCII case-insensitive).
    pub fn in_domain(&self, domain: &str) -> bool {
        self.domain().eq_ignore_ascii_case(domain)
    }
}

fn valid_local(local: &str) -> bool {
    if local.starts_with('.') || local.ends_with('.') || local.contains("..") {
        return false;
    }
    local
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || LOCAL_SPECIALS.contains(c))
}

fn valid_domain(domain: &str) -> bool {
    domain.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

impl FromStr for Identity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Identity {
    type Error = IdentityError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Identity> for String {
    fn from(identity: Identity) -> Self {
        identity.address
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.address
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.address)
    }
}

// ============================================================================
// Keypair
// ============================================================================

/// An Ed25519 signing keypair.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn from_pkcs8_pem(pem: &str) -> Result<Self, CryptoError> {
        let signing_key = SigningKey::from_pkcs8_pem(pem).map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self { signing_key })
    }

    pub fn to_pkcs8_pem(&self) -> Result<String, CryptoError> {
        self.signing_key
            .to_pkcs8_pem(LineEnding::LF)
            .map(|pem| pem.to_string())
            .map_err(|_| CryptoError::InvalidKey)
    }

    pub fn to_pkcs8_der(&self) -> Result<Vec<u8>, CryptoError> {
        self.signing_key
            .to_pkcs8_der()
            .map(|doc| doc.as_bytes().to_vec())
            .map_err(|_| CryptoError::InvalidKey)
    }

    /// The private key in the form rustls expects.
    pub fn private_key_der(&self) -> Result<PrivateKeyDer<'static>, CryptoError> {
        Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            self.to_pkcs8_der()?,
        )))
    }

    /// The same key wrapped for certificate and CSR generation.
    pub fn rcgen_key_pair(&self) -> Result<rcgen::KeyPair, CryptoError> {
        let der = PrivatePkcs8KeyDer::from(self.to_pkcs8_der()?);
        rcgen::KeyPair::try_from(&der).map_err(|_| CryptoError::InvalidKey)
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &hex::encode(self.public_key_bytes()))
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Credentials
// ============================================================================

/// A keypair together with the certificate that binds it to an identity.
///
/// Construction checks that the certificate carries this keypair's public
/// key and that its CN is a valid [`Identity`].
#[derive(Clone, Debug)]
pub struct Credentials {
    keypair: Keypair,
    certificate: Vec<u8>,
    identity: Identity,
}

impl Credentials {
    pub fn new(keypair: Keypair, certificate: Vec<u8>) -> Result<Self, CryptoError> {
        let public_key =
            crypto::certificate_public_key(&certificate).ok_or(CryptoError::MalformedCertificate)?;
        if public_key != keypair.public_key_bytes() {
            return Err(CryptoError::KeyMismatch);
        }
        let identity = crypto::certificate_identity(&certificate)?;
        Ok(Self {
            keypair,
            certificate,
            identity,
        })
    }

    /// Load a PKCS#8 PEM key and a PEM certificate from disk.
    pub fn load(key_path: &Path, cert_path: &Path) -> Result<Self> {
        let key_pem = std::fs::read_to_string(key_path)
            .with_context(|| format!("failed to read key file {}", key_path.display()))?;
        let keypair = Keypair::from_pkcs8_pem(&key_pem)
            .with_context(|| format!("invalid key in {}", key_path.display()))?;
        let certificate = crypto::read_certificate_pem(cert_path)?;
        Self::new(keypair, certificate)
            .with_context(|| format!("certificate {} does not match key", cert_path.display()))
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// DER-encoded certificate.
    pub fn certificate(&self) -> &[u8] {
        &self.certificate
    }

    pub fn certificate_chain(&self) -> Vec<CertificateDer<'static>> {
        vec![CertificateDer::from(self.certificate.clone())]
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formed_identities_round_trip() {
        for s in [
            "alice@example.com",
            "u1@a.test",
            "first.last@mail.example.org",
            "x+tag@b-c.test",
            "o'neil@example.com",
        ] {
            let identity = Identity::parse(s).expect("valid identity");
            assert_eq!(identity.as_str(), s);
            assert_eq!(identity.to_string(), s);
            assert_eq!(format!("{}@{}", identity.local(), identity.domain()), s);
        }
    }

    #[test]
    fn malformed_identities_rejected() {
        assert_eq!(Identity::parse(""), Err(IdentityError::Empty));
        assert_eq!(Identity::parse("not-an-identity"), Err(IdentityError::MissingAt));
        assert_eq!(Identity::parse("a@b@c"), Err(IdentityError::MultipleAt));
        assert_eq!(Identity::parse("@example.com"), Err(IdentityError::EmptyLocal));
        assert_eq!(Identity::parse("alice@"), Err(IdentityError::EmptyDomain));

        for s in [
            "Alice <alice@example.com>",
            "alice @example.com",
            "\"alice\"@example.com",
            ".alice@example.com",
            "al..ice@example.com",
            "alice@example..com",
            "alice@-example.com",
            "alice@example.com.",
            "alice,bob@example.com",
        ] {
            assert!(Identity::parse(s).is_err(), "{s:?} should be rejected");
        }
    }

    #[test]
    fn domain_match_ignores_case() {
        let identity = Identity::parse("bob@B.Test").unwrap();
        assert!(identity.in_domain("b.test"));
        assert!(!identity.in_domain("a.test"));
    }

    #[test]
    fn identity_serde_validates() {
        let identity = Identity::parse("carol@c.test").unwrap();
        let bytes = bincode::serialize(&identity).unwrap();
        let back: Identity = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, identity);

        let bogus = bincode::serialize(&"nobody").unwrap();
        assert!(bincode::deserialize::<Identity>(&bogus).is_err());
    }

    #[test]
    fn keypair_pem_round_trip() {
        let keypair = Keypair::generate();
        let pem = keypair.to_pkcs8_pem().unwrap();
        let back = Keypair::from_pkcs8_pem(&pem).unwrap();
        assert_eq!(back.public_key_bytes(), keypair.public_key_bytes());
    }
}
