//! # Cryptographic Infrastructure
//!
//! This module provides the cryptographic building blocks for Plume:
//!
//! - **TLS**: rustls client/server configurations with a pluggable peer
//!   verification policy
//! - **Certificates**: CN/public-key extraction and PEM helpers
//! - **Signatures**: domain-separated Ed25519 signatures
//! - **Sealing**: multi-block public-key encryption addressed to a certificate
//!
//! ## Trust Model
//!
//! - The CN of a peer's certificate is its [`Identity`]
//! - Relays and clients verify each other against a [`TrustStore`] of CA
//!   certificates (signature and validity window)
//! - The login exchange uses [`AcceptAny`]: the client has no credential yet
//!   and only needs the server's certificate to parse
//!
//! ## Address Assertions
//!
//! A client proves its transport address to a peer by signing
//! `(own certificate, address)` under [`ADDRESS_SIGNATURE_DOMAIN`], then
//! sealing the signed blob to the peer's certificate key. Sealing converts
//! the Ed25519 keys to X25519 and encrypts the payload in fixed-size blocks,
//! each bound to its position so blocks cannot be dropped or reordered.

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use crypto_box::aead::{Aead, Nonce};
use crypto_box::{ChaChaBox, PublicKey as BoxPublicKey, SecretKey as BoxSecretKey};
use ed25519_dalek::{Signature, VerifyingKey};
use rand::rngs::OsRng;
use rustls::pki_types::{CertificateDer, UnixTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use x509_parser::prelude::*;

use crate::identity::{Credentials, Identity, IdentityError, Keypair};

// ============================================================================
// Error Types
// ============================================================================

/// Signature verification failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("signature is missing")]
    Missing,
    #[error("signature has invalid length")]
    InvalidLength,
    #[error("signature verification failed")]
    VerificationFailed,
    #[error("invalid public key")]
    InvalidPublicKey,
}

/// Certificate, key and sealing failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("malformed certificate")]
    MalformedCertificate,
    #[error("certificate has no common name")]
    MissingCommonName,
    #[error("certificate common name is not an identity: {0}")]
    InvalidCommonName(#[from] IdentityError),
    #[error("certificate key does not match keypair")]
    KeyMismatch,
    #[error("invalid private key")]
    InvalidKey,
    #[error("certificate rejected: {0}")]
    Untrusted(String),
    #[error("signature: {0}")]
    Signature(#[from] SignatureError),
    #[error("address assertion was signed for a different certificate")]
    AssertionMismatch,
    #[error("sealed payload could not be opened")]
    Unseal,
    #[error("payload could not be sealed")]
    Seal,
    #[error("encoding: {0}")]
    Encoding(String),
}

// ============================================================================
// Domain Separation Prefixes
// ============================================================================

/// Domain separation prefix for signed transport-address assertions.
pub const ADDRESS_SIGNATURE_DOMAIN: &[u8] = b"plume-address-v1:";

/// Sign data with domain separation.
pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    keypair.sign(&prefixed).to_bytes().to_vec()
}

/// Verify a domain-separated signature made by `public_key`.
pub fn verify_with_domain(
    public_key: &[u8; 32],
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let sig = Signature::from_bytes(&sig_bytes);

    let verifying_key =
        VerifyingKey::from_bytes(public_key).map_err(|_| SignatureError::InvalidPublicKey)?;

    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);

    verifying_key
        .verify_strict(&prefixed, &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

// ============================================================================
// Certificate Helpers
// ============================================================================

/// Returns the Ed25519 public key carried by a DER certificate.
pub fn certificate_public_key(cert_der: &[u8]) -> Option<[u8; 32]> {
    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;

    let key_bytes = &cert.public_key().subject_public_key.data;
    key_bytes.as_ref().try_into().ok()
}

/// Returns the subject common name of a DER certificate.
pub fn certificate_common_name(cert_der: &[u8]) -> Result<String, CryptoError> {
    let (_, cert) =
        X509Certificate::from_der(cert_der).map_err(|_| CryptoError::MalformedCertificate)?;
    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .ok_or(CryptoError::MissingCommonName)?;
    Ok(cn.to_string())
}

/// Returns the identity named by a certificate's CN.
pub fn certificate_identity(cert_der: &[u8]) -> Result<Identity, CryptoError> {
    let cn = certificate_common_name(cert_der)?;
    Ok(Identity::parse(&cn)?)
}

pub fn certificate_to_pem(cert_der: &[u8]) -> String {
    ::pem::encode(&::pem::Pem::new("CERTIFICATE", cert_der.to_vec()))
}

/// Returns the first certificate of a PEM bundle.
pub fn certificate_from_pem(pem_text: &str) -> Result<Vec<u8>, CryptoError> {
    ::pem::parse_many(pem_text)
        .map_err(|e| CryptoError::Encoding(e.to_string()))?
        .into_iter()
        .find(|block| block.tag() == "CERTIFICATE")
        .map(|block| block.into_contents())
        .ok_or(CryptoError::MalformedCertificate)
}

pub fn read_certificate_pem(path: &Path) -> Result<Vec<u8>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read certificate {}", path.display()))?;
    certificate_from_pem(&text)
        .with_context(|| format!("no certificate in {}", path.display()))
}

// ============================================================================
// Peer Verification Policies
// ============================================================================

/// Decides whether a peer certificate is acceptable.
///
/// Invoked on every TLS handshake and on every certificate that arrives
/// inside a routed message.
pub trait PeerVerifier: fmt::Debug + Send + Sync {
    fn verify(&self, cert_der: &[u8], now: UnixTime) -> Result<(), rustls::CertificateError>;
}

/// Accepts any certificate that parses. Used for the login bootstrap.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAny;

impl PeerVerifier for AcceptAny {
    fn verify(&self, cert_der: &[u8], _now: UnixTime) -> Result<(), rustls::CertificateError> {
        X509Certificate::from_der(cert_der)
            .map(|_| ())
            .map_err(|_| rustls::CertificateError::BadEncoding)
    }
}

/// Accepts certificates signed by one of the configured CA certificates and
/// inside their validity window.
#[derive(Debug, Clone)]
pub struct TrustStore {
    roots: Vec<Vec<u8>>,
}

impl TrustStore {
    pub fn new(roots: Vec<Vec<u8>>) -> Self {
        Self { roots }
    }

    pub fn single(root: Vec<u8>) -> Self {
        Self { roots: vec![root] }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read CA bundle {}", path.display()))?;
        let roots: Vec<Vec<u8>> = ::pem::parse_many(&text)
            .with_context(|| format!("invalid PEM in {}", path.display()))?
            .into_iter()
            .filter(|block| block.tag() == "CERTIFICATE")
            .map(|block| block.into_contents())
            .collect();
        anyhow::ensure!(!roots.is_empty(), "no CA certificates in {}", path.display());
        Ok(Self { roots })
    }
}

impl PeerVerifier for TrustStore {
    fn verify(&self, cert_der: &[u8], now: UnixTime) -> Result<(), rustls::CertificateError> {
        let (_, cert) = X509Certificate::from_der(cert_der)
            .map_err(|_| rustls::CertificateError::BadEncoding)?;

        let now = ASN1Time::from_timestamp(now.as_secs() as i64)
            .map_err(|_| rustls::CertificateError::BadEncoding)?;
        let validity = cert.validity();
        if now < validity.not_before {
            return Err(rustls::CertificateError::NotValidYet);
        }
        if now > validity.not_after {
            return Err(rustls::CertificateError::Expired);
        }

        for root in &self.roots {
            let Ok((_, ca)) = X509Certificate::from_der(root) else {
                continue;
            };
            if ca.subject().as_raw() == cert.issuer().as_raw()
                && cert.verify_signature(Some(ca.public_key())).is_ok()
            {
                return Ok(());
            }
        }

        Err(rustls::CertificateError::UnknownIssuer)
    }
}

/// Checks a certificate received inside a routed message and returns the
/// identity it names.
pub fn verify_routed_certificate(
    verifier: &dyn PeerVerifier,
    cert_der: &[u8],
) -> Result<Identity, CryptoError> {
    verifier
        .verify(cert_der, UnixTime::now())
        .map_err(|e| CryptoError::Untrusted(format!("{e:?}")))?;
    certificate_identity(cert_der)
}

// ============================================================================
// TLS Configuration
// ============================================================================

/// Lazily-initialized crypto provider for rustls.
/// Uses ring as the underlying cryptographic implementation.
static CRYPTO_PROVIDER: std::sync::LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    std::sync::LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// ALPN protocol identifier for every Plume connection.
pub const ALPN: &[u8] = b"plume";

/// Whether a server requires clients to present a certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAuth {
    Required,
    Optional,
}

pub fn server_config(
    credentials: &Credentials,
    policy: Arc<dyn PeerVerifier>,
    client_auth: ClientAuth,
) -> Result<Arc<rustls::ServerConfig>> {
    let verifier = Arc::new(PolicyClientVerifier {
        policy,
        mandatory: client_auth == ClientAuth::Required,
    });
    let mut config = rustls::ServerConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_safe_default_protocol_versions()
        .context("failed to select TLS protocol versions")?
        .with_client_cert_verifier(verifier)
        .with_single_cert(
            credentials.certificate_chain(),
            credentials.keypair().private_key_der()?,
        )
        .context("failed to create server TLS config")?;
    config.alpn_protocols = vec![ALPN.to_vec()];
    Ok(Arc::new(config))
}

/// Client TLS configuration; `credentials` is `None` for the login bootstrap.
pub fn client_config(
    credentials: Option<&Credentials>,
    policy: Arc<dyn PeerVerifier>,
) -> Result<Arc<rustls::ClientConfig>> {
    let builder = rustls::ClientConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_safe_default_protocol_versions()
        .context("failed to select TLS protocol versions")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PolicyServerVerifier { policy }));

    let mut config = match credentials {
        Some(credentials) => builder
            .with_client_auth_cert(
                credentials.certificate_chain(),
                credentials.keypair().private_key_der()?,
            )
            .context("failed to create client TLS config with client auth")?,
        None => builder.with_no_client_auth(),
    };
    config.alpn_protocols = vec![ALPN.to_vec()];
    Ok(Arc::new(config))
}

#[derive(Debug)]
struct PolicyClientVerifier {
    policy: Arc<dyn PeerVerifier>,
    mandatory: bool,
}

impl rustls::server::danger::ClientCertVerifier for PolicyClientVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        self.policy
            .verify(end_entity.as_ref(), now)
            .map_err(rustls::Error::InvalidCertificate)?;
        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        CRYPTO_PROVIDER
            .signature_verification_algorithms
            .supported_schemes()
    }

    fn client_auth_mandatory(&self) -> bool {
        self.mandatory
    }
}

#[derive(Debug)]
struct PolicyServerVerifier {
    policy: Arc<dyn PeerVerifier>,
}

impl rustls::client::danger::ServerCertVerifier for PolicyServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        // Relays are addressed by SRV target, not by certificate name; the
        // certificate's CN is what identifies the peer.
        self.policy
            .verify(end_entity.as_ref(), now)
            .map_err(rustls::Error::InvalidCertificate)?;
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        CRYPTO_PROVIDER
            .signature_verification_algorithms
            .supported_schemes()
    }
}

// ============================================================================
// Multi-block Sealing
// ============================================================================

/// Plaintext bytes per sealed block.
pub const SEAL_BLOCK_SIZE: usize = 1024;

/// Upper bound on blocks in one sealed payload.
pub const MAX_SEALED_BLOCKS: usize = 64;

/// A payload encrypted to an Ed25519 certificate key, block by block.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SealedBlocks {
    /// Sender's ephemeral X25519 public key.
    pub ephemeral: [u8; 32],
    pub blocks: Vec<Vec<u8>>,
}

/// Nonce for block `index`; the final block is flagged so truncation fails.
fn block_nonce(index: usize, last: bool) -> Nonce<ChaChaBox> {
    let mut bytes = [0u8; 24];
    bytes[..8].copy_from_slice(&(index as u64).to_be_bytes());
    bytes[8] = u8::from(last);
    Nonce::<ChaChaBox>::clone_from_slice(&bytes)
}

/// Encrypt `plaintext` for the holder of `recipient` (an Ed25519 public key).
pub fn seal_blocks(recipient: &[u8; 32], plaintext: &[u8]) -> Result<SealedBlocks, CryptoError> {
    let recipient = VerifyingKey::from_bytes(recipient)
        .map_err(|_| CryptoError::Signature(SignatureError::InvalidPublicKey))?;
    let ephemeral = BoxSecretKey::generate(&mut OsRng);
    let cipher = ChaChaBox::new(&BoxPublicKey::from(recipient.to_montgomery()), &ephemeral);

    let chunks: Vec<&[u8]> = if plaintext.is_empty() {
        vec![&[][..]]
    } else {
        plaintext.chunks(SEAL_BLOCK_SIZE).collect()
    };
    if chunks.len() > MAX_SEALED_BLOCKS {
        return Err(CryptoError::Seal);
    }

    let last = chunks.len() - 1;
    let blocks = chunks
        .iter()
        .enumerate()
        .map(|(index, chunk)| {
            cipher
                .encrypt(&block_nonce(index, index == last), *chunk)
                .map_err(|_| CryptoError::Seal)
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(SealedBlocks {
        ephemeral: *ephemeral.public_key().as_bytes(),
        blocks,
    })
}

/// Decrypt a [`SealedBlocks`] with our keypair, concatenating blocks in order.
pub fn open_blocks(keypair: &Keypair, sealed: &SealedBlocks) -> Result<Vec<u8>, CryptoError> {
    if sealed.blocks.is_empty() || sealed.blocks.len() > MAX_SEALED_BLOCKS {
        return Err(CryptoError::Unseal);
    }
    let secret = BoxSecretKey::from(keypair.signing_key().to_scalar());
    let cipher = ChaChaBox::new(&BoxPublicKey::from(sealed.ephemeral), &secret);

    let last = sealed.blocks.len() - 1;
    let mut plaintext = Vec::with_capacity(sealed.blocks.len() * SEAL_BLOCK_SIZE);
    for (index, block) in sealed.blocks.iter().enumerate() {
        let chunk = cipher
            .decrypt(&block_nonce(index, index == last), block.as_slice())
            .map_err(|_| CryptoError::Unseal)?;
        plaintext.extend_from_slice(&chunk);
    }
    Ok(plaintext)
}

// ============================================================================
// Address Assertions
// ============================================================================

/// A transport address signed together with the signer's certificate.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AddressAssertion {
    pub certificate: Vec<u8>,
    pub addr: SocketAddr,
    pub signature: Vec<u8>,
}

fn assertion_payload(certificate: &[u8], addr: &SocketAddr) -> Result<Vec<u8>, CryptoError> {
    bincode::serialize(&(certificate, addr)).map_err(|e| CryptoError::Encoding(e.to_string()))
}

impl AddressAssertion {
    pub fn sign(credentials: &Credentials, addr: SocketAddr) -> Result<Self, CryptoError> {
        let certificate = credentials.certificate().to_vec();
        let payload = assertion_payload(&certificate, &addr)?;
        let signature = sign_with_domain(credentials.keypair(), ADDRESS_SIGNATURE_DOMAIN, &payload);
        Ok(Self {
            certificate,
            addr,
            signature,
        })
    }

    /// Check the assertion against the certificate the routed message came with.
    pub fn verify(&self, sender_cert: &[u8]) -> Result<SocketAddr, CryptoError> {
        if self.certificate != sender_cert {
            return Err(CryptoError::AssertionMismatch);
        }
        let public_key =
            certificate_public_key(sender_cert).ok_or(CryptoError::MalformedCertificate)?;
        let payload = assertion_payload(&self.certificate, &self.addr)?;
        verify_with_domain(&public_key, ADDRESS_SIGNATURE_DOMAIN, &payload, &self.signature)?;
        Ok(self.addr)
    }
}

/// Sign `addr` and seal the result to the peer certificate's key.
pub fn seal_address(
    credentials: &Credentials,
    peer_cert: &[u8],
    addr: SocketAddr,
) -> Result<Vec<u8>, CryptoError> {
    let assertion = AddressAssertion::sign(credentials, addr)?;
    let plaintext =
        bincode::serialize(&assertion).map_err(|e| CryptoError::Encoding(e.to_string()))?;
    let recipient = certificate_public_key(peer_cert).ok_or(CryptoError::MalformedCertificate)?;
    let sealed = seal_blocks(&recipient, &plaintext)?;
    bincode::serialize(&sealed).map_err(|e| CryptoError::Encoding(e.to_string()))
}

/// Open a sealed address assertion from `sender_cert` and verify its signature.
pub fn open_address(
    keypair: &Keypair,
    sender_cert: &[u8],
    payload: &[u8],
) -> Result<SocketAddr, CryptoError> {
    let sealed: SealedBlocks = crate::messages::deserialize_bounded(payload)
        .map_err(|e| CryptoError::Encoding(e.to_string()))?;
    let plaintext = open_blocks(keypair, &sealed)?;
    let assertion: AddressAssertion = crate::messages::deserialize_bounded(&plaintext)
        .map_err(|e| CryptoError::Encoding(e.to_string()))?;
    assertion.verify(sender_cert)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::CertificateAuthority;

    fn issued(ca: &CertificateAuthority, name: &str) -> Credentials {
        let keypair = Keypair::generate();
        let identity = Identity::parse(name).unwrap();
        let cert = ca
            .issue_long_lived(&identity, &keypair, std::time::Duration::from_secs(3600))
            .unwrap();
        Credentials::new(keypair, cert).unwrap()
    }

    #[test]
    fn certificate_names_identity_and_key() {
        let ca = CertificateAuthority::generate("Plume Test CA").unwrap();
        let creds = issued(&ca, "alice@a.test");

        assert_eq!(creds.identity().as_str(), "alice@a.test");
        assert_eq!(
            certificate_public_key(creds.certificate()).unwrap(),
            creds.keypair().public_key_bytes()
        );
    }

    #[test]
    fn credentials_reject_foreign_key() {
        let ca = CertificateAuthority::generate("Plume Test CA").unwrap();
        let creds = issued(&ca, "alice@a.test");
        let err = Credentials::new(Keypair::generate(), creds.certificate().to_vec()).unwrap_err();
        assert_eq!(err, CryptoError::KeyMismatch);
    }

    #[test]
    fn trust_store_loads_pem_bundle() {
        let first = CertificateAuthority::generate("Plume CA 1").unwrap();
        let second = CertificateAuthority::generate("Plume CA 2").unwrap();
        let bundle = format!(
            "{}{}",
            certificate_to_pem(first.certificate()),
            certificate_to_pem(second.certificate())
        );
        assert_eq!(certificate_from_pem(&bundle).unwrap(), first.certificate());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ca.pem");
        std::fs::write(&path, &bundle).unwrap();
        let store = TrustStore::load(&path).unwrap();
        let creds = issued(&second, "bob@b.test");
        assert!(store.verify(creds.certificate(), UnixTime::now()).is_ok());

        std::fs::write(&path, "not a certificate").unwrap();
        assert!(TrustStore::load(&path).is_err());
    }

    #[test]
    fn trust_store_checks_issuer_signature() {
        let ca = CertificateAuthority::generate("Plume Test CA").unwrap();
        let other = CertificateAuthority::generate("Plume Test CA").unwrap();
        let creds = issued(&ca, "alice@a.test");

        let store = TrustStore::single(ca.certificate().to_vec());
        assert!(store.verify(creds.certificate(), UnixTime::now()).is_ok());

        // Same subject name, different key: the signature must not verify.
        let foreign = TrustStore::single(other.certificate().to_vec());
        assert_eq!(
            foreign.verify(creds.certificate(), UnixTime::now()),
            Err(rustls::CertificateError::UnknownIssuer)
        );
    }

    #[test]
    fn trust_store_rejects_expired() {
        let ca = CertificateAuthority::generate("Plume Test CA").unwrap();
        let creds = issued(&ca, "alice@a.test");
        let store = TrustStore::single(ca.certificate().to_vec());

        let later = UnixTime::since_unix_epoch(std::time::Duration::from_secs(
            UnixTime::now().as_secs() + 7200,
        ));
        assert_eq!(
            store.verify(creds.certificate(), later),
            Err(rustls::CertificateError::Expired)
        );
    }

    #[test]
    fn accept_any_only_requires_parsing() {
        assert!(AcceptAny.verify(b"junk", UnixTime::now()).is_err());
        let ca = CertificateAuthority::generate("Plume Test CA").unwrap();
        assert!(AcceptAny.verify(ca.certificate(), UnixTime::now()).is_ok());
    }

    #[test]
    fn sealed_blocks_span_multiple_blocks() {
        let keypair = Keypair::generate();
        let plaintext: Vec<u8> = (0..(SEAL_BLOCK_SIZE * 3 + 17)).map(|i| i as u8).collect();

        let sealed = seal_blocks(&keypair.public_key_bytes(), &plaintext).unwrap();
        assert_eq!(sealed.blocks.len(), 4);
        assert_eq!(open_blocks(&keypair, &sealed).unwrap(), plaintext);
    }

    #[test]
    fn sealed_blocks_detect_reorder_and_truncation() {
        let keypair = Keypair::generate();
        let plaintext = vec![7u8; SEAL_BLOCK_SIZE * 2 + 1];
        let sealed = seal_blocks(&keypair.public_key_bytes(), &plaintext).unwrap();

        let mut reordered = sealed.clone();
        reordered.blocks.swap(0, 1);
        assert_eq!(open_blocks(&keypair, &reordered), Err(CryptoError::Unseal));

        let mut truncated = sealed.clone();
        truncated.blocks.pop();
        assert_eq!(open_blocks(&keypair, &truncated), Err(CryptoError::Unseal));

        let stranger = Keypair::generate();
        assert_eq!(open_blocks(&stranger, &sealed), Err(CryptoError::Unseal));
    }

    #[test]
    fn address_assertion_verifies_against_sender() {
        let ca = CertificateAuthority::generate("Plume Test CA").unwrap();
        let alice = issued(&ca, "alice@a.test");
        let bob = issued(&ca, "bob@a.test");
        let addr: SocketAddr = "203.0.113.7:41000".parse().unwrap();

        let sealed = seal_address(&alice, bob.certificate(), addr).unwrap();
        let opened = open_address(bob.keypair(), alice.certificate(), &sealed).unwrap();
        assert_eq!(opened, addr);

        // Claiming the assertion came from someone else fails.
        let mallory = issued(&ca, "mallory@a.test");
        assert_eq!(
            open_address(bob.keypair(), mallory.certificate(), &sealed),
            Err(CryptoError::AssertionMismatch)
        );
    }

    #[test]
    fn forged_assertion_signature_rejected() {
        let ca = CertificateAuthority::generate("Plume Test CA").unwrap();
        let alice = issued(&ca, "alice@a.test");
        let mut assertion =
            AddressAssertion::sign(&alice, "198.51.100.1:5000".parse().unwrap()).unwrap();
        assertion.addr = "198.51.100.99:5000".parse().unwrap();

        assert_eq!(
            assertion.verify(alice.certificate()),
            Err(CryptoError::Signature(SignatureError::VerificationFailed))
        );
    }
}
