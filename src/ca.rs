//! # Certificate Authority and Login
//!
//! The login service turns a certificate signing request into a short-lived
//! client certificate:
//!
//! ```text
//! client                                   login server
//!   | ---- TLS (server auth only) ------------> |
//!   | ---- login(csr) ------------------------> |  verify CSR self-signature
//!   |                                            |  check CN is an identity
//!   | <--- issued(certificate) ---------------- |  sign with CA key
//!   |                  (close)                   |
//! ```
//!
//! The exchange is one-shot: one request per connection, and any failure
//! closes the connection without a reply.
//!
//! Issued certificates carry the CSR's subject CN and public key, serial 0,
//! a validity window of [`LOGIN_CERT_LIFETIME`] starting at the current
//! second, `basicConstraints CA:FALSE` and key usages for signing and key
//! encipherment.
//!
//! The same authority also mints the long-lived certificates relays and the
//! login server present (`plume ca issue-server`).

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, DnValue, IsCa, KeyIdMethod, KeyUsagePurpose, SerialNumber,
};
use rustls::pki_types::{CertificateDer, CertificateSigningRequestDer};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use x509_parser::prelude::FromDer;
use x509_parser::certification_request::X509CertificationRequest;

use crate::crypto::{self, AcceptAny, ClientAuth};
use crate::dns::{self, LOGIN_SERVICE};
use crate::identity::{Credentials, Identity, IdentityError, Keypair};
use crate::messages::{LoginReply, LoginRequest, Message};
use crate::protocols::SrvResolver;
use crate::transport::{self, ChannelHandle};

/// Validity of certificates issued through login.
pub const LOGIN_CERT_LIFETIME: Duration = Duration::from_secs(600);

/// Validity of a freshly created CA certificate.
pub const CA_CERT_LIFETIME: Duration = Duration::from_secs(10 * 365 * 24 * 3600);

/// How long the login server waits for the CSR, and the client for the reply.
pub const LOGIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Login and issuance failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoginError {
    #[error("malformed certificate signing request: {0}")]
    MalformedCsr(String),
    #[error("CSR self-signature does not verify")]
    BadCsrSignature,
    #[error("CSR has no subject common name")]
    MissingSubject,
    #[error("CSR subject is not an identity: {0}")]
    InvalidSubject(#[from] IdentityError),
    #[error("identity {identity} is outside domain {domain}")]
    WrongDomain { identity: String, domain: String },
    #[error("certificate issuance failed: {0}")]
    Issue(String),
    #[error("issued certificate does not match the request")]
    Mismatch,
    #[error("login server closed the connection without issuing")]
    Refused,
}

impl From<rcgen::Error> for LoginError {
    fn from(e: rcgen::Error) -> Self {
        LoginError::Issue(e.to_string())
    }
}

/// Current time truncated to whole seconds.
fn now_seconds() -> Result<OffsetDateTime, LoginError> {
    OffsetDateTime::from_unix_timestamp(OffsetDateTime::now_utc().unix_timestamp())
        .map_err(|e| LoginError::Issue(e.to_string()))
}

fn common_name(name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(name.to_string()));
    dn
}

/// End-entity parameters shared by login and server certificates.
fn end_entity_params(
    identity: &Identity,
    lifetime: Duration,
) -> Result<CertificateParams, LoginError> {
    let not_before = now_seconds()?;
    let mut params = CertificateParams::default();
    params.distinguished_name = common_name(identity.as_str());
    params.serial_number = Some(SerialNumber::from_slice(&[0]));
    params.not_before = not_before;
    params.not_after = not_before + lifetime;
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::DataEncipherment,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.key_identifier_method = KeyIdMethod::Sha256;
    Ok(params)
}

/// A certificate authority: signing key plus its self-signed certificate.
pub struct CertificateAuthority {
    keypair: Keypair,
    signing_key: rcgen::KeyPair,
    certificate: rcgen::Certificate,
    certificate_der: Vec<u8>,
    domain: Option<String>,
}

impl CertificateAuthority {
    /// Create a new CA with a fresh key and a self-signed certificate.
    pub fn generate(name: &str) -> Result<Self> {
        let keypair = Keypair::generate();
        let signing_key = keypair.rcgen_key_pair()?;

        let not_before = now_seconds()?;
        let mut params = CertificateParams::default();
        params.distinguished_name = common_name(name);
        params.not_before = not_before;
        params.not_after = not_before + CA_CERT_LIFETIME;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.key_identifier_method = KeyIdMethod::Sha256;

        let certificate = params
            .self_signed(&signing_key)
            .context("failed to self-sign CA certificate")?;
        let certificate_der = certificate.der().to_vec();

        Ok(Self {
            keypair,
            signing_key,
            certificate,
            certificate_der,
            domain: None,
        })
    }

    /// Rebuild a CA from its key and existing certificate.
    pub fn from_parts(keypair: Keypair, certificate_der: Vec<u8>) -> Result<Self> {
        let public_key = crypto::certificate_public_key(&certificate_der)
            .context("CA certificate is malformed")?;
        anyhow::ensure!(
            public_key == keypair.public_key_bytes(),
            "CA certificate does not match CA key"
        );

        let signing_key = keypair.rcgen_key_pair()?;
        let params = CertificateParams::from_ca_cert_der(&CertificateDer::from(
            certificate_der.as_slice(),
        ))
        .context("failed to parse CA certificate")?;
        let certificate = params
            .self_signed(&signing_key)
            .context("failed to rebuild CA signer")?;

        Ok(Self {
            keypair,
            signing_key,
            certificate,
            certificate_der,
            domain: None,
        })
    }

    pub fn load(key_path: &Path, cert_path: &Path) -> Result<Self> {
        let key_pem = std::fs::read_to_string(key_path)
            .with_context(|| format!("failed to read CA key {}", key_path.display()))?;
        let keypair = Keypair::from_pkcs8_pem(&key_pem)
            .with_context(|| format!("invalid CA key in {}", key_path.display()))?;
        let certificate_der = crypto::read_certificate_pem(cert_path)?;
        Self::from_parts(keypair, certificate_der)
    }

    /// Only issue login certificates for identities in `domain`.
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    /// DER-encoded CA certificate.
    pub fn certificate(&self) -> &[u8] {
        &self.certificate_der
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// Validate a CSR and issue a [`LOGIN_CERT_LIFETIME`] certificate for it.
    pub fn issue(&self, csr_der: &[u8]) -> Result<Vec<u8>, LoginError> {
        let (_, parsed) = X509CertificationRequest::from_der(csr_der)
            .map_err(|e| LoginError::MalformedCsr(e.to_string()))?;
        parsed
            .verify_signature()
            .map_err(|_| LoginError::BadCsrSignature)?;

        let cn = parsed
            .certification_request_info
            .subject
            .iter_common_name()
            .next()
            .and_then(|attr| attr.as_str().ok())
            .ok_or(LoginError::MissingSubject)?;
        let identity = Identity::parse(cn)?;
        if let Some(domain) = &self.domain
            && !identity.in_domain(domain)
        {
            return Err(LoginError::WrongDomain {
                identity: identity.to_string(),
                domain: domain.clone(),
            });
        }

        let mut request =
            CertificateSigningRequestParams::from_der(&CertificateSigningRequestDer::from(csr_der))
                .map_err(|e| LoginError::MalformedCsr(e.to_string()))?;
        // Only the subject and key come from the request; everything else is ours.
        request.params = end_entity_params(&identity, LOGIN_CERT_LIFETIME)?;

        let certificate = request.signed_by(&self.certificate, &self.signing_key)?;
        debug!(identity = %identity, "issued login certificate");
        Ok(certificate.der().to_vec())
    }

    /// Issue a certificate for `identity` bound to `keypair`, valid for `lifetime`.
    pub fn issue_long_lived(
        &self,
        identity: &Identity,
        keypair: &Keypair,
        lifetime: Duration,
    ) -> Result<Vec<u8>, LoginError> {
        let params = end_entity_params(identity, lifetime)?;
        let subject_key = keypair
            .rcgen_key_pair()
            .map_err(|e| LoginError::Issue(e.to_string()))?;
        let certificate = params.signed_by(&subject_key, &self.certificate, &self.signing_key)?;
        Ok(certificate.der().to_vec())
    }
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("keypair", &self.keypair)
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

/// Build a CSR for `identity`, self-signed by `keypair`.
pub fn certificate_request(identity: &Identity, keypair: &Keypair) -> Result<Vec<u8>, LoginError> {
    let mut params = CertificateParams::default();
    params.distinguished_name = common_name(identity.as_str());
    let key = keypair
        .rcgen_key_pair()
        .map_err(|e| LoginError::Issue(e.to_string()))?;
    let csr = params.serialize_request(&key)?;
    Ok(csr.der().to_vec())
}

// ============================================================================
// Login server
// ============================================================================

/// A running login server. Dropping the handle does not stop it; call
/// [`LoginServer::shutdown`].
#[derive(Debug, Clone)]
pub struct LoginServer {
    local_addr: SocketAddr,
    token: CancellationToken,
}

impl LoginServer {
    /// Bind `addr` and serve logins, presenting `credentials` as the server
    /// certificate.
    pub async fn bind(
        addr: SocketAddr,
        credentials: &Credentials,
        ca: Arc<CertificateAuthority>,
    ) -> Result<Self> {
        let config = crypto::server_config(credentials, Arc::new(AcceptAny), ClientAuth::Optional)?;
        let acceptor = TlsAcceptor::from(config);
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind login listener on {addr}"))?;
        let local_addr = listener.local_addr()?;
        let token = CancellationToken::new();

        info!(addr = %local_addr, domain = ?ca.domain(), "login server listening");
        tokio::spawn(accept_loop(listener, acceptor, ca, token.clone()));

        Ok(Self { local_addr, token })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    ca: Arc<CertificateAuthority>,
    token: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (tcp, remote) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "login accept failed");
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let ca = ca.clone();
        let token = token.child_token();
        tokio::spawn(async move {
            match transport::accept::<LoginRequest>(tcp, &acceptor).await {
                Ok((channel, inbound)) => serve_login(channel, inbound, &ca, token).await,
                Err(e) => debug!(remote = %remote, error = %e, "login handshake failed"),
            }
        });
    }
}

/// Handle one login connection: a single CSR, a single reply.
async fn serve_login(
    channel: ChannelHandle,
    mut inbound: tokio::sync::mpsc::Receiver<LoginRequest>,
    ca: &CertificateAuthority,
    token: CancellationToken,
) {
    let remote = channel.remote_addr();
    let request = tokio::select! {
        _ = token.cancelled() => None,
        request = tokio::time::timeout(LOGIN_TIMEOUT, inbound.recv()) => request.ok().flatten(),
    };

    let Some(LoginRequest::Login { csr }) = request else {
        debug!(remote = %remote, "login channel closed without request");
        channel.close();
        return;
    };

    match ca.issue(&csr) {
        Ok(certificate) => {
            if channel.send(Message::Issued { certificate }).await.is_ok() {
                channel.finish().await;
            }
        }
        Err(e) => {
            warn!(remote = %remote, error = %e, "rejecting login");
            channel.close();
        }
    }
}

// ============================================================================
// Login client
// ============================================================================

/// Request a certificate for `identity` from the login server at `host:port`.
///
/// The returned certificate is checked to name `identity` and to carry
/// `keypair`'s public key.
pub async fn request_certificate(
    host: &str,
    port: u16,
    identity: &Identity,
    keypair: &Keypair,
) -> Result<Vec<u8>> {
    let config = crypto::client_config(None, Arc::new(AcceptAny))?;
    let (channel, mut inbound) = transport::dial::<LoginReply>(host, port, config).await?;

    let csr = certificate_request(identity, keypair)?;
    channel
        .send(Message::Login { csr })
        .await
        .context("login channel closed before request was sent")?;

    let reply = tokio::time::timeout(LOGIN_TIMEOUT, inbound.recv())
        .await
        .context("timed out waiting for login reply")?;
    channel.close();

    let Some(LoginReply::Issued { certificate }) = reply else {
        return Err(LoginError::Refused.into());
    };

    let issued_identity = crypto::certificate_identity(&certificate)?;
    let issued_key = crypto::certificate_public_key(&certificate);
    if issued_identity != *identity || issued_key != Some(keypair.public_key_bytes()) {
        return Err(LoginError::Mismatch.into());
    }

    info!(identity = %identity, "obtained login certificate");
    Ok(certificate)
}

/// Find the login server for `identity`'s domain and request a certificate.
pub async fn login(
    resolver: &dyn SrvResolver,
    identity: &Identity,
    keypair: &Keypair,
    default_port: u16,
) -> Result<Vec<u8>> {
    let (host, port) =
        dns::resolve_or_default(resolver, LOGIN_SERVICE, identity.domain(), default_port).await;
    request_certificate(&host, port, identity, keypair)
        .await
        .with_context(|| format!("login at {host}:{port} failed"))
}
