//! # Configuration
//!
//! Default ports, on-disk key/certificate locations and the settings structs
//! consumed by [`RelayServer`](crate::relay::RelayServer) and
//! [`PlumeClient`](crate::client::PlumeClient).
//!
//! ## File locations
//!
//! Each role keeps a PKCS#8 PEM key and a PEM certificate under the Plume
//! configuration directory (`<config_dir>/plume/`, see [`dirs::config_dir`]):
//!
//! | Role | Key | Certificate |
//! |------|-----|-------------|
//! | relay | `relay.key` | `relay.crt` |
//! | login | `login.key` | `login.crt` |
//! | client | `client.key` | `client.crt` |
//!
//! The CA certificate lives at `ca.crt`. Every path can be overridden through
//! the environment: `PLUME_CONFIG_DIR` moves the whole directory,
//! `PLUME_<ROLE>_KEY` / `PLUME_<ROLE>_CERT` move one file, and
//! `PLUME_CA_CERT` moves the CA certificate.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::crypto::{self, PeerVerifier};
use crate::identity::{Credentials, Keypair};
use crate::protocols::SrvResolver;

pub const DEFAULT_RELAY_PORT: u16 = 42000;
pub const DEFAULT_LOGIN_PORT: u16 = 42001;
pub const DEFAULT_ECHO_PORT: u16 = 42002;

/// Default size of the client's peer certificate cache.
pub const DEFAULT_CERT_CACHE_SIZE: usize = 256;

/// How long a client waits for the relay to acknowledge a rendezvous cookie.
pub const DEFAULT_RENDEZVOUS_ACK_TIMEOUT: Duration = Duration::from_secs(5);

pub const CONFIG_DIR_ENV: &str = "PLUME_CONFIG_DIR";
pub const CA_CERT_ENV: &str = "PLUME_CA_CERT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Relay,
    Login,
    Client,
}

impl Role {
    pub fn name(self) -> &'static str {
        match self {
            Role::Relay => "relay",
            Role::Login => "login",
            Role::Client => "client",
        }
    }

    fn env_prefix(self) -> &'static str {
        match self {
            Role::Relay => "PLUME_RELAY",
            Role::Login => "PLUME_LOGIN",
            Role::Client => "PLUME_CLIENT",
        }
    }

    pub fn key_env(self) -> String {
        format!("{}_KEY", self.env_prefix())
    }

    pub fn cert_env(self) -> String {
        format!("{}_CERT", self.env_prefix())
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The Plume configuration directory.
///
/// `lookup` reads environment variables; pass `|k| std::env::var(k).ok()` or
/// a fixed map in tests.
pub fn config_dir(lookup: impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    lookup(CONFIG_DIR_ENV)
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .or_else(|| dirs::config_dir().map(|dir| dir.join("plume")))
}

/// Key, certificate and CA certificate paths for one role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPaths {
    pub key: PathBuf,
    pub cert: PathBuf,
    pub ca_cert: PathBuf,
}

impl KeyPaths {
    pub fn resolve(role: Role, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let dir = config_dir(&lookup);
        let pick = |env: &str, file: String| -> Result<PathBuf> {
            if let Some(path) = lookup(env).filter(|p| !p.is_empty()) {
                return Ok(PathBuf::from(path));
            }
            dir.as_ref()
                .map(|dir| dir.join(&file))
                .with_context(|| {
                    format!("no configuration directory; set {CONFIG_DIR_ENV} or {env}")
                })
        };

        Ok(Self {
            key: pick(&role.key_env(), format!("{}.key", role.name()))?,
            cert: pick(&role.cert_env(), format!("{}.crt", role.name()))?,
            ca_cert: pick(CA_CERT_ENV, "ca.crt".to_string())?,
        })
    }

    pub fn from_env(role: Role) -> Result<Self> {
        Self::resolve(role, |key| std::env::var(key).ok())
    }

    pub fn load_credentials(&self) -> Result<Credentials> {
        Credentials::load(&self.key, &self.cert)
    }

    pub fn load_trust(&self) -> Result<crypto::TrustStore> {
        crypto::TrustStore::load(&self.ca_cert)
    }
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Ok(())
}

/// Write a PKCS#8 PEM private key, readable by the owner only on Unix.
pub fn write_key(path: &Path, keypair: &Keypair) -> Result<()> {
    create_parent(path)?;
    let pem = keypair.to_pkcs8_pem()?;
    std::fs::write(path, pem).with_context(|| format!("failed to write {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to restrict {}", path.display()))?;
    }
    Ok(())
}

pub fn write_certificate(path: &Path, cert_der: &[u8]) -> Result<()> {
    create_parent(path)?;
    std::fs::write(path, crypto::certificate_to_pem(cert_der))
        .with_context(|| format!("failed to write {}", path.display()))
}

/// Load the key at `path`, generating and saving a new one if it is missing.
pub fn load_or_generate_key(path: &Path) -> Result<Keypair> {
    if path.exists() {
        let pem = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        return Keypair::from_pkcs8_pem(&pem)
            .with_context(|| format!("invalid key in {}", path.display()));
    }
    let keypair = Keypair::generate();
    write_key(path, &keypair)?;
    Ok(keypair)
}

// ============================================================================
// Server and client settings
// ============================================================================

/// Settings for a relay server.
#[derive(Clone)]
pub struct RelayConfig {
    /// Domain this relay serves; targets inside it are never forwarded.
    pub domain: String,
    pub listen_addr: SocketAddr,
    /// UDP echo listener address; `None` disables rendezvous.
    pub echo_addr: Option<SocketAddr>,
    pub credentials: Credentials,
    /// Policy for clients and peer relays.
    pub trust: Arc<dyn PeerVerifier>,
    pub resolver: Arc<dyn SrvResolver>,
}

impl RelayConfig {
    /// Relay for the domain of `credentials`' identity on the default ports.
    pub fn new(
        credentials: Credentials,
        trust: Arc<dyn PeerVerifier>,
        resolver: Arc<dyn SrvResolver>,
    ) -> Self {
        Self {
            domain: credentials.identity().domain().to_string(),
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_RELAY_PORT)),
            echo_addr: Some(SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_ECHO_PORT))),
            credentials,
            trust,
            resolver,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn with_echo_addr(mut self, addr: Option<SocketAddr>) -> Self {
        self.echo_addr = addr;
        self
    }
}

impl fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConfig")
            .field("domain", &self.domain)
            .field("listen_addr", &self.listen_addr)
            .field("echo_addr", &self.echo_addr)
            .field("identity", self.credentials.identity())
            .finish_non_exhaustive()
    }
}

/// Which transport address a client signs when announcing itself to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMode {
    /// A fixed, already known address.
    Local(SocketAddr),
    /// The externally visible UDP address learned through the echo service.
    Rendezvous,
}

/// Settings for a [`PlumeClient`](crate::client::PlumeClient).
#[derive(Clone)]
pub struct ClientConfig {
    pub credentials: Credentials,
    /// Policy for the home relay and for certificates received through routing.
    pub trust: Arc<dyn PeerVerifier>,
    pub resolver: Arc<dyn SrvResolver>,
    pub address_mode: AddressMode,
    /// Home relay; discovered through SRV when `None`.
    pub relay: Option<(String, u16)>,
    /// UDP echo service; discovered through SRV when `None`.
    pub echo: Option<SocketAddr>,
    pub cert_cache_size: usize,
    /// A cookie the relay has not acknowledged by then counts as refused.
    pub rendezvous_ack_timeout: Duration,
}

impl ClientConfig {
    pub fn new(
        credentials: Credentials,
        trust: Arc<dyn PeerVerifier>,
        resolver: Arc<dyn SrvResolver>,
    ) -> Self {
        Self {
            credentials,
            trust,
            resolver,
            address_mode: AddressMode::Rendezvous,
            relay: None,
            echo: None,
            cert_cache_size: DEFAULT_CERT_CACHE_SIZE,
            rendezvous_ack_timeout: DEFAULT_RENDEZVOUS_ACK_TIMEOUT,
        }
    }

    pub fn with_address_mode(mut self, mode: AddressMode) -> Self {
        self.address_mode = mode;
        self
    }

    pub fn with_relay(mut self, host: impl Into<String>, port: u16) -> Self {
        self.relay = Some((host.into(), port));
        self
    }

    pub fn with_echo(mut self, addr: SocketAddr) -> Self {
        self.echo = Some(addr);
        self
    }

    pub fn with_rendezvous_ack_timeout(mut self, timeout: Duration) -> Self {
        self.rendezvous_ack_timeout = timeout;
        self
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("identity", self.credentials.identity())
            .field("address_mode", &self.address_mode)
            .field("relay", &self.relay)
            .field("echo", &self.echo)
            .finish_non_exhaustive()
    }
}
