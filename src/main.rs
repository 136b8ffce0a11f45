use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use plume::config::{
    self, AddressMode, ClientConfig, DEFAULT_ECHO_PORT, DEFAULT_LOGIN_PORT, DEFAULT_RELAY_PORT,
    KeyPaths, RelayConfig, Role,
};
use plume::{
    CertificateAuthority, Credentials, DnsResolver, Identity, LoginServer, PeerEvent, PlumeClient,
    RelayServer, SrvResolver, TrustStore, ca,
};

/// Lifetime of relay and login server certificates minted by `ca issue-server`.
const SERVER_CERT_LIFETIME: Duration = Duration::from_secs(365 * 24 * 3600);

#[derive(Parser, Debug)]
#[command(name = "plume")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a relay server for one domain.
    Relay {
        #[arg(short, long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_RELAY_PORT)))]
        bind: SocketAddr,

        #[arg(long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_ECHO_PORT)))]
        echo: SocketAddr,

        /// Domain served; defaults to the domain of the relay certificate.
        #[arg(short, long)]
        domain: Option<String>,

        #[arg(long, env = "PLUME_RELAY_KEY")]
        key: Option<PathBuf>,

        #[arg(long, env = "PLUME_RELAY_CERT")]
        cert: Option<PathBuf>,

        #[arg(long, env = "PLUME_CA_CERT")]
        ca_cert: Option<PathBuf>,
    },

    /// Run the login service (certificate authority).
    Login {
        #[arg(short, long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_LOGIN_PORT)))]
        bind: SocketAddr,

        /// Only issue certificates for this domain.
        #[arg(short, long)]
        domain: Option<String>,

        /// CA private key (PKCS#8 PEM).
        #[arg(long)]
        ca_key: Option<PathBuf>,

        #[arg(long, env = "PLUME_CA_CERT")]
        ca_cert: Option<PathBuf>,

        #[arg(long, env = "PLUME_LOGIN_KEY")]
        key: Option<PathBuf>,

        #[arg(long, env = "PLUME_LOGIN_CERT")]
        cert: Option<PathBuf>,
    },

    /// Log in as `identity` and exchange addresses with peers.
    Client {
        identity: Identity,

        /// Peers to connect to.
        peers: Vec<String>,

        /// Sign this fixed address instead of learning one through rendezvous.
        #[arg(long)]
        local_addr: Option<SocketAddr>,

        /// Skip login and reuse the certificate on disk.
        #[arg(long)]
        no_login: bool,

        #[arg(long, env = "PLUME_CLIENT_KEY")]
        key: Option<PathBuf>,

        #[arg(long, env = "PLUME_CLIENT_CERT")]
        cert: Option<PathBuf>,

        #[arg(long, env = "PLUME_CA_CERT")]
        ca_cert: Option<PathBuf>,
    },

    /// Certificate authority bootstrap.
    Ca {
        #[command(subcommand)]
        command: CaCommand,
    },
}

#[derive(Subcommand, Debug)]
enum CaCommand {
    /// Create a CA key and self-signed certificate.
    Init {
        #[arg(long, default_value = "Plume CA")]
        name: String,

        #[arg(long)]
        ca_key: Option<PathBuf>,

        #[arg(long, env = "PLUME_CA_CERT")]
        ca_cert: Option<PathBuf>,
    },

    /// Issue a long-lived certificate for a relay or login server.
    IssueServer {
        /// Server identity, e.g. `relay@example.com`.
        identity: Identity,

        #[arg(long, value_enum, default_value = "relay")]
        role: ServerRole,

        #[arg(long)]
        ca_key: Option<PathBuf>,

        #[arg(long, env = "PLUME_CA_CERT")]
        ca_cert: Option<PathBuf>,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ServerRole {
    Relay,
    Login,
}

impl From<ServerRole> for Role {
    fn from(role: ServerRole) -> Self {
        match role {
            ServerRole::Relay => Role::Relay,
            ServerRole::Login => Role::Login,
        }
    }
}

/// Paths for `role`, with explicit flags taking precedence.
fn paths(
    role: Role,
    key: Option<PathBuf>,
    cert: Option<PathBuf>,
    ca_cert: Option<PathBuf>,
) -> Result<KeyPaths> {
    let mut paths = KeyPaths::from_env(role)?;
    if let Some(key) = key {
        paths.key = key;
    }
    if let Some(cert) = cert {
        paths.cert = cert;
    }
    if let Some(ca_cert) = ca_cert {
        paths.ca_cert = ca_cert;
    }
    Ok(paths)
}

fn ca_key_path(ca_key: Option<PathBuf>) -> Result<PathBuf> {
    match ca_key {
        Some(path) => Ok(path),
        None => config::config_dir(|key| std::env::var(key).ok())
            .map(|dir| dir.join("ca.key"))
            .context("no configuration directory; pass --ca-key"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Relay {
            bind,
            echo,
            domain,
            key,
            cert,
            ca_cert,
        } => {
            let paths = paths(Role::Relay, key, cert, ca_cert)?;
            let credentials = paths.load_credentials()?;
            let trust = Arc::new(paths.load_trust()?);
            let resolver = Arc::new(DnsResolver::from_system()?);

            let mut relay_config = RelayConfig::new(credentials, trust, resolver)
                .with_listen_addr(bind)
                .with_echo_addr(Some(echo));
            if let Some(domain) = domain {
                relay_config = relay_config.with_domain(domain);
            }

            let relay = RelayServer::bind(relay_config).await?;
            wait_for_shutdown().await;
            relay.shutdown().await;
        }

        Command::Login {
            bind,
            domain,
            ca_key,
            ca_cert,
            key,
            cert,
        } => {
            let paths = paths(Role::Login, key, cert, ca_cert)?;
            let credentials = paths.load_credentials()?;
            let mut authority = CertificateAuthority::load(&ca_key_path(ca_key)?, &paths.ca_cert)?;
            if let Some(domain) = domain {
                authority = authority.with_domain(domain);
            }

            let server = LoginServer::bind(bind, &credentials, Arc::new(authority)).await?;
            wait_for_shutdown().await;
            server.shutdown();
        }

        Command::Client {
            identity,
            peers,
            local_addr,
            no_login,
            key,
            cert,
            ca_cert,
        } => {
            let paths = paths(Role::Client, key, cert, ca_cert)?;
            let resolver: Arc<dyn SrvResolver> = Arc::new(DnsResolver::from_system()?);
            let keypair = config::load_or_generate_key(&paths.key)?;

            if !no_login {
                let certificate =
                    ca::login(resolver.as_ref(), &identity, &keypair, DEFAULT_LOGIN_PORT).await?;
                config::write_certificate(&paths.cert, &certificate)?;
                info!(identity = %identity, cert = %paths.cert.display(), "saved certificate");
            }

            let credentials = paths.load_credentials()?;
            anyhow::ensure!(
                credentials.identity() == &identity,
                "certificate in {} is for {}, not {}",
                paths.cert.display(),
                credentials.identity(),
                identity
            );
            let trust = Arc::new(TrustStore::load(&paths.ca_cert)?);

            let mode = match local_addr {
                Some(addr) => AddressMode::Local(addr),
                None => AddressMode::Rendezvous,
            };
            let client_config =
                ClientConfig::new(credentials, trust, resolver).with_address_mode(mode);
            let (client, mut events) = PlumeClient::connect(client_config).await?;

            for peer in &peers {
                client.connect_peer(peer).await?;
            }

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received shutdown signal, exiting gracefully");
                        break;
                    }
                    _ = client.closed() => {
                        warn!("relay closed the connection");
                        break;
                    }
                    event = events.recv() => match event {
                        Some(PeerEvent::Connected { peer, addr }) => {
                            println!("{peer} {addr}");
                        }
                        Some(PeerEvent::Announced { peer, addr }) => {
                            info!(peer = %peer, addr = %addr, "sent address");
                        }
                        Some(PeerEvent::RendezvousFailed { peer }) => {
                            warn!(peer = %peer, "could not learn external address");
                        }
                        None => break,
                    }
                }
            }
            client.close();
        }

        Command::Ca { command } => match command {
            CaCommand::Init {
                name,
                ca_key,
                ca_cert,
            } => {
                let key_path = ca_key_path(ca_key)?;
                let cert_path = match ca_cert {
                    Some(path) => path,
                    None => KeyPaths::from_env(Role::Relay)?.ca_cert,
                };
                anyhow::ensure!(
                    !key_path.exists(),
                    "{} already exists; refusing to overwrite a CA key",
                    key_path.display()
                );

                let authority = CertificateAuthority::generate(&name)?;
                config::write_key(&key_path, authority.keypair())?;
                config::write_certificate(&cert_path, authority.certificate())?;
                info!(key = %key_path.display(), cert = %cert_path.display(), "created CA");
            }

            CaCommand::IssueServer {
                identity,
                role,
                ca_key,
                ca_cert,
            } => {
                let paths = paths(role.into(), None, None, ca_cert)?;
                let authority = CertificateAuthority::load(&ca_key_path(ca_key)?, &paths.ca_cert)?;
                let keypair = config::load_or_generate_key(&paths.key)?;
                let certificate =
                    authority.issue_long_lived(&identity, &keypair, SERVER_CERT_LIFETIME)?;
                config::write_certificate(&paths.cert, &certificate)?;

                // Catch a key/cert mismatch now rather than at the first handshake.
                Credentials::load(&paths.key, &paths.cert)?;
                info!(
                    identity = %identity,
                    cert = %paths.cert.display(),
                    "issued server certificate"
                );
            }
        },
    }

    Ok(())
}

async fn wait_for_shutdown() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal, exiting gracefully"),
        Err(e) => warn!(error = %e, "failed to listen for shutdown signal"),
    }
}
