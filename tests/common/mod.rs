//! Fixtures shared by the integration tests: a test CA, relays on loopback
//! and raw channels that speak `Message` directly.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Once};
use std::time::Duration;

use plume::ca;
use plume::config::RelayConfig;
use plume::crypto;
use plume::messages::Message;
use plume::transport::{self, ChannelHandle};
use plume::{
    CertificateAuthority, Credentials, Identity, Keypair, RelayServer, SrvResolver, TrustStore,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(15);

/// How long to wait before concluding that nothing will arrive.
pub const QUIET_PERIOD: Duration = Duration::from_millis(300);

const CERT_LIFETIME: Duration = Duration::from_secs(3600);

static INIT: Once = Once::new();

/// Use RUST_LOG=debug or RUST_LOG=trace for verbose output.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::EnvFilter::from_default_env()
        } else {
            tracing_subscriber::EnvFilter::new("debug")
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

pub fn identity(s: &str) -> Identity {
    Identity::parse(s).expect("valid identity")
}

pub struct TestCa {
    pub authority: CertificateAuthority,
}

impl TestCa {
    pub fn new() -> Self {
        Self {
            authority: CertificateAuthority::generate("Plume Test CA").expect("CA"),
        }
    }

    pub fn trust(&self) -> Arc<TrustStore> {
        Arc::new(TrustStore::single(self.authority.certificate().to_vec()))
    }

    /// Credentials for `name` with a fresh key, valid for an hour.
    pub fn credentials(&self, name: &str) -> Credentials {
        let keypair = Keypair::generate();
        let certificate = self
            .authority
            .issue_long_lived(&identity(name), &keypair, CERT_LIFETIME)
            .expect("issue");
        Credentials::new(keypair, certificate).expect("credentials")
    }

    /// Credentials obtained the way a client logs in: CSR in, 10-minute
    /// certificate out.
    pub fn login_credentials(&self, name: &str) -> Credentials {
        let keypair = Keypair::generate();
        let csr = ca::certificate_request(&identity(name), &keypair).expect("csr");
        let certificate = self.authority.issue(&csr).expect("issue");
        Credentials::new(keypair, certificate).expect("credentials")
    }

    /// Relay for `domain` on loopback with an echo listener.
    pub async fn relay(&self, domain: &str, resolver: Arc<dyn SrvResolver>) -> RelayServer {
        let config = RelayConfig::new(
            self.credentials(&format!("relay@{domain}")),
            self.trust(),
            resolver,
        )
        .with_listen_addr(loopback())
        .with_echo_addr(Some(loopback()));
        RelayServer::bind(config).await.expect("relay bind")
    }

    /// A channel to `relay` authenticated as `credentials`, receiving every
    /// record unfiltered.
    pub async fn raw_channel(
        &self,
        relay: &RelayServer,
        credentials: &Credentials,
    ) -> (ChannelHandle, mpsc::Receiver<Message>) {
        let config = crypto::client_config(Some(credentials), self.trust()).expect("tls config");
        transport::dial::<Message>("127.0.0.1", relay.local_addr().port(), config)
            .await
            .expect("dial relay")
    }
}

/// Wait until `relay` reports `who` as connected.
pub async fn wait_connected(relay: &RelayServer, who: &Identity) {
    timeout(TEST_TIMEOUT, async {
        while !relay.is_connected(who).await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("peer never registered");
}

/// Register a cookie and wait for the relay's acknowledgement. Receiving
/// the ack also proves the channel has been registered.
pub async fn register_cookie(
    channel: &ChannelHandle,
    inbound: &mut mpsc::Receiver<Message>,
    cookie: u64,
) {
    channel.send(Message::Udp { cookie }).await.expect("send udp");
    let ack = timeout(TEST_TIMEOUT, inbound.recv())
        .await
        .expect("ack timed out");
    assert_eq!(ack, Some(Message::AckUdp { cookie }));
}

pub async fn expect_closed(channel: &ChannelHandle) {
    timeout(TEST_TIMEOUT, channel.closed())
        .await
        .expect("channel should have been closed");
}

pub async fn expect_silence(inbound: &mut mpsc::Receiver<Message>) {
    match timeout(QUIET_PERIOD, inbound.recv()).await {
        Err(_) | Ok(None) => {}
        Ok(Some(message)) => panic!("unexpected message: {message:?}"),
    }
}
