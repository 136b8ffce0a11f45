//! # Identity Exchange Client
//!
//! [`PlumeClient`] keeps one secure channel to its home relay and runs the
//! client side of the identity exchange for any number of peers.
//!
//! ## Per-peer states
//!
//! ```text
//! UNKNOWN_PEER --identify--> AWAITING_CERT --cert--> KNOWN_PEER
//!      KNOWN_PEER --udp(cookie)--> AWAITING_UDP_ADDR --udp(cookie, addr)--> READY
//!      KNOWN_PEER (local address mode) ----------------------------------> READY
//! ```
//!
//! On reaching `READY` the client signs `(own certificate, address)` and
//! sends it, sealed to the peer's certificate key, as a routed `connect`.
//! The peer verifies it against the sender certificate the relay delivered
//! and reports [`PeerEvent::Connected`].
//!
//! Certificates arriving through routing are checked with the configured
//! [`PeerVerifier`]. A `cert` nobody asked for is ignored.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use lru::LruCache;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::DropGuard;
use tracing::{debug, info, warn};

use crate::config::{AddressMode, ClientConfig, DEFAULT_ECHO_PORT, DEFAULT_RELAY_PORT};
use crate::crypto::{self, PeerVerifier};
use crate::dns::{self, ECHO_SERVICE, RELAY_SERVICE};
use crate::identity::{Credentials, Identity};
use crate::messages::{
    ClientInbound, Cookie, Message, OP_CERT, OP_CONNECT, OP_IDENTIFY, RoutedMessage, Violation,
};
use crate::protocols::SrvResolver;
use crate::rendezvous::UdpProbe;
use crate::transport::{self, ChannelHandle};

const CLIENT_COMMAND_CHANNEL_SIZE: usize = 64;
const EVENT_CHANNEL_SIZE: usize = 64;

/// What the identity exchange reports to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// We sent our signed address to `peer`.
    Announced { peer: Identity, addr: SocketAddr },
    /// `peer` proved its address to us.
    Connected { peer: Identity, addr: SocketAddr },
    /// The echo service never answered for `peer`.
    RendezvousFailed { peer: Identity },
}

/// Where the exchange with one peer stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    AwaitingCert,
    KnownPeer,
    AwaitingUdpAddr,
    Ready,
}

enum ClientCommand {
    Connect {
        peer: Identity,
    },
    State {
        peer: Identity,
        reply: oneshot::Sender<Option<PeerState>>,
    },
}

/// Handle to a connected client. Cheap to clone.
#[derive(Clone)]
pub struct PlumeClient {
    identity: Identity,
    channel: ChannelHandle,
    cmd_tx: mpsc::Sender<ClientCommand>,
}

impl std::fmt::Debug for PlumeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlumeClient")
            .field("identity", &self.identity)
            .field("channel", &self.channel)
            .finish()
    }
}

impl PlumeClient {
    /// Connect to the home relay and start the client loop.
    pub async fn connect(config: ClientConfig) -> Result<(Self, mpsc::Receiver<PeerEvent>)> {
        let identity = config.credentials.identity().clone();
        let (host, port) = match &config.relay {
            Some(relay) => relay.clone(),
            None => {
                dns::resolve_or_default(
                    config.resolver.as_ref(),
                    RELAY_SERVICE,
                    identity.domain(),
                    DEFAULT_RELAY_PORT,
                )
                .await
            }
        };

        let tls = crypto::client_config(Some(&config.credentials), config.trust.clone())?;
        let (channel, inbound) = transport::dial::<ClientInbound>(&host, port, tls)
            .await
            .with_context(|| format!("failed to reach relay {host}:{port}"))?;
        info!(identity = %identity, relay = %format!("{host}:{port}"), "connected to relay");

        let (cmd_tx, cmd_rx) = mpsc::channel(CLIENT_COMMAND_CHANNEL_SIZE);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (expired_tx, expired_rx) = mpsc::channel(CLIENT_COMMAND_CHANNEL_SIZE);

        let cache_size = NonZeroUsize::new(config.cert_cache_size).unwrap_or(NonZeroUsize::MIN);
        let actor = ClientActor {
            credentials: config.credentials,
            trust: config.trust,
            resolver: config.resolver,
            address_mode: config.address_mode,
            echo: config.echo,
            ack_timeout: config.rendezvous_ack_timeout,
            channel: channel.clone(),
            certs: LruCache::new(cache_size),
            peers: HashMap::new(),
            udp_addrs: HashMap::new(),
            rendezvous: HashMap::new(),
            events: event_tx,
            expired_tx,
        };
        tokio::spawn(actor.run(inbound, cmd_rx, expired_rx));

        Ok((
            Self {
                identity,
                channel,
                cmd_tx,
            },
            event_rx,
        ))
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Start (or resume) the identity exchange with `peer`.
    pub async fn connect_peer(&self, peer: &str) -> Result<()> {
        let peer = Identity::parse(peer).with_context(|| format!("invalid peer {peer:?}"))?;
        self.cmd_tx
            .send(ClientCommand::Connect { peer })
            .await
            .map_err(|_| anyhow::anyhow!("client has stopped"))
    }

    pub async fn peer_state(&self, peer: &Identity) -> Option<PeerState> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ClientCommand::State {
                peer: peer.clone(),
                reply: reply_tx,
            })
            .await
            .ok()?;
        reply_rx.await.ok().flatten()
    }

    /// The channel to the home relay.
    pub fn channel(&self) -> &ChannelHandle {
        &self.channel
    }

    pub fn close(&self) {
        self.channel.close();
    }

    pub async fn closed(&self) {
        self.channel.closed().await
    }
}

/// An outstanding rendezvous for one peer.
struct Rendezvous {
    peer: Identity,
    socket: Option<Arc<UdpSocket>>,
    probe: Option<UdpProbe>,
    /// Fires the expiry if the relay never acknowledges the cookie.
    ack_deadline: Option<DropGuard>,
}

struct ClientActor {
    credentials: Credentials,
    trust: Arc<dyn PeerVerifier>,
    resolver: Arc<dyn SrvResolver>,
    address_mode: AddressMode,
    echo: Option<SocketAddr>,
    ack_timeout: Duration,
    channel: ChannelHandle,
    /// Peer certificates, keyed by the identity their CN names.
    certs: LruCache<Identity, Vec<u8>>,
    peers: HashMap<Identity, PeerState>,
    /// Externally observed UDP address learned for each peer's exchange,
    /// together with the socket it belongs to.
    udp_addrs: HashMap<Identity, (SocketAddr, Arc<UdpSocket>)>,
    rendezvous: HashMap<Cookie, Rendezvous>,
    events: mpsc::Sender<PeerEvent>,
    expired_tx: mpsc::Sender<Cookie>,
}

impl ClientActor {
    async fn run(
        mut self,
        mut inbound: mpsc::Receiver<ClientInbound>,
        mut cmd_rx: mpsc::Receiver<ClientCommand>,
        mut expired_rx: mpsc::Receiver<Cookie>,
    ) {
        loop {
            let result = tokio::select! {
                op = inbound.recv() => match op {
                    Some(op) => self.handle_inbound(op).await,
                    None => break,
                },
                cmd = cmd_rx.recv() => match cmd {
                    Some(ClientCommand::Connect { peer }) => self.connect(peer).await,
                    Some(ClientCommand::State { peer, reply }) => {
                        let _ = reply.send(self.peers.get(&peer).copied());
                        Ok(())
                    }
                    None => break,
                },
                Some(cookie) = expired_rx.recv() => {
                    self.rendezvous_expired(cookie);
                    Ok(())
                }
            };

            if let Err(violation) = result {
                warn!(identity = %self.credentials.identity(), %violation, "closing relay channel");
                break;
            }
        }

        self.channel.close();
        // Dropping the rendezvous table cancels every outstanding probe.
        self.rendezvous.clear();
        debug!(identity = %self.credentials.identity(), "client loop stopped");
    }

    async fn send(&self, message: Message) -> Result<(), Violation> {
        self.channel
            .send(message)
            .await
            .map_err(|_| Violation::Unroutable("home relay".to_string()))
    }

    async fn route(&self, target: &Identity, op: &str, payload: Vec<u8>) -> Result<(), Violation> {
        let routed = RoutedMessage::new(
            self.credentials.certificate().to_vec(),
            target.as_str(),
            op,
            payload,
        );
        self.send(Message::Route(routed)).await
    }

    fn check_certificate(&self, cert: &[u8]) -> Result<Identity, Violation> {
        crypto::verify_routed_certificate(self.trust.as_ref(), cert)
            .map_err(|e| Violation::Untrusted(e.to_string()))
    }

    async fn connect(&mut self, peer: Identity) -> Result<(), Violation> {
        let Some(peer_cert) = self.certs.get(&peer).cloned() else {
            self.peers.insert(peer.clone(), PeerState::AwaitingCert);
            debug!(peer = %peer, "requesting peer certificate");
            return self.route(&peer, OP_IDENTIFY, Vec::new()).await;
        };

        let addr = match self.address_mode {
            AddressMode::Local(addr) => addr,
            AddressMode::Rendezvous => match self.udp_addrs.get(&peer) {
                Some((addr, _)) => *addr,
                None => return self.start_rendezvous(peer).await,
            },
        };

        let sealed = crypto::seal_address(&self.credentials, &peer_cert, addr)
            .map_err(|e| Violation::BadSignature(e.to_string()))?;
        self.route(&peer, OP_CONNECT, sealed).await?;
        self.peers.insert(peer.clone(), PeerState::Ready);
        info!(peer = %peer, addr = %addr, "announced address to peer");
        self.emit(PeerEvent::Announced { peer, addr });
        Ok(())
    }

    /// Report to the application without ever parking the loop on it.
    fn emit(&self, event: PeerEvent) {
        if let Err(e) = self.events.try_send(event) {
            warn!(identity = %self.credentials.identity(), error = %e, "dropping peer event");
        }
    }

    async fn start_rendezvous(&mut self, peer: Identity) -> Result<(), Violation> {
        if self.rendezvous.values().any(|r| r.peer == peer) {
            return Ok(());
        }
        let cookie = rand::random::<Cookie>();

        // A refused cookie gets no ack at all, so expire it on a deadline.
        let deadline = self.channel.child_token();
        let expired = self.expired_tx.clone();
        let ack_timeout = self.ack_timeout;
        let timer = deadline.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(ack_timeout) => {
                    let _ = expired.send(cookie).await;
                }
            }
        });

        self.rendezvous.insert(
            cookie,
            Rendezvous {
                peer: peer.clone(),
                socket: None,
                probe: None,
                ack_deadline: Some(deadline.drop_guard()),
            },
        );
        self.peers.insert(peer.clone(), PeerState::AwaitingUdpAddr);
        debug!(peer = %peer, cookie, "requesting rendezvous");
        self.send(Message::Udp { cookie }).await
    }

    async fn handle_inbound(&mut self, op: ClientInbound) -> Result<(), Violation> {
        match op {
            ClientInbound::Identify { sender_cert } => {
                let requester = self.check_certificate(&sender_cert)?;
                debug!(peer = %requester, "answering identify");
                self.certs.put(requester.clone(), sender_cert);
                self.route(&requester, OP_CERT, Vec::new()).await
            }
            ClientInbound::Cert { sender_cert } => {
                let peer = self.check_certificate(&sender_cert)?;
                if self.peers.get(&peer) != Some(&PeerState::AwaitingCert) {
                    debug!(peer = %peer, "ignoring unsolicited certificate");
                    return Ok(());
                }
                self.certs.put(peer.clone(), sender_cert);
                self.peers.insert(peer.clone(), PeerState::KnownPeer);
                self.connect(peer).await
            }
            ClientInbound::Connect {
                sender_cert,
                payload,
            } => {
                let peer = self.check_certificate(&sender_cert)?;
                let addr = crypto::open_address(self.credentials.keypair(), &sender_cert, &payload)
                    .map_err(|e| Violation::BadSignature(format!("{peer}: {e}")))?;
                info!(peer = %peer, addr = %addr, "peer proved its address");
                self.certs.put(peer.clone(), sender_cert);
                self.emit(PeerEvent::Connected { peer, addr });
                Ok(())
            }
            ClientInbound::AckUdp { cookie } => {
                self.start_probe(cookie).await;
                Ok(())
            }
            ClientInbound::UdpAddr { cookie, addr } => {
                let Some(rendezvous) = self.rendezvous.remove(&cookie) else {
                    debug!(cookie, "ignoring udp address for unknown cookie");
                    return Ok(());
                };
                if let Some(probe) = &rendezvous.probe {
                    probe.cancel();
                }
                let Some(socket) = rendezvous.socket else {
                    return Ok(());
                };
                debug!(peer = %rendezvous.peer, addr = %addr, "learned external udp address");
                self.udp_addrs
                    .insert(rendezvous.peer.clone(), (addr, socket));
                self.peers
                    .insert(rendezvous.peer.clone(), PeerState::KnownPeer);
                self.connect(rendezvous.peer).await
            }
        }
    }

    /// The relay accepted our cookie: open a socket and start probing.
    async fn start_probe(&mut self, cookie: Cookie) {
        let Some(pending) = self.rendezvous.get(&cookie) else {
            return;
        };
        if pending.probe.is_some() {
            return;
        }
        debug!(cookie, "relay acknowledged rendezvous cookie");

        let target = match self.echo_target().await {
            Ok(target) => target,
            Err(e) => {
                warn!(cookie, error = %e, "no echo service");
                self.rendezvous_expired(cookie);
                return;
            }
        };
        let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                warn!(cookie, error = %e, "failed to bind rendezvous socket");
                self.rendezvous_expired(cookie);
                return;
            }
        };

        let probe = UdpProbe::start(
            socket.clone(),
            target,
            cookie,
            self.channel.child_token(),
            self.expired_tx.clone(),
        );
        if let Some(pending) = self.rendezvous.get_mut(&cookie) {
            pending.socket = Some(socket);
            pending.probe = Some(probe);
            // From here the probe's own attempt limit decides expiry.
            pending.ack_deadline = None;
        }
        debug!(cookie, target = %target, "probing echo service");
    }

    /// Echo service of our own domain: the cookie lives at our home relay.
    async fn echo_target(&self) -> Result<SocketAddr> {
        if let Some(echo) = self.echo {
            return Ok(echo);
        }
        let (host, port) = dns::resolve_or_default(
            self.resolver.as_ref(),
            ECHO_SERVICE,
            self.credentials.identity().domain(),
            DEFAULT_ECHO_PORT,
        )
        .await;
        tokio::net::lookup_host((host.as_str(), port))
            .await?
            .find(|addr| addr.is_ipv4())
            .with_context(|| format!("{host} has no IPv4 address"))
    }

    fn rendezvous_expired(&mut self, cookie: Cookie) {
        let Some(rendezvous) = self.rendezvous.remove(&cookie) else {
            return;
        };
        warn!(peer = %rendezvous.peer, cookie, "rendezvous failed");
        self.peers.remove(&rendezvous.peer);
        self.emit(PeerEvent::RendezvousFailed {
            peer: rendezvous.peer,
        });
    }
}
