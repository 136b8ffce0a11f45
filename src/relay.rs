//! Relay Server with Actor-based Architecture
//!
//! A relay serves one domain. Clients of that domain keep a secure channel
//! open to it; the relay routes messages addressed by [`Identity`] to them,
//! or forwards to the relay of another domain found through DNS SRV.
//!
//! # Architecture
//!
//! - `RelayServer`: the public handle (cheap to clone, sends commands to the actor)
//! - `RelayActor`: owns the connection table and the rendezvous cookie table,
//!   processes commands sequentially
//! - one task per channel runs the relay role loop (`serve_channel`)
//!
//! The actor never awaits a peer: deliveries use a non-blocking enqueue and
//! a full outbound queue drops the message.
//!
//! # Routing
//!
//! For `route(sender_cert, target, op, payload)`:
//!
//! 1. `target` must be a valid identity, else the requester is closed
//!    (no DNS lookup happens)
//! 2. a live local channel for `target` receives `op(sender_cert, payload)`
//! 3. an unconnected target in the relay's own domain is unroutable
//! 4. otherwise `_plume._tcp.<domain>` is resolved and the message is
//!    forwarded over a new channel to that relay with one hop less
//!
//! Any failure closes the requesting channel.
//!
//! # Duplicate identities
//!
//! The last handshake wins. A superseded channel stays open but stops
//! receiving routed messages, and its close does not evict its successor.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::RelayConfig;
use crate::crypto::{self, ClientAuth};
use crate::dns::{self, RELAY_SERVICE};
use crate::identity::Identity;
use crate::messages::{Cookie, Message, RelayRequest, RoutedMessage, Violation};
use crate::protocols::SrvResolver;
use crate::rendezvous;
use crate::transport::{self, ChannelHandle};

// ============================================================================
// Constants
// ============================================================================

/// Command channel capacity for the relay actor.
const RELAY_COMMAND_CHANNEL_SIZE: usize = 256;

/// Outstanding rendezvous cookies one channel may hold.
pub const MAX_COOKIES_PER_CHANNEL: usize = 16;

/// Outstanding rendezvous cookies across the whole relay.
pub const MAX_COOKIES: usize = 100_000;

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

/// Result of handing a routed message to the actor for local delivery.
enum LocalDelivery {
    Delivered,
    /// No live channel for the target; ownership goes back to the router.
    NotConnected(RoutedMessage),
}

enum RelayCommand {
    Register {
        identity: Identity,
        channel: ChannelHandle,
    },
    Disconnected {
        identity: Identity,
        channel_id: u64,
    },
    Deliver {
        target: Identity,
        routed: RoutedMessage,
        reply: oneshot::Sender<LocalDelivery>,
    },
    RegisterCookie {
        cookie: Cookie,
        channel: ChannelHandle,
        reply: oneshot::Sender<bool>,
    },
    ConnectionCount {
        reply: oneshot::Sender<usize>,
    },
    CookieCount {
        reply: oneshot::Sender<usize>,
    },
    IsConnected {
        identity: Identity,
        reply: oneshot::Sender<bool>,
    },
    Quit,
}

// ============================================================================
// RelayServer Handle (public API - cheap to clone)
// ============================================================================

/// Handle to a running relay. Cheap to clone.
#[derive(Clone)]
pub struct RelayServer {
    cmd_tx: mpsc::Sender<RelayCommand>,
    domain: String,
    local_addr: SocketAddr,
    echo_addr: Option<SocketAddr>,
    token: CancellationToken,
}

impl std::fmt::Debug for RelayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayServer")
            .field("domain", &self.domain)
            .field("local_addr", &self.local_addr)
            .field("echo_addr", &self.echo_addr)
            .finish()
    }
}

/// Per-relay state shared by every channel task.
struct RelayContext {
    domain: String,
    cmd_tx: mpsc::Sender<RelayCommand>,
    resolver: Arc<dyn SrvResolver>,
    outbound: Arc<rustls::ClientConfig>,
}

impl RelayServer {
    /// Bind the TLS listener (and the UDP echo listener if configured) and
    /// start serving.
    pub async fn bind(config: RelayConfig) -> Result<Self> {
        let server_config = crypto::server_config(
            &config.credentials,
            config.trust.clone(),
            ClientAuth::Required,
        )?;
        let outbound = crypto::client_config(Some(&config.credentials), config.trust.clone())?;

        let listener = TcpListener::bind(config.listen_addr)
            .await
            .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;
        let local_addr = listener.local_addr()?;

        let token = CancellationToken::new();
        let (cmd_tx, cmd_rx) = mpsc::channel(RELAY_COMMAND_CHANNEL_SIZE);
        let (observed_tx, observed_rx) = mpsc::channel(RELAY_COMMAND_CHANNEL_SIZE);

        let echo_addr = match config.echo_addr {
            Some(addr) => {
                let socket = UdpSocket::bind(addr)
                    .await
                    .with_context(|| format!("failed to bind echo listener on {addr}"))?;
                let echo_addr = socket.local_addr()?;
                tokio::spawn(rendezvous::serve_echo(socket, observed_tx, token.child_token()));
                Some(echo_addr)
            }
            None => None,
        };

        tokio::spawn(RelayActor::new().run(cmd_rx, observed_rx));

        let ctx = Arc::new(RelayContext {
            domain: config.domain.clone(),
            cmd_tx: cmd_tx.clone(),
            resolver: config.resolver.clone(),
            outbound,
        });
        tokio::spawn(accept_loop(
            listener,
            TlsAcceptor::from(server_config),
            ctx,
            token.clone(),
        ));

        info!(
            domain = %config.domain,
            addr = %local_addr,
            echo = ?echo_addr,
            identity = %config.credentials.identity(),
            "relay listening"
        );

        Ok(Self {
            cmd_tx,
            domain: config.domain,
            local_addr,
            echo_addr,
            token,
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn echo_addr(&self) -> Option<SocketAddr> {
        self.echo_addr
    }

    /// Number of identities currently routable here.
    pub async fn connection_count(&self) -> usize {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(RelayCommand::ConnectionCount { reply: reply_tx })
            .await
            .is_err()
        {
            return 0;
        }
        reply_rx.await.unwrap_or(0)
    }

    /// Number of outstanding rendezvous cookies.
    pub async fn cookie_count(&self) -> usize {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(RelayCommand::CookieCount { reply: reply_tx })
            .await
            .is_err()
        {
            return 0;
        }
        reply_rx.await.unwrap_or(0)
    }

    pub async fn is_connected(&self, identity: &Identity) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(RelayCommand::IsConnected {
                identity: identity.clone(),
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    /// Stop accepting, close every channel and stop the actor.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let _ = self.cmd_tx.send(RelayCommand::Quit).await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    ctx: Arc<RelayContext>,
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
                warn!(error = %e, "relay accept failed");
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let ctx = ctx.clone();
        let token = token.child_token();
        tokio::spawn(async move {
            match transport::accept::<RelayRequest>(tcp, &acceptor).await {
                Ok((channel, inbound)) => serve_channel(ctx, channel, inbound, token).await,
                Err(e) => debug!(remote = %remote, error = %e, "relay handshake failed"),
            }
        });
    }
    debug!(domain = %ctx.domain, "relay accept loop stopped");
}

/// Relay role loop for one authenticated channel.
async fn serve_channel(
    ctx: Arc<RelayContext>,
    channel: ChannelHandle,
    mut inbound: mpsc::Receiver<RelayRequest>,
    token: CancellationToken,
) {
    let remote = channel.remote_addr();
    let identity = match channel.peer_identity() {
        Ok(identity) => identity,
        Err(e) => {
            warn!(
                remote = %remote,
                error = %e,
                "closing channel: peer certificate names no identity"
            );
            channel.close();
            return;
        }
    };

    if ctx
        .cmd_tx
        .send(RelayCommand::Register {
            identity: identity.clone(),
            channel: channel.clone(),
        })
        .await
        .is_err()
    {
        channel.close();
        return;
    }
    info!(peer = %identity, remote = %remote, "peer connected");

    loop {
        let request = tokio::select! {
            _ = token.cancelled() => break,
            request = inbound.recv() => request,
        };
        let Some(request) = request else {
            break;
        };

        let result = match request {
            RelayRequest::Route(routed) => ctx.route(routed).await,
            RelayRequest::Udp { cookie } => ctx.register_cookie(cookie, &channel).await,
        };
        if let Err(violation) = result {
            warn!(peer = %identity, remote = %remote, %violation, "closing channel");
            break;
        }
    }

    channel.close();
    let _ = ctx
        .cmd_tx
        .send(RelayCommand::Disconnected {
            identity: identity.clone(),
            channel_id: channel.id(),
        })
        .await;
    debug!(peer = %identity, remote = %remote, "peer disconnected");
}

impl RelayContext {
    async fn route(&self, mut routed: RoutedMessage) -> Result<(), Violation> {
        let target = Identity::parse(&routed.target)
            .map_err(|_| Violation::InvalidIdentity(routed.target.clone()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(RelayCommand::Deliver {
                target: target.clone(),
                routed,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Violation::Unroutable(target.to_string()))?;
        routed = match reply_rx.await {
            Ok(LocalDelivery::Delivered) => {
                trace!(target = %target, "delivered locally");
                return Ok(());
            }
            Ok(LocalDelivery::NotConnected(routed)) => routed,
            Err(_) => return Err(Violation::Unroutable(target.to_string())),
        };

        if target.in_domain(&self.domain) {
            return Err(Violation::Unroutable(target.to_string()));
        }
        if routed.hops == 0 {
            return Err(Violation::HopsExhausted(target.to_string()));
        }

        let name = dns::srv_name(RELAY_SERVICE, target.domain());
        let Some((host, port)) = self.resolver.resolve_srv(&name).await else {
            return Err(Violation::Unroutable(format!("{target}: no record for {name}")));
        };

        routed.hops -= 1;
        self.forward(&host, port, routed)
            .await
            .map_err(|e| Violation::Unroutable(format!("{target} via {host}:{port}: {e:#}")))?;
        debug!(
            target = %target,
            next = %format!("{host}:{port}"),
            "forwarded to remote relay"
        );
        Ok(())
    }

    /// Open a channel to another relay, send one routed message and close.
    async fn forward(&self, host: &str, port: u16, routed: RoutedMessage) -> Result<()> {
        let (channel, _inbound) =
            transport::dial::<RelayRequest>(host, port, self.outbound.clone()).await?;
        channel
            .send(Message::Route(routed))
            .await
            .context("relay channel closed before forwarding")?;
        channel.finish().await;
        // Closed once the remote relay has read the record and hung up.
        channel.closed().await;
        Ok(())
    }

    async fn register_cookie(
        &self,
        cookie: Cookie,
        channel: &ChannelHandle,
    ) -> Result<(), Violation> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = self
            .cmd_tx
            .send(RelayCommand::RegisterCookie {
                cookie,
                channel: channel.clone(),
                reply: reply_tx,
            })
            .await;
        if sent.is_err() || !reply_rx.await.unwrap_or(false) {
            debug!(cookie, "rendezvous cookie refused");
            return Ok(());
        }

        channel
            .send(Message::AckUdp { cookie })
            .await
            .map_err(|_| Violation::Unroutable("requester".to_string()))
    }
}

// ============================================================================
// Actor (owns all mutable state)
// ============================================================================

struct CookieOwner {
    channel: ChannelHandle,
}

struct RelayActor {
    /// Identity → live channel. At most one entry per identity.
    connections: HashMap<Identity, ChannelHandle>,
    /// Rendezvous cookie → channel that registered it.
    cookies: HashMap<Cookie, CookieOwner>,
    /// Outstanding cookies per channel id.
    cookies_per_channel: HashMap<u64, usize>,
}

impl RelayActor {
    fn new() -> Self {
        Self {
            connections: HashMap::new(),
            cookies: HashMap::new(),
            cookies_per_channel: HashMap::new(),
        }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<RelayCommand>,
        mut observed_rx: mpsc::Receiver<(Cookie, SocketAddr)>,
    ) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(RelayCommand::Register { identity, channel }) => {
                            self.register(identity, channel);
                        }
                        Some(RelayCommand::Disconnected { identity, channel_id }) => {
                            self.disconnected(&identity, channel_id);
                        }
                        Some(RelayCommand::Deliver { target, routed, reply }) => {
                            let _ = reply.send(self.deliver(&target, routed));
                        }
                        Some(RelayCommand::RegisterCookie { cookie, channel, reply }) => {
                            let _ = reply.send(self.register_cookie(cookie, channel));
                        }
                        Some(RelayCommand::ConnectionCount { reply }) => {
                            let _ = reply.send(self.connections.len());
                        }
                        Some(RelayCommand::CookieCount { reply }) => {
                            let _ = reply.send(self.cookies.len());
                        }
                        Some(RelayCommand::IsConnected { identity, reply }) => {
                            let connected = self
                                .connections
                                .get(&identity)
                                .is_some_and(|channel| !channel.is_closed());
                            let _ = reply.send(connected);
                        }
                        Some(RelayCommand::Quit) | None => {
                            debug!("relay actor shutting down");
                            break;
                        }
                    }
                }
                Some((cookie, observed)) = observed_rx.recv() => {
                    self.resolve_cookie(cookie, observed);
                }
            }
        }

        for channel in self.connections.values() {
            channel.close();
        }
    }

    fn register(&mut self, identity: Identity, channel: ChannelHandle) {
        if let Some(previous) = self.connections.insert(identity.clone(), channel) {
            debug!(
                peer = %identity,
                superseded = previous.id(),
                "newer login supersedes existing channel"
            );
        }
    }

    fn disconnected(&mut self, identity: &Identity, channel_id: u64) {
        if self
            .connections
            .get(identity)
            .is_some_and(|current| current.id() == channel_id)
        {
            self.connections.remove(identity);
        }

        if self.cookies_per_channel.remove(&channel_id).is_some() {
            self.cookies
                .retain(|_, owner| owner.channel.id() != channel_id);
        }
    }

    fn deliver(&mut self, target: &Identity, routed: RoutedMessage) -> LocalDelivery {
        let Some(channel) = self.connections.get(target) else {
            return LocalDelivery::NotConnected(routed);
        };
        if channel.is_closed() {
            return LocalDelivery::NotConnected(routed);
        }

        let op = routed.op.clone();
        if channel.try_send(Message::Deliver(routed.into_delivery())).is_err() {
            warn!(peer = %target, op = %op, "dropping delivery: peer queue full");
        }
        LocalDelivery::Delivered
    }

    fn register_cookie(&mut self, cookie: Cookie, channel: ChannelHandle) -> bool {
        if self.cookies.contains_key(&cookie) || self.cookies.len() >= MAX_COOKIES {
            return false;
        }
        let count = self.cookies_per_channel.entry(channel.id()).or_insert(0);
        if *count >= MAX_COOKIES_PER_CHANNEL {
            return false;
        }
        *count += 1;
        self.cookies.insert(cookie, CookieOwner { channel });
        true
    }

    /// Report the observed address to the cookie's owner, once.
    fn resolve_cookie(&mut self, cookie: Cookie, observed: SocketAddr) {
        let Some(owner) = self.cookies.remove(&cookie) else {
            trace!(cookie, from = %observed, "dropping unknown cookie");
            return;
        };
        let channel_id = owner.channel.id();
        if let Some(count) = self.cookies_per_channel.get_mut(&channel_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.cookies_per_channel.remove(&channel_id);
            }
        }

        if owner
            .channel
            .try_send(Message::UdpAddr { cookie, addr: observed })
            .is_err()
        {
            debug!(cookie, "rendezvous owner went away");
        } else {
            debug!(cookie, observed = %observed, "resolved rendezvous cookie");
        }
    }
}
