//! # Secure Channel
//!
//! A [`ChannelHandle`] is one mutually authenticated TLS connection carrying
//! length-delimited [`Message`] frames.
//!
//! ## Tasks
//!
//! Spawning a channel starts two tasks:
//!
//! - **reader**: decodes frames, converts each into the role's [`Operation`]
//!   enum and forwards it to the role loop. A malformed frame or an operation
//!   outside the role's set closes the channel.
//! - **writer**: drains a bounded queue of `Option<Message>`. `None` is the
//!   drain sentinel: everything queued before it is written, then the TLS
//!   stream is shut down.
//!
//! Both tasks watch the channel's [`CancellationToken`]. Closing the channel
//! cancels it, which also cancels every child token handed out through
//! [`ChannelHandle::child_token`] (rendezvous timers, cookie registrations).

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::crypto::{self, CryptoError};
use crate::identity::Identity;
use crate::messages::{self, MAX_FRAME_SIZE, Message, Violation};
use crate::protocols::Operation;

/// Timeout for TCP connect plus TLS handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a drained channel waits for the peer to close before dropping
/// the connection.
pub const DRAIN_LINGER: Duration = Duration::from_secs(10);

/// Outbound frames queued per channel before senders see back-pressure.
const OUTBOUND_QUEUE: usize = 64;

/// Inbound operations buffered between the reader task and the role loop.
const INBOUND_QUEUE: usize = 64;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// The channel's writer has stopped; nothing more can be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("channel closed")]
pub struct ChannelClosed;

/// Handle to a running secure channel. Cheap to clone.
#[derive(Clone)]
pub struct ChannelHandle {
    id: u64,
    peer_cert: Option<Arc<[u8]>>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    outbound: mpsc::Sender<Option<Message>>,
    token: CancellationToken,
}

impl ChannelHandle {
    /// Process-unique id, used to tell a superseded channel from its successor.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// DER certificate the peer presented, if any.
    pub fn peer_certificate(&self) -> Option<&[u8]> {
        self.peer_cert.as_deref()
    }

    /// Identity named by the peer certificate's CN.
    pub fn peer_identity(&self) -> Result<Identity, CryptoError> {
        let cert = self
            .peer_certificate()
            .ok_or(CryptoError::MalformedCertificate)?;
        crypto::certificate_identity(cert)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Queue a message, waiting for room in the outbound queue.
    pub async fn send(&self, message: Message) -> Result<(), ChannelClosed> {
        if self.token.is_cancelled() {
            return Err(ChannelClosed);
        }
        self.outbound
            .send(Some(message))
            .await
            .map_err(|_| ChannelClosed)
    }

    /// Queue a message without waiting. Fails if the queue is full or the
    /// channel has closed.
    pub fn try_send(&self, message: Message) -> Result<(), ChannelClosed> {
        if self.token.is_cancelled() {
            return Err(ChannelClosed);
        }
        self.outbound
            .try_send(Some(message))
            .map_err(|_| ChannelClosed)
    }

    /// Write everything queued so far, then shut the stream down.
    ///
    /// The channel counts as closed once the peer has closed its side as
    /// well (or after [`DRAIN_LINGER`]), so `finish` followed by
    /// [`closed`](Self::closed) waits for delivery.
    pub async fn finish(&self) {
        let _ = self.outbound.send(None).await;
    }

    /// Close immediately, discarding anything still queued.
    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the channel has closed, for whatever reason.
    pub async fn closed(&self) {
        self.token.cancelled().await
    }

    /// A token cancelled when this channel closes.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Connect to `host:port` and complete a TLS handshake with `config`.
pub async fn dial<R: Operation>(
    host: &str,
    port: u16,
    config: Arc<rustls::ClientConfig>,
) -> Result<(ChannelHandle, mpsc::Receiver<R>)> {
    let server_name = ServerName::try_from(host.to_string())
        .with_context(|| format!("invalid server name {host}"))?;
    let connector = TlsConnector::from(config);

    let (stream, local_addr, remote_addr) = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        let tcp = TcpStream::connect((host, port))
            .await
            .with_context(|| format!("failed to connect to {host}:{port}"))?;
        tcp.set_nodelay(true)?;
        let local_addr = tcp.local_addr()?;
        let remote_addr = tcp.peer_addr()?;
        let stream = connector
            .connect(server_name, tcp)
            .await
            .with_context(|| format!("TLS handshake with {host}:{port} failed"))?;
        anyhow::Ok((stream, local_addr, remote_addr))
    })
    .await
    .map_err(|_| anyhow::anyhow!("connecting to {host}:{port} timed out"))??;

    Ok(spawn(TlsStream::Client(stream), local_addr, remote_addr))
}

/// Complete the server side of a TLS handshake on an accepted socket.
pub async fn accept<R: Operation>(
    tcp: TcpStream,
    acceptor: &TlsAcceptor,
) -> Result<(ChannelHandle, mpsc::Receiver<R>)> {
    tcp.set_nodelay(true)?;
    // The peer may already be gone once the handshake completes.
    let local_addr = tcp.local_addr()?;
    let remote_addr = tcp.peer_addr()?;
    let stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(tcp))
        .await
        .context("TLS handshake timed out")?
        .context("TLS handshake failed")?;

    Ok(spawn(TlsStream::Server(stream), local_addr, remote_addr))
}

/// Start the reader and writer tasks for an established TLS stream.
///
/// Addresses are taken from the socket before the handshake and passed in.
pub fn spawn<R: Operation>(
    stream: TlsStream<TcpStream>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
) -> (ChannelHandle, mpsc::Receiver<R>) {
    let (_, session) = stream.get_ref();
    let peer_cert = session
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|cert| Arc::<[u8]>::from(cert.as_ref()));

    let (read_half, write_half) = tokio::io::split(stream);
    spawn_framed::<R, _, _>(read_half, write_half, peer_cert, local_addr, remote_addr)
}

fn length_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_SIZE)
        .big_endian()
        .new_codec()
}

fn spawn_framed<R, Rd, Wr>(
    read_half: Rd,
    write_half: Wr,
    peer_cert: Option<Arc<[u8]>>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
) -> (ChannelHandle, mpsc::Receiver<R>)
where
    R: Operation,
    Rd: AsyncRead + Unpin + Send + 'static,
    Wr: AsyncWrite + Unpin + Send + 'static,
{
    let id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
    let token = CancellationToken::new();
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);

    tokio::spawn(read_loop::<R, Rd>(
        FramedRead::new(read_half, length_codec()),
        inbound_tx,
        token.clone(),
        id,
        remote_addr,
    ));
    tokio::spawn(write_loop(
        FramedWrite::new(write_half, length_codec()),
        outbound_rx,
        token.clone(),
        id,
    ));

    let handle = ChannelHandle {
        id,
        peer_cert,
        local_addr,
        remote_addr,
        outbound: outbound_tx,
        token,
    };
    (handle, inbound_rx)
}

async fn read_loop<R, Rd>(
    mut frames: FramedRead<Rd, LengthDelimitedCodec>,
    inbound: mpsc::Sender<R>,
    token: CancellationToken,
    id: u64,
    remote: SocketAddr,
) where
    R: Operation,
    Rd: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            frame = frames.next() => frame,
        };

        let bytes = match frame {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                warn!(channel = id, remote = %remote, error = %e, "closing channel: bad frame");
                break;
            }
            None => {
                trace!(channel = id, remote = %remote, "peer closed channel");
                break;
            }
        };

        let operation = messages::decode(&bytes)
            .map_err(|e| Violation::Malformed(e.to_string()))
            .and_then(R::from_message);
        let operation = match operation {
            Ok(operation) => operation,
            Err(violation) => {
                warn!(channel = id, remote = %remote, %violation, "closing channel");
                break;
            }
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            sent = inbound.send(operation) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    token.cancel();
}

async fn write_loop<Wr>(
    mut frames: FramedWrite<Wr, LengthDelimitedCodec>,
    mut outbound: mpsc::Receiver<Option<Message>>,
    token: CancellationToken,
    id: u64,
) where
    Wr: AsyncWrite + Unpin,
{
    let mut drained = false;
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = outbound.recv() => next,
        };

        let Some(Some(message)) = next else {
            trace!(channel = id, "writer drained");
            drained = true;
            break;
        };

        let bytes = match messages::encode(&message) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(channel = id, op = message.op(), error = %e, "failed to encode message");
                break;
            }
        };
        if bytes.len() > MAX_FRAME_SIZE {
            warn!(
                channel = id,
                op = message.op(),
                size = bytes.len(),
                "dropping oversized message"
            );
            continue;
        }

        let written = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            written = frames.send(bytes) => written,
        };
        if let Err(e) = written {
            debug!(channel = id, error = %e, "write failed");
            break;
        }
    }

    // Flushes and sends close_notify before shutting the socket down.
    let _ = SinkExt::<Bytes>::close(&mut frames).await;

    // Keep the socket until the peer closes its side too: dropping it with
    // unread data resets the connection and the peer can lose what we sent.
    if drained {
        let _ = tokio::time::timeout(DRAIN_LINGER, token.cancelled()).await;
    }
    token.cancel();
}
