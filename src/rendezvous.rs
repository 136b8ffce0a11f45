//! # UDP Rendezvous
//!
//! Lets a client behind NAT learn the address its UDP socket is seen from.
//!
//! ```text
//! client                      home relay                  echo listener
//!   | -- udp(cookie) (TLS) ---> |                               |
//!   | <-- ack_udp(cookie) ----- |                               |
//!   | -- [cookie] (UDP, every 500 ms) ------------------------> |
//!   |                           | <-- (cookie, observed addr) - |
//!   | <-- udp(cookie, addr) --- |                               |
//! ```
//!
//! The echo listener is stateless: it decodes a cookie from each datagram
//! and hands `(cookie, source address)` to the relay, which owns the cookie
//! table. Unknown cookies are dropped there.
//!
//! On the client side a [`UdpProbe`] retransmits the cookie until it is
//! cancelled (address learned, or the owning channel closed) or it runs out
//! of attempts.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::messages::Cookie;

/// Interval between probe datagrams.
pub const PROBE_INTERVAL: Duration = Duration::from_millis(500);

/// Probe datagrams sent before giving up (about 20 seconds).
pub const MAX_PROBE_ATTEMPTS: usize = 40;

/// Largest datagram the echo listener reads.
const MAX_DATAGRAM: usize = 512;

/// A cookie datagram as sent on the wire.
pub fn encode_cookie(cookie: Cookie) -> Vec<u8> {
    cookie.to_be_bytes().to_vec()
}

/// Decode a cookie datagram; anything but exactly eight bytes is rejected.
pub fn decode_cookie(datagram: &[u8]) -> Option<Cookie> {
    let bytes: [u8; 8] = datagram.try_into().ok()?;
    Some(Cookie::from_be_bytes(bytes))
}

/// Run the echo listener on `socket` until `token` is cancelled, reporting
/// every decodable cookie with its observed source address.
pub async fn serve_echo(
    socket: UdpSocket,
    observed: mpsc::Sender<(Cookie, SocketAddr)>,
    token: CancellationToken,
) {
    let mut buf = [0u8; MAX_DATAGRAM];
    loop {
        let received = tokio::select! {
            _ = token.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };
        let (len, from) = match received {
            Ok(received) => received,
            Err(e) => {
                // ICMP errors from earlier sends surface here on some platforms.
                trace!(error = %e, "echo recv failed");
                continue;
            }
        };

        let Some(cookie) = decode_cookie(&buf[..len]) else {
            trace!(from = %from, len, "ignoring malformed echo datagram");
            continue;
        };
        if observed.send((cookie, from)).await.is_err() {
            break;
        }
    }
    debug!("echo listener stopped");
}

/// Periodic retransmission of one cookie to the echo service.
#[derive(Debug)]
pub struct UdpProbe {
    cookie: Cookie,
    token: CancellationToken,
    attempts: Arc<AtomicUsize>,
}

impl UdpProbe {
    /// Start probing. `token` should be a child of the owning channel's
    /// token so the probe stops when the channel closes. When the attempts
    /// run out the cookie is sent on `expired`.
    pub fn start(
        socket: Arc<UdpSocket>,
        target: SocketAddr,
        cookie: Cookie,
        token: CancellationToken,
        expired: mpsc::Sender<Cookie>,
    ) -> Self {
        Self::start_with(
            socket,
            target,
            cookie,
            token,
            expired,
            PROBE_INTERVAL,
            MAX_PROBE_ATTEMPTS,
        )
    }

    pub fn start_with(
        socket: Arc<UdpSocket>,
        target: SocketAddr,
        cookie: Cookie,
        token: CancellationToken,
        expired: mpsc::Sender<Cookie>,
        interval: Duration,
        max_attempts: usize,
    ) -> Self {
        let attempts = Arc::new(AtomicUsize::new(0));
        tokio::spawn(probe_loop(
            socket,
            target,
            cookie,
            token.clone(),
            attempts.clone(),
            expired,
            interval,
            max_attempts,
        ));
        Self {
            cookie,
            token,
            attempts,
        }
    }

    pub fn cookie(&self) -> Cookie {
        self.cookie
    }

    /// Datagrams sent so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for UdpProbe {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[allow(clippy::too_many_arguments)]
async fn probe_loop(
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    cookie: Cookie,
    token: CancellationToken,
    attempts: Arc<AtomicUsize>,
    expired: mpsc::Sender<Cookie>,
    interval: Duration,
    max_attempts: usize,
) {
    let datagram = encode_cookie(cookie);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if attempts.load(Ordering::SeqCst) >= max_attempts {
            break;
        }
        if let Err(e) = socket.send_to(&datagram, target).await {
            debug!(target = %target, error = %e, "probe send failed");
        }
        attempts.fetch_add(1, Ordering::SeqCst);
    }

    debug!(cookie, target = %target, "rendezvous probe expired");
    let _ = expired.try_send(cookie);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_datagrams_are_exactly_eight_bytes() {
        let cookie = 0x0102_0304_0506_0708;
        assert_eq!(decode_cookie(&encode_cookie(cookie)), Some(cookie));
        assert_eq!(decode_cookie(&[1, 2, 3]), None);
        assert_eq!(decode_cookie(&[0; 9]), None);
    }

    #[tokio::test]
    async fn echo_reports_observed_source() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let token = CancellationToken::new();
        tokio::spawn(serve_echo(echo, tx, token.clone()));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"junk", echo_addr).await.unwrap();
        client.send_to(&encode_cookie(77), echo_addr).await.unwrap();

        let (cookie, from) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cookie, 77);
        assert_eq!(from, client.local_addr().unwrap());
        token.cancel();
    }

    #[tokio::test]
    async fn probe_expires_after_max_attempts() {
        let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let (tx, mut rx) = mpsc::channel(1);

        let probe = UdpProbe::start_with(
            socket,
            sink.local_addr().unwrap(),
            9,
            CancellationToken::new(),
            tx,
            Duration::from_millis(10),
            3,
        );

        let expired = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(expired, Some(9));
        assert_eq!(probe.attempts(), 3);

        let mut buf = [0u8; 16];
        let (len, _) = sink.recv_from(&mut buf).await.unwrap();
        assert_eq!(decode_cookie(&buf[..len]), Some(9));
    }

    #[tokio::test]
    async fn cancelled_parent_stops_probe() {
        let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let (tx, mut rx) = mpsc::channel(1);
        let parent = CancellationToken::new();

        let probe = UdpProbe::start_with(
            socket,
            sink.local_addr().unwrap(),
            5,
            parent.child_token(),
            tx,
            Duration::from_millis(10),
            usize::MAX,
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        parent.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let settled = probe.attempts();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(probe.attempts(), settled);
        assert!(probe.is_cancelled());
        // Cancellation is not expiry.
        assert!(rx.try_recv().is_err());
    }
}
