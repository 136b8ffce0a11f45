//! # Wire Protocol Messages
//!
//! Every frame on a Plume channel carries one bincode-encoded [`Message`]: an
//! operation together with its arguments. Frames are length-delimited (u32
//! big-endian prefix) and decoded with size limits.
//!
//! ## Roles
//!
//! Each endpoint accepts only a closed set of operations. The reader task
//! converts a decoded [`Message`] into the role's enum through
//! [`Operation`]; anything outside that set is a [`Violation`] and closes the
//! channel.
//!
//! | Role | Enum | Accepted |
//! |------|------|----------|
//! | Login server | [`LoginRequest`] | `login` |
//! | Login client | [`LoginReply`] | `issued` |
//! | Relay server | [`RelayRequest`] | `route`, `udp` |
//! | Client | [`ClientInbound`] | delivered `identify` / `cert` / `connect`, `ack_udp`, `udp` |
//!
//! ## Routed Operations
//!
//! A `route` names an application operation by string. The relay never
//! interprets it; the target receives it as a [`Delivery`] carrying the
//! sender's certificate and the payload exactly as sent.

use std::net::SocketAddr;

use bincode::Options;
use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::protocols::Operation;

/// Maximum size of a single frame (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Maximum buffer size for deserialization.
pub const MAX_DESERIALIZE_SIZE: u64 = MAX_FRAME_SIZE as u64;

/// Hop budget attached to freshly created routed messages.
pub const MAX_ROUTE_HOPS: u8 = 8;

/// Routed operation asking the target for its certificate.
pub const OP_IDENTIFY: &str = "identify";
/// Routed operation answering `identify` with the sender's certificate.
pub const OP_CERT: &str = "cert";
/// Routed operation carrying a sealed, signed transport address.
pub const OP_CONNECT: &str = "connect";

/// A rendezvous cookie: random 64-bit token identifying one UDP probe.
pub type Cookie = u64;

/// Returns bincode options with size limits enforced.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn encode(message: &Message) -> Result<Bytes, bincode::Error> {
    bincode::serialize(message).map(Bytes::from)
}

pub fn decode(frame: &[u8]) -> Result<Message, bincode::Error> {
    deserialize_bounded(frame)
}

/// A message travelling towards `target`, one relay hop at a time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutedMessage {
    /// DER certificate of the originating client.
    pub sender_cert: Vec<u8>,
    /// Destination identity. Validated by the relay, not by the codec.
    pub target: String,
    pub op: String,
    pub payload: Vec<u8>,
    /// Remaining inter-relay forwards.
    pub hops: u8,
}

impl RoutedMessage {
    pub fn new(
        sender_cert: Vec<u8>,
        target: impl Into<String>,
        op: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            sender_cert,
            target: target.into(),
            op: op.into(),
            payload,
            hops: MAX_ROUTE_HOPS,
        }
    }

    /// What the target receives: the routed operation with its sender.
    pub fn into_delivery(self) -> Delivery {
        Delivery {
            op: self.op,
            sender_cert: self.sender_cert,
            payload: self.payload,
        }
    }
}

/// A routed operation as delivered to its target.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub op: String,
    pub sender_cert: Vec<u8>,
    pub payload: Vec<u8>,
}

/// Every record that can appear on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Certificate signing request (DER PKCS#10).
    Login { csr: Vec<u8> },
    /// Certificate issued in reply to `Login`.
    Issued { certificate: Vec<u8> },
    Route(RoutedMessage),
    /// Register a rendezvous cookie with the home relay.
    Udp { cookie: Cookie },
    AckUdp { cookie: Cookie },
    /// The externally observed UDP address for a cookie.
    UdpAddr { cookie: Cookie, addr: SocketAddr },
    Deliver(Delivery),
}

impl Message {
    /// Operation name, for logging and violation reports.
    pub fn op(&self) -> &str {
        match self {
            Message::Login { .. } => "login",
            Message::Issued { .. } => "issued",
            Message::Route(_) => "route",
            Message::Udp { .. } | Message::UdpAddr { .. } => "udp",
            Message::AckUdp { .. } => "ack_udp",
            Message::Deliver(delivery) => &delivery.op,
        }
    }
}

/// Protocol violations. Each one closes the offending channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("operation {0:?} is not legal here")]
    IllegalOperation(String),
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("invalid identity {0:?}")]
    InvalidIdentity(String),
    #[error("peer certificate rejected: {0}")]
    Untrusted(String),
    #[error("unroutable target {0}")]
    Unroutable(String),
    #[error("hop budget exhausted for {0}")]
    HopsExhausted(String),
    #[error("signature check failed: {0}")]
    BadSignature(String),
}

// ============================================================================
// Per-role operation sets
// ============================================================================

/// Operations accepted by the login server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoginRequest {
    Login { csr: Vec<u8> },
}

impl Operation for LoginRequest {
    fn from_message(message: Message) -> Result<Self, Violation> {
        match message {
            Message::Login { csr } => Ok(LoginRequest::Login { csr }),
            other => Err(Violation::IllegalOperation(other.op().to_string())),
        }
    }
}

/// Operations accepted by the login client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoginReply {
    Issued { certificate: Vec<u8> },
}

impl Operation for LoginReply {
    fn from_message(message: Message) -> Result<Self, Violation> {
        match message {
            Message::Issued { certificate } => Ok(LoginReply::Issued { certificate }),
            other => Err(Violation::IllegalOperation(other.op().to_string())),
        }
    }
}

/// Operations accepted by a relay server from clients and other relays.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayRequest {
    Route(RoutedMessage),
    Udp { cookie: Cookie },
}

impl Operation for RelayRequest {
    fn from_message(message: Message) -> Result<Self, Violation> {
        match message {
            Message::Route(routed) => Ok(RelayRequest::Route(routed)),
            Message::Udp { cookie } => Ok(RelayRequest::Udp { cookie }),
            other => Err(Violation::IllegalOperation(other.op().to_string())),
        }
    }
}

/// Operations accepted by a client from its home relay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientInbound {
    Identify { sender_cert: Vec<u8> },
    Cert { sender_cert: Vec<u8> },
    Connect { sender_cert: Vec<u8>, payload: Vec<u8> },
    AckUdp { cookie: Cookie },
    UdpAddr { cookie: Cookie, addr: SocketAddr },
}

impl Operation for ClientInbound {
    fn from_message(message: Message) -> Result<Self, Violation> {
        match message {
            Message::Deliver(Delivery {
                op,
                sender_cert,
                payload,
            }) => match op.as_str() {
                OP_IDENTIFY => Ok(ClientInbound::Identify { sender_cert }),
                OP_CERT => Ok(ClientInbound::Cert { sender_cert }),
                OP_CONNECT => Ok(ClientInbound::Connect {
                    sender_cert,
                    payload,
                }),
                other => Err(Violation::IllegalOperation(other.to_string())),
            },
            Message::AckUdp { cookie } => Ok(ClientInbound::AckUdp { cookie }),
            Message::UdpAddr { cookie, addr } => Ok(ClientInbound::UdpAddr { cookie, addr }),
            other => Err(Violation::IllegalOperation(other.op().to_string())),
        }
    }
}

/// Raw access to every record, for tooling and tests.
impl Operation for Message {
    fn from_message(message: Message) -> Result<Self, Violation> {
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_role_rejects_client_operations() {
        let err = RelayRequest::from_message(Message::Login { csr: vec![1] }).unwrap_err();
        assert_eq!(err, Violation::IllegalOperation("login".into()));

        let err = RelayRequest::from_message(Message::AckUdp { cookie: 3 }).unwrap_err();
        assert_eq!(err, Violation::IllegalOperation("ack_udp".into()));

        let routed = RoutedMessage::new(vec![1, 2], "bob@b.test", "ping", vec![9]);
        assert_eq!(
            RelayRequest::from_message(Message::Route(routed.clone())).unwrap(),
            RelayRequest::Route(routed)
        );
    }

    #[test]
    fn client_role_dispatches_delivered_ops() {
        let deliver = |op: &str| {
            Message::Deliver(Delivery {
                op: op.into(),
                sender_cert: vec![7],
                payload: vec![8],
            })
        };

        assert_eq!(
            ClientInbound::from_message(deliver("identify")).unwrap(),
            ClientInbound::Identify { sender_cert: vec![7] }
        );
        assert_eq!(
            ClientInbound::from_message(deliver("connect")).unwrap(),
            ClientInbound::Connect {
                sender_cert: vec![7],
                payload: vec![8]
            }
        );
        assert_eq!(
            ClientInbound::from_message(deliver("rm -rf")).unwrap_err(),
            Violation::IllegalOperation("rm -rf".into())
        );
        assert!(ClientInbound::from_message(Message::Udp { cookie: 1 }).is_err());
    }

    #[test]
    fn login_roles_are_one_operation_each() {
        assert!(LoginRequest::from_message(Message::Login { csr: vec![] }).is_ok());
        assert!(LoginRequest::from_message(Message::Issued { certificate: vec![] }).is_err());
        assert!(LoginReply::from_message(Message::Issued { certificate: vec![] }).is_ok());
        assert!(LoginReply::from_message(Message::Login { csr: vec![] }).is_err());
    }

    #[test]
    fn routed_message_starts_with_full_hop_budget() {
        let routed = RoutedMessage::new(vec![], "a@b.test", "ping", vec![]);
        assert_eq!(routed.hops, MAX_ROUTE_HOPS);

        let delivery = RoutedMessage::new(vec![1], "a@b.test", "ping", vec![2]).into_delivery();
        assert_eq!(delivery.op, "ping");
        assert_eq!(delivery.sender_cert, vec![1]);
        assert_eq!(delivery.payload, vec![2]);
    }

    #[test]
    fn decode_rejects_garbage_and_trailing_bytes() {
        assert!(decode(&[0xff, 0xff, 0xff, 0xff, 0x01]).is_err());

        let mut frame = encode(&Message::AckUdp { cookie: 42 }).unwrap().to_vec();
        assert_eq!(decode(&frame).unwrap(), Message::AckUdp { cookie: 42 });
        frame.push(0);
        assert!(decode(&frame).is_err());
    }

    #[test]
    fn decode_bounds_allocation() {
        // A Login whose length prefix claims far more than the frame limit.
        let mut frame = 0u32.to_le_bytes().to_vec();
        frame.extend_from_slice(&(u64::MAX / 2).to_le_bytes());
        assert!(decode(&frame).is_err());
    }
}
