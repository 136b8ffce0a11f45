//! # Plume - Identity-Addressed Relay Routing
//!
//! Plume lets participants named like email addresses (`user@domain`) find
//! each other and exchange authenticated transport addresses, brokered by
//! per-domain relay servers and a short-lived certificate authority:
//!
//! - **Identity**: `local@domain` names, bound to Ed25519 keys by X.509
//!   certificates whose CN is the identity
//! - **Login**: a CA turns a self-signed CSR into a ten-minute certificate
//! - **Relay**: routes messages to connected identities, forwarding across
//!   domains via DNS SRV discovery with a bounded hop count
//! - **Identity exchange**: peers swap certificates through the relays, then
//!   send each other signed, sealed address assertions
//! - **Rendezvous**: a cookie-keyed UDP echo tells a client its external
//!   address
//!
//! ## Architecture
//!
//! Stateful components use the **Actor Pattern**: a cheap-to-clone handle
//! sends commands to a task that owns all mutable state and processes them
//! sequentially. Every connection is a [`transport::ChannelHandle`] over
//! mutual TLS with a reader and a writer task.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `identity` | Identity parsing, keypairs, credentials |
//! | `crypto` | TLS configuration, peer verification, signed and sealed assertions |
//! | `messages` | Wire records and per-role operation sets |
//! | `transport` | Secure channels: framing, reader/writer tasks |
//! | `protocols` | Traits at the seams (`Operation`, `SrvResolver`) |
//! | `dns` | SRV discovery |
//! | `ca` | Certificate authority, login server and client |
//! | `relay` | Relay server |
//! | `rendezvous` | UDP echo listener and probe |
//! | `client` | Identity exchange client |
//! | `config` | Ports, paths, environment overrides, settings |

pub mod ca;
pub mod client;
pub mod config;
pub mod crypto;
pub mod dns;
pub mod identity;
pub mod messages;
pub mod protocols;
pub mod relay;
pub mod rendezvous;
pub mod transport;

pub use ca::{CertificateAuthority, LoginError, LoginServer};
pub use client::{PeerEvent, PeerState, PlumeClient};
pub use config::{AddressMode, ClientConfig, KeyPaths, RelayConfig, Role};
pub use crypto::{AcceptAny, CryptoError, PeerVerifier, TrustStore};
pub use dns::{DnsResolver, StaticResolver};
pub use identity::{Credentials, Identity, IdentityError, Keypair};
pub use messages::{Message, RoutedMessage, Violation};
pub use protocols::{Operation, SrvResolver};
pub use relay::RelayServer;
pub use transport::ChannelHandle;
