//! Trait definitions at the seams of Plume's networking layer.
//!
//! | Seam | Trait | Implementations |
//! |------|-------|-----------------|
//! | Frame dispatch | [`Operation`] | per-role enums in [`crate::messages`] |
//! | Relay discovery | [`SrvResolver`] | `dns::DnsResolver`, `dns::StaticResolver` |
//!
//! Keeping these here lets the transport depend on role enums, and the relay
//! depend on discovery, without knowing their concrete types.

use async_trait::async_trait;

use crate::messages::{Message, Violation};

/// A closed set of operations one endpoint role accepts.
///
/// Conversion failure means the peer sent something outside the role's
/// protocol; the channel is closed.
pub trait Operation: Sized + Send + 'static {
    fn from_message(message: Message) -> Result<Self, Violation>;
}

/// DNS SRV lookups used to find relay, login and echo services.
#[async_trait]
pub trait SrvResolver: Send + Sync + 'static {
    /// Resolve `name` (e.g. `_plume._tcp.example.com`) to its best target.
    ///
    /// Returns `None` when there is no usable record: no answer, a `.`
    /// target, or port zero.
    async fn resolve_srv(&self, name: &str) -> Option<(String, u16)>;
}
