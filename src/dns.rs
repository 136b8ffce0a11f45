//! # Service Discovery
//!
//! Plume finds the servers for a domain through DNS SRV records:
//!
//! | Service | Record | Default port |
//! |---------|--------|--------------|
//! | Relay | `_plume._tcp.<domain>` | 42000 |
//! | Login | `_plume-login._tcp.<domain>` | 42001 |
//! | UDP echo | `_plume-udp._udp.<domain>` | 42002 |
//!
//! A record with target `.` or port 0 means "no service" and is treated like
//! a missing record. Relays never fall back when routing; clients fall back
//! to localhost via [`resolve_or_default`].

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use tracing::{debug, trace};

use crate::protocols::SrvResolver;

pub const RELAY_SERVICE: &str = "_plume._tcp";
pub const LOGIN_SERVICE: &str = "_plume-login._tcp";
pub const ECHO_SERVICE: &str = "_plume-udp._udp";

/// Host used when a client finds no SRV record.
pub const FALLBACK_HOST: &str = "127.0.0.1";

/// The SRV name for `service` in `domain`.
pub fn srv_name(service: &str, domain: &str) -> String {
    format!("{service}.{domain}")
}

/// Resolve a service for client-side discovery, falling back to
/// `127.0.0.1:<default_port>` when there is no usable record.
pub async fn resolve_or_default(
    resolver: &dyn SrvResolver,
    service: &str,
    domain: &str,
    default_port: u16,
) -> (String, u16) {
    let name = srv_name(service, domain);
    match resolver.resolve_srv(&name).await {
        Some(target) => target,
        None => {
            debug!(name = %name, port = default_port, "no SRV record, using localhost");
            (FALLBACK_HOST.to_string(), default_port)
        }
    }
}

/// SRV resolver backed by the system's DNS configuration.
#[derive(Clone)]
pub struct DnsResolver {
    inner: TokioAsyncResolver,
}

impl DnsResolver {
    /// Build a resolver from `/etc/resolv.conf` (or the platform equivalent),
    /// falling back to hickory's default upstreams.
    pub fn from_system() -> Result<Self> {
        let (config, options) =
            hickory_resolver::system_conf::read_system_conf().unwrap_or_default();
        Ok(Self::new(config, options))
    }

    pub fn new(config: ResolverConfig, options: ResolverOpts) -> Self {
        Self {
            inner: TokioAsyncResolver::tokio(config, options),
        }
    }
}

impl std::fmt::Debug for DnsResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DnsResolver")
    }
}

#[async_trait]
impl SrvResolver for DnsResolver {
    async fn resolve_srv(&self, name: &str) -> Option<(String, u16)> {
        let lookup = match self.inner.srv_lookup(name).await {
            Ok(lookup) => lookup,
            Err(e) => {
                debug!(name = %name, error = %e, "SRV lookup failed");
                return None;
            }
        };

        // Lowest priority wins; among equals, the heaviest weight.
        let best = lookup
            .iter()
            .min_by_key(|srv| (srv.priority(), std::cmp::Reverse(srv.weight())))?;

        if best.target().is_root() || best.port() == 0 {
            debug!(name = %name, "SRV record declares no service");
            return None;
        }

        let host = best.target().to_utf8();
        let host = host.trim_end_matches('.').to_string();
        trace!(name = %name, host = %host, port = best.port(), "resolved SRV record");
        Some((host, best.port()))
    }
}

/// In-memory SRV table, for tests and fixed deployments.
///
/// Counts every lookup so callers can assert that no resolution happened.
#[derive(Debug, Default)]
pub struct StaticResolver {
    records: Mutex<HashMap<String, (String, u16)>>,
    lookups: AtomicUsize,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a record. Name matching ignores ASCII case.
    pub fn insert(&self, name: impl Into<String>, host: impl Into<String>, port: u16) {
        let name = name.into().to_ascii_lowercase();
        if let Ok(mut records) = self.records.lock() {
            records.insert(name, (host.into(), port));
        }
    }

    pub fn with_record(self, name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        self.insert(name, host, port);
        self
    }

    /// Number of lookups performed so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SrvResolver for StaticResolver {
    async fn resolve_srv(&self, name: &str) -> Option<(String, u16)> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let record = self
            .records
            .lock()
            .ok()?
            .get(&name.to_ascii_lowercase())
            .cloned()?;
        let (host, port) = record;
        if host.is_empty() || host == "." || port == 0 {
            return None;
        }
        Some((host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_resolver_treats_dot_and_zero_port_as_missing() {
        let resolver = StaticResolver::new()
            .with_record("_plume._tcp.a.test", "relay.a.test", 42000)
            .with_record("_plume._tcp.b.test", ".", 42000)
            .with_record("_plume._tcp.c.test", "relay.c.test", 0);

        assert_eq!(
            resolver.resolve_srv("_plume._tcp.A.test").await,
            Some(("relay.a.test".to_string(), 42000))
        );
        assert_eq!(resolver.resolve_srv("_plume._tcp.b.test").await, None);
        assert_eq!(resolver.resolve_srv("_plume._tcp.c.test").await, None);
        assert_eq!(resolver.resolve_srv("_plume._tcp.d.test").await, None);
        assert_eq!(resolver.lookups(), 4);
    }

    #[tokio::test]
    async fn client_discovery_falls_back_to_localhost() {
        let resolver = StaticResolver::new().with_record(
            srv_name(ECHO_SERVICE, "a.test"),
            "echo.a.test",
            5000,
        );

        assert_eq!(
            resolve_or_default(&resolver, ECHO_SERVICE, "a.test", 42002).await,
            ("echo.a.test".to_string(), 5000)
        );
        assert_eq!(
            resolve_or_default(&resolver, ECHO_SERVICE, "elsewhere.test", 42002).await,
            (FALLBACK_HOST.to_string(), 42002)
        );
    }
}
