//! Endpoint Resolver (spec §4.4): turns a configuration snapshot plus an
//! optional cross-cluster override into a concrete, ordered list of
//! endpoints to try, and computes the per-attempt port jitter.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::process;
use std::time::{SystemTime, UNIX_EPOCH};

/// A host plus port, resolved or about to be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: Ipv4Addr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: Ipv4Addr, port: u16) -> Self {
        Self { host, port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<Endpoint> for std::net::SocketAddr {
    fn from(e: Endpoint) -> Self {
        std::net::SocketAddr::new(IpAddr::V4(e.host), e.port)
    }
}

/// An override describing a different cluster to talk to, carried in a
/// `REROUTE` response (spec §4.8 step 5) or supplied by the caller up
/// front for cross-cluster messaging (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterRecord {
    pub name: String,
    pub endpoint: Endpoint,
    pub protocol_version: u16,
}

/// The ordered set of controller replicas: index 0 is primary, the rest
/// are backups in failover order, plus an optional VIP that takes priority
/// over the ordered list when present (spec §3).
#[derive(Debug, Clone)]
pub struct ControllerSet {
    pub replicas: Vec<Endpoint>,
    pub vip: Option<Endpoint>,
}

impl ControllerSet {
    pub fn new(replicas: Vec<Endpoint>, vip: Option<Endpoint>) -> Self {
        Self { replicas, vip }
    }

    /// Number of addressable controller endpoints, not counting the VIP.
    pub fn control_cnt(&self) -> usize {
        self.replicas.len()
    }

    /// Total number of distinct attempt slots one full sweep of
    /// [`Self::endpoint_for_attempt`] covers: the VIP, when configured,
    /// occupies attempt index 0 ahead of the ordered replica list (spec §3
    /// "optionally augmented by a VIP endpoint"), so it needs its own slot
    /// in the budget rather than being squeezed into `replicas.len()`
    /// attempts — otherwise the last replica in the list is never reached.
    pub fn attempt_count(&self) -> usize {
        self.replicas.len() + usize::from(self.vip.is_some())
    }

    /// The endpoint a caller should try for a given failover attempt
    /// index. The VIP, when configured, is always tried first (index 0);
    /// subsequent indices walk the replica list starting from primary.
    pub fn endpoint_for_attempt(&self, attempt: usize) -> Option<Endpoint> {
        if let Some(vip) = self.vip {
            if attempt == 0 {
                return Some(vip);
            }
            return self.replicas.get(attempt - 1).copied();
        }
        self.replicas.get(attempt).copied()
    }
}

/// Resolves the endpoint(s) that should be tried for a request, honoring a
/// cross-cluster override when present (spec §4.4).
#[derive(Debug, Clone)]
pub struct EndpointResolver {
    controllers: ControllerSet,
    port_count: u16,
}

impl EndpointResolver {
    pub fn new(controllers: ControllerSet, port_count: u16) -> Self {
        Self {
            controllers,
            port_count: port_count.max(1),
        }
    }

    pub fn controllers(&self) -> &ControllerSet {
        &self.controllers
    }

    /// Resolve the endpoint for a given attempt, applying a cluster
    /// override when one is supplied. The override's endpoint always wins
    /// outright — there is no failover within a single cluster override.
    pub fn resolve(&self, attempt: usize, override_cluster: Option<&ClusterRecord>) -> Option<Endpoint> {
        if let Some(c) = override_cluster {
            return Some(c.endpoint);
        }
        self.controllers.endpoint_for_attempt(attempt)
    }

    /// Applies the port-jitter rule from spec §4.4: the effective port for
    /// an attempt is `base_port + ((now_seconds + pid) mod port_count)`.
    /// This spreads concurrent retrying clients across a contiguous port
    /// range without any coordination between them.
    pub fn jittered_port(&self, base_port: u16) -> u16 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let pid = process::id() as u64;
        let offset = (now.wrapping_add(pid)) % self.port_count as u64;
        base_port.wrapping_add(offset as u16)
    }
}
