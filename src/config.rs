//! The process-wide configuration snapshot (spec §9 "Design Notes" /
//! SPEC_FULL §D). Config *loading* is an external collaborator (spec §1);
//! this module only owns the snapshot's lifecycle once something else has
//! built one, plus the handful of first-access-cached values spec §5
//! describes ("guarded by a one-shot initializer... subsequent reads are
//! lock-free").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::RwLock;

use crate::endpoint::Endpoint;

/// `comm_params` bits relevant to this crate: whether listening sockets
/// bind to the local hostname's address rather than the any-address
/// (spec §6).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommParams {
    pub no_in_addr_any: bool,
    pub no_ctld_in_addr_any: bool,
}

impl CommParams {
    /// Parses a `CommmParams`-style comma-separated flag string, ignoring
    /// flags this crate doesn't recognize (the same shared-options-bag
    /// convention as `authinfo`, spec §4.3).
    pub fn parse(raw: &str) -> Self {
        let mut out = Self::default();
        for flag in raw.split(',').map(str::trim) {
            match flag {
                "NoInAddrAny" => out.no_in_addr_any = true,
                "NoCtldInAddrAny" => out.no_ctld_in_addr_any = true,
                _ => {}
            }
        }
        out
    }
}

/// The process-wide configuration snapshot (spec §6 "Configuration inputs
/// consumed"). Never loaded from a file by this crate; callers build one
/// from their own configuration source and `install` it.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    /// Primary + backup controller endpoints, index order (spec §3).
    pub controllers: Vec<Endpoint>,
    pub vip: Option<Endpoint>,
    pub controller_port_count: u16,
    /// `msg_timeout` (seconds).
    pub msg_timeout: Duration,
    /// The standby-window timeout (spec §4.8, §8 "Standby retry").
    pub slurmctld_timeout: Duration,
    pub tree_width: u16,
    /// Raw `authinfo` string, parsed on first access via [`auth_ttl`].
    pub authinfo: String,
    pub comm_params: CommParams,
    /// The default auth secret used when `GLOBAL_AUTH_KEY` is not set
    /// (spec §4.3).
    pub default_auth_secret: Vec<u8>,
}

impl ConfigSnapshot {
    /// A snapshot usable for tests and examples: loopback primary with no
    /// backups, generous timeouts, tree width 2.
    pub fn for_tests() -> Self {
        Self {
            controllers: vec![Endpoint::new(std::net::Ipv4Addr::LOCALHOST, 6817)],
            vip: None,
            controller_port_count: 1,
            msg_timeout: Duration::from_secs(2),
            slurmctld_timeout: Duration::from_secs(4),
            tree_width: 2,
            authinfo: String::new(),
            comm_params: CommParams::default(),
            default_auth_secret: b"test-secret".to_vec(),
        }
    }
}

static CONFIG: OnceLock<RwLock<Option<Arc<ConfigSnapshot>>>> = OnceLock::new();

fn slot() -> &'static RwLock<Option<Arc<ConfigSnapshot>>> {
    CONFIG.get_or_init(|| RwLock::new(None))
}

/// Installs (or atomically replaces) the process-wide configuration
/// snapshot. Mutating setters in the broader daemon call this after
/// building a new snapshot rather than mutating fields in place, so
/// concurrent readers never observe a torn config (spec §5).
pub fn install(snapshot: ConfigSnapshot) {
    *slot().write() = Some(Arc::new(snapshot));
}

/// Same as [`install`] — kept as a separate name because callers on the
/// controller-reconfiguration path read more naturally as "replace".
pub fn replace(snapshot: ConfigSnapshot) {
    install(snapshot);
}

/// Returns the current snapshot. Panics if [`install`] has never been
/// called; every public entry point that needs config is expected to run
/// after daemon startup has installed one.
pub fn current() -> Arc<ConfigSnapshot> {
    try_current().expect("cluster_rpc::config::install was never called")
}

/// Like [`current`], but returns `None` instead of panicking when no
/// snapshot has been installed yet.
pub fn try_current() -> Option<Arc<ConfigSnapshot>> {
    slot().read().clone()
}

static GLOBAL_AUTH_SECRET: OnceLock<Vec<u8>> = OnceLock::new();

/// The process-wide auth secret used when a message's `GLOBAL_AUTH_KEY`
/// flag is set (spec §4.3). Cached on first access from the
/// `CLUSTER_RPC_GLOBAL_AUTH_KEY` environment variable, exactly as spec §5
/// describes for "the global auth key".
pub fn global_auth_secret() -> &'static [u8] {
    GLOBAL_AUTH_SECRET
        .get_or_init(|| {
            std::env::var("CLUSTER_RPC_GLOBAL_AUTH_KEY")
                .unwrap_or_default()
                .into_bytes()
        })
        .as_slice()
}

static AUTH_TTL: OnceLock<Duration> = OnceLock::new();

/// The credential TTL parsed once from the installed snapshot's
/// `authinfo` string (spec §4.3, §8's TTL-parsing invariant).
pub fn auth_ttl() -> Duration {
    *AUTH_TTL.get_or_init(|| crate::auth::parse_authinfo(&current().authinfo).ttl)
}

static CONNECT_RETRY_TIMEOUT: OnceLock<Duration> = OnceLock::new();

/// The connect-retry timeout cached on first access (spec §5), derived
/// from the snapshot's `msg_timeout` unless a caller overrides it via
/// [`set_connect_retry_timeout_for_test`] before first access.
pub fn connect_retry_timeout() -> Duration {
    *CONNECT_RETRY_TIMEOUT.get_or_init(|| current().msg_timeout)
}

/// Test-only hook that pre-seeds the connect-retry timeout cache, since
/// [`OnceLock`] can't otherwise be reset within a test process.
#[cfg(test)]
pub fn set_connect_retry_timeout_for_test(d: Duration) {
    let _ = CONNECT_RETRY_TIMEOUT.set(d);
}

/// Tracks whether `NoCtldInAddrAny`/`NoInAddrAny`-style binding has
/// already been logged once per process, to avoid repeating the same
/// `debug!` on every `listen` call.
pub(crate) static LOGGED_BIND_MODE: AtomicBool = AtomicBool::new(false);

pub(crate) fn log_bind_mode_once(msg: impl FnOnce() -> String) {
    if !LOGGED_BIND_MODE.swap(true, Ordering::Relaxed) {
        tracing::debug!("{}", msg());
    }
}
