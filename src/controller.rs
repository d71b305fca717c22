//! Controller Client (spec §4.8): orchestrates send+receive against the
//! active controller, failing over to backup replicas during a standby
//! window and transparently rerouting to another cluster when instructed.
//!
//! The two response shapes this module inspects (`RC`/standby and
//! `REROUTE`) are control-plane messages this crate itself defines — see
//! DESIGN.md's note on why that's a deliberate, narrow exception to "the
//! core never interprets payloads" (spec §1).

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ReadBytesExt};
use tracing::{info, warn};

use crate::auth::Authenticator;
use crate::config;
use crate::endpoint::{ClusterRecord, ControllerSet, Endpoint, EndpointResolver};
use crate::error::{ControllerError, Error};
use crate::message::Message;

/// Message type naming a generic return-code reply, used to signal
/// `IN_STANDBY_MODE` (spec §4.8 step 4). Defined by this crate as part of
/// its control plane, not by an external payload codec.
pub const MSG_TYPE_RC: u16 = 0xFFF0;

/// Message type instructing the caller to resend against a different
/// cluster (spec §4.8 step 5, §3 "Cluster Record").
pub const MSG_TYPE_REROUTE: u16 = 0xFFF1;

/// The `RC` code meaning "ask again once the backup has taken over".
pub const RC_IN_STANDBY_MODE: u32 = 1;

/// `{ code: u32 }` — the entire `RC` payload this crate understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RcPayload {
    pub code: u32,
}

impl RcPayload {
    pub fn encode(&self) -> Vec<u8> {
        self.code.to_be_bytes().to_vec()
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        let mut cur = Cursor::new(bytes);
        Some(Self {
            code: cur.read_u32::<BigEndian>().ok()?,
        })
    }
}

/// `{ name_len: u32, name, ip: [u8;4], port: u16, protocol_version: u16 }`
/// — the `REROUTE` payload this crate understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReroutePayload {
    pub cluster: ClusterRecord,
}

impl ReroutePayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let name = self.cluster.name.as_bytes();
        buf.extend_from_slice(&(name.len() as u32).to_be_bytes());
        buf.extend_from_slice(name);
        buf.extend_from_slice(&self.cluster.endpoint.host.octets());
        buf.extend_from_slice(&self.cluster.endpoint.port.to_be_bytes());
        buf.extend_from_slice(&self.cluster.protocol_version.to_be_bytes());
        buf
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        let mut cur = Cursor::new(bytes);
        let name_len = cur.read_u32::<BigEndian>().ok()? as usize;
        if name_len > bytes.len() {
            return None;
        }
        let mut name_buf = vec![0u8; name_len];
        std::io::Read::read_exact(&mut cur, &mut name_buf).ok()?;
        let name = String::from_utf8(name_buf).ok()?;

        let mut ip = [0u8; 4];
        std::io::Read::read_exact(&mut cur, &mut ip).ok()?;
        let port = cur.read_u16::<BigEndian>().ok()?;
        let protocol_version = cur.read_u16::<BigEndian>().ok()?;

        Some(Self {
            cluster: ClusterRecord {
                name,
                endpoint: Endpoint::new(std::net::Ipv4Addr::from(ip), port),
                protocol_version,
            },
        })
    }
}

fn max_retry_period() -> Duration {
    config::try_current()
        .map(|c| c.msg_timeout)
        .unwrap_or(Duration::from_secs(10))
}

/// A reusable client against a controller set (spec §4.8).
///
/// `use_backup` is the "persistent across calls" hint spec §4.8 describes:
/// once a call has had to fail over to a backup, subsequent calls from the
/// same `ControllerClient` start their search there too, until a primary
/// success or a standby-retry resets it.
pub struct ControllerClient<A: Authenticator> {
    auth: A,
    use_backup: AtomicBool,
}

impl<A: Authenticator> std::fmt::Debug for ControllerClient<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerClient")
            .field("use_backup", &self.use_backup.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<A: Authenticator> ControllerClient<A>
where
    A::Credential: Send,
{
    pub fn new(auth: A) -> Self {
        Self {
            auth,
            use_backup: AtomicBool::new(false),
        }
    }

    /// Sends `req` to the controller and returns its response, handling
    /// primary/backup failover and cluster reroute internally (spec
    /// §4.8).
    pub fn send_recv(&self, req: &mut Message, cluster_override: Option<ClusterRecord>) -> Result<Message, ControllerError> {
        self.send_recv_inner(req, cluster_override)
            .map_err(Error::into_controller_error)
    }

    fn try_once(&self, endpoint: Endpoint, req: &mut Message, msg_timeout: Duration) -> Result<Message, Error> {
        let mut stream = crate::conn::open(endpoint)?;
        crate::engine::send(&mut stream, req, &self.auth, 0, || {})?;
        crate::engine::receive(&mut stream, &self.auth, msg_timeout)
    }

    fn send_recv_inner(&self, req: &mut Message, mut cluster_override: Option<ClusterRecord>) -> Result<Message, Error> {
        let start_time = Instant::now();
        let mut attempts = 0usize;

        'restart: loop {
            if cluster_override.is_some() {
                req.flags |= crate::header::GLOBAL_AUTH_KEY;
            }

            let cfg = config::current();
            let set = ControllerSet::new(cfg.controllers.clone(), cfg.vip);
            let resolver = EndpointResolver::new(set, cfg.controller_port_count.max(1));
            // `control_cnt` (VIP excluded) gates "is a backup even
            // configured"; `attempt_budget` (VIP included) is the modulo
            // base for walking every resolvable slot so the VIP's extra
            // slot doesn't shadow the last replica in the ordered list
            // (spec §3's "augmented by a VIP endpoint").
            let control_cnt = resolver.controllers().control_cnt().max(1);
            let attempt_budget = resolver.controllers().attempt_count().max(1);
            let deadline = Instant::now() + max_retry_period();

            let begin = if cluster_override.is_none() && self.use_backup.load(Ordering::Acquire) {
                1 % attempt_budget
            } else {
                0
            };

            let mut last_err = None;
            let mut response = None;
            let mut offset = 0usize;

            while Instant::now() < deadline {
                let idx = (begin + offset) % attempt_budget;
                offset += 1;

                let Some(endpoint) = resolver.resolve(idx, cluster_override.as_ref()) else {
                    continue;
                };

                attempts += 1;
                match self.try_once(endpoint, req, cfg.msg_timeout) {
                    Ok(resp) => {
                        self.use_backup.store(idx > 0, Ordering::Release);
                        if idx > 0 {
                            info!(%endpoint, idx, "controller failover: using backup replica");
                        }
                        response = Some(resp);
                        break;
                    }
                    Err(e) => {
                        warn!(%endpoint, error = %e, "controller attempt failed, advancing to next endpoint");
                        last_err = Some(e);
                        if offset % attempt_budget == 0 {
                            std::thread::sleep(Duration::from_millis(100));
                        }
                    }
                }
            }

            let resp = match response {
                Some(r) => r,
                None => return Err(last_err.unwrap_or(Error::ControllerUnreachable { attempts })),
            };

            if resp.message_type == MSG_TYPE_RC {
                if let Some(rc) = RcPayload::decode(&resp.payload) {
                    if rc.code == RC_IN_STANDBY_MODE
                        && control_cnt > 1
                        && start_time.elapsed() < cfg.slurmctld_timeout.mul_f64(1.5)
                    {
                        warn!("controller reports standby mode, retrying after half the standby window");
                        std::thread::sleep(cfg.slurmctld_timeout / 2);
                        self.use_backup.store(false, Ordering::Release);
                        continue 'restart;
                    }
                }
            }

            if resp.message_type == MSG_TYPE_REROUTE {
                if let Some(reroute) = ReroutePayload::decode(&resp.payload) {
                    info!(cluster = %reroute.cluster.name, "controller requested reroute");
                    cluster_override = Some(reroute.cluster);
                    continue 'restart;
                }
            }

            return Ok(resp);
        }
    }
}
