//! Forwarding Tree (spec §4.7): fans a single request out to a named set
//! of downstream nodes, re-framing a reduced copy of the message for each
//! child bucket, and merges per-child replies (or synthesized
//! `FORWARD_FAILED` markers) into one result list.
//!
//! Per spec §9's design note, children are not modeled as shared state:
//! each child exchange runs on its own scoped thread and reports its
//! result list down a bounded [`crossbeam_channel`], which this module
//! drains once every thread has finished.

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use tracing::warn;

use crate::auth::Authenticator;
use crate::config;
use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::forward::{self, Forward};
use crate::message::{Message, ReturnEntry};

/// Default port assumed for a bare hostname in a forwarding-tree hostlist
/// (no `original_source/` survived for this spec to confirm the real
/// constant; chosen as a stand-in node-agent port, documented in
/// DESIGN.md).
pub const DEFAULT_NODE_PORT: u16 = 6818;

fn resolve_host(name: &str) -> Result<Endpoint, Error> {
    let (host, port) = match name
        .rsplit_once(':')
        .and_then(|(h, p)| p.parse::<u16>().ok().map(|p| (h, p)))
    {
        Some((h, p)) => (h, p),
        None => (name, DEFAULT_NODE_PORT),
    };

    (host, port)
        .to_socket_addrs()
        .map_err(Error::ConnectionError)?
        .find_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(Endpoint::new(*v4.ip(), v4.port())),
            SocketAddr::V6(_) => None,
        })
        .ok_or_else(|| Error::ConnectionError(std::io::Error::other(format!("no IPv4 address for {name}"))))
}

/// The per-hop timeout: the descriptor's own timeout if it carries one,
/// otherwise the configured `message_timeout`, but never less than it
/// (spec §4.7 "Timeouts").
fn hop_timeout(forward: &Forward, configured: Duration) -> Duration {
    forward.timeout.unwrap_or(configured).max(configured)
}

/// Opens a connection to the first host in `bucket`, re-frames `req` with
/// a forwarding descriptor naming the rest of the bucket as its hostlist,
/// and collects that sub-tree's reply list. Every failure mode (connect,
/// send, receive, timeout) degrades to one [`ReturnEntry::forward_failed`]
/// per node in the bucket — spec §7's "never a silent drop".
fn dispatch_to_bucket<A: Authenticator>(req: &Message, auth: &A, bucket: &[&str], timeout: Duration) -> Vec<ReturnEntry> {
    let Some(&first) = bucket.first() else {
        return Vec::new();
    };

    let endpoint = match resolve_host(first) {
        Ok(e) => e,
        Err(e) => {
            warn!(node = first, error = %e, "could not resolve forwarding-tree child");
            return bucket.iter().map(|n| ReturnEntry::forward_failed(*n, &e)).collect();
        }
    };

    let child_forward = Forward::new(bucket[1..].join(","), req.forward.tree_width, Some(timeout));
    let mut child_msg = req.clone_for_forward(child_forward);

    let mut stream = match crate::conn::open(endpoint) {
        Ok(s) => s,
        Err(e) => {
            warn!(node = first, %endpoint, error = %e, "forwarding-tree child unreachable");
            return bucket.iter().map(|n| ReturnEntry::forward_failed(*n, &e)).collect();
        }
    };

    if let Err(e) = crate::engine::send(&mut stream, &mut child_msg, auth, 0, || {}) {
        warn!(node = first, error = %e, "forwarding-tree send failed");
        return bucket.iter().map(|n| ReturnEntry::forward_failed(*n, &e)).collect();
    }

    match crate::engine::receive_many(&mut stream, auth, 1, timeout) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(node = first, error = %e, "forwarding-tree child timed out or failed");
            bucket.iter().map(|n| ReturnEntry::forward_failed(*n, &e)).collect()
        }
    }
}

/// Fans `req` out across its `forward.hostlist`, splitting it into at most
/// `forward.tree_width` buckets via [`crate::forward::span`] and
/// dispatching one child connection per non-empty bucket concurrently
/// (spec §4.7).
///
/// Returns an empty list if `req.forward` names no hosts.
pub fn fan_out<A>(req: &Message, auth: &A, configured_timeout: Duration) -> Vec<ReturnEntry>
where
    A: Authenticator + Sync,
    A::Credential: Send,
{
    let nodes = req.forward.nodes();
    if nodes.is_empty() {
        return Vec::new();
    }

    let width = if req.forward.tree_width > 0 {
        req.forward.tree_width
    } else {
        config::try_current().map(|c| c.tree_width).unwrap_or(1)
    };
    let buckets = forward::partition(&nodes, width);
    let timeout = hop_timeout(&req.forward, configured_timeout);

    let (tx, rx) = crossbeam_channel::bounded::<Vec<ReturnEntry>>(buckets.len().max(1));
    std::thread::scope(|scope| {
        for bucket in buckets.iter().filter(|b| !b.is_empty()) {
            let tx = tx.clone();
            scope.spawn(move || {
                let entries = dispatch_to_bucket(req, auth, bucket, timeout);
                let _ = tx.send(entries);
            });
        }
    });
    drop(tx);

    rx.iter().flatten().collect()
}

/// Node-agent side of the tree: handles a request whose `forward.count >
/// 0` by running the local handler and fanning out to children
/// concurrently, then merging both into one ret-list (spec §4.7
/// "Receive-and-forward").
///
/// `send_ack`, when present, is invoked first — this is the "immediately
/// send a success acknowledgement for the composite transport envelope"
/// step, left to the caller since only it knows whether `req.message_type`
/// is the composite aggregator type (the core does not interpret message
/// types, spec §1).
pub fn handle_forwarding_request<A, H>(
    req: &Message,
    auth: &A,
    configured_timeout: Duration,
    send_ack: Option<impl FnOnce() -> Result<(), Error>>,
    local_handler: H,
) -> Result<Vec<ReturnEntry>, Error>
where
    A: Authenticator + Sync,
    A::Credential: Send,
    H: FnOnce() -> ReturnEntry + Send,
{
    if let Some(ack) = send_ack {
        ack()?;
    }

    let (local, children) = std::thread::scope(|scope| {
        let local_handle = scope.spawn(local_handler);
        let children = fan_out(req, auth, configured_timeout);
        let local = local_handle.join().unwrap_or_else(|_| ReturnEntry {
            node_name: "local".into(),
            message_type: crate::message::FORWARD_FAILED,
            error_code: crate::error::PROTOCOL_INCOMPLETE_PACKET,
            payload: Vec::new(),
        });
        (local, children)
    });

    let mut merged = Vec::with_capacity(children.len() + 1);
    merged.push(local);
    merged.extend(children);
    Ok(merged)
}
