//! Message Engine (spec §4.6): the high-level send/receive pair that ties
//! the Frame Codec, Header Model, and Auth Adapter together into a single
//! framed exchange.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::auth::Authenticator;
use crate::config;
use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::forward::Forward;
use crate::header::{self, Header};
use crate::message::{Message, ReturnEntry};

/// If more than this much time has passed between creating a credential
/// and actually sending it, recreate it so a long `wait_preconditions`
/// rendezvous can't hand a stale (potentially near-TTL-expiry) credential
/// to the peer (spec §4.6 step 4).
const CREDENTIAL_REFRESH_AGE: Duration = Duration::from_secs(60);

/// Delay inserted before returning an auth failure, to rate-limit
/// brute-force credential guessing (spec §4.6 step 4, §5 "Backpressure").
const AUTH_FAILURE_DELAY: Duration = Duration::from_millis(10);

fn secret_for_flags(flags: u16) -> Vec<u8> {
    if flags & header::GLOBAL_AUTH_KEY != 0 {
        config::global_auth_secret().to_vec()
    } else {
        config::try_current()
            .map(|c| c.default_auth_secret.clone())
            .unwrap_or_default()
    }
}

fn endpoint_from_sockaddr(addr: std::net::SocketAddr) -> Option<Endpoint> {
    match addr {
        std::net::SocketAddr::V4(v4) => Some(Endpoint::new(*v4.ip(), v4.port())),
        std::net::SocketAddr::V6(_) => None,
    }
}

/// Sends `msg` on `stream`, signed with the credential `auth` produces for
/// `auth_index` (spec §4.6 "Send").
///
/// `wait_preconditions` is the forwarding tree's per-hop rendezvous (spec
/// §4.6 step 3); pass a no-op closure (`|| {}`) for a plain request/response
/// exchange with no forwarding involved.
pub fn send<A: Authenticator>(
    stream: &mut TcpStream,
    msg: &mut Message,
    auth: &A,
    auth_index: u32,
    wait_preconditions: impl FnOnce(),
) -> Result<(), Error> {
    let secret = secret_for_flags(msg.flags);
    let mut cred = auth.create(auth_index, &secret)?;
    let created_at = Instant::now();

    if msg.forward.is_unset() {
        let tree_width = config::try_current().map(|c| c.tree_width).unwrap_or(1);
        msg.forward = Forward::new("", tree_width, None);
    }

    wait_preconditions();

    if created_at.elapsed() > CREDENTIAL_REFRESH_AGE {
        auth.destroy(cred);
        cred = auth.create(auth_index, &secret)?;
    }

    let mut header = Header::init_from_message(
        msg.protocol_version,
        msg.message_type,
        msg.flags,
        msg.forward.clone(),
        msg.orig_address.map(|e| std::net::SocketAddrV4::new(e.host, e.port)),
    );
    header.return_count = msg.ret_list.len() as u16;
    header.return_list = msg
        .ret_list
        .iter()
        .map(|e| crate::header::ReturnListEntry {
            node_name: e.node_name.clone(),
            message_type: e.message_type,
            error_code: e.error_code,
            payload: e.payload.clone(),
        })
        .collect();

    let mut cred_buf = Vec::new();
    auth.pack(&cred, &mut cred_buf, msg.protocol_version)?;
    msg.auth_credential = cred_buf.clone();

    let framed = crate::frame::encode(&header, &cred_buf, &msg.payload);
    let result = write_all_logged(stream, &framed);
    auth.destroy(cred);
    result
}

fn write_all_logged(stream: &mut TcpStream, buf: &[u8]) -> Result<(), Error> {
    stream.write_all(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::NotConnected || e.kind() == io::ErrorKind::BrokenPipe {
            warn!("peer disappeared mid-send");
            Error::PeerDisappeared
        } else {
            warn!(peer = ?stream.peer_addr().ok(), error = %e, "send failed");
            Error::SendError(e)
        }
    })
}

fn read_framed(stream: &mut TcpStream, timeout: Duration) -> Result<Vec<u8>, Error> {
    if timeout < Duration::from_millis(10) || timeout > Duration::from_secs(3600) {
        warn!(?timeout, "unusual receive timeout");
    }
    stream.set_read_timeout(Some(timeout)).map_err(Error::ReceiveError)?;

    let mut len_buf = [0u8; 4];
    read_exact_classified(stream, &mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;

    let mut buf = vec![0u8; len];
    read_exact_classified(stream, &mut buf)?;
    Ok(buf)
}

fn read_exact_classified(stream: &mut TcpStream, buf: &mut [u8]) -> Result<(), Error> {
    stream.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::NotConnected | io::ErrorKind::ConnectionReset | io::ErrorKind::UnexpectedEof => {
            Error::PeerDisappeared
        }
        _ => Error::ReceiveError(e),
    })
}

/// Reads one frame off `stream` within `timeout`, validates its protocol
/// version (extracting the peer uid for diagnostics on mismatch, spec
/// §4.2), and rejects `return_count > 0` unconditionally — that shape only
/// ever belongs to [`receive_many`]'s aggregated path (spec §3's
/// invariant). `allow_forward` gates whether `forward.count > 0` is
/// tolerated here: false for the response-only path ([`receive`]), true for
/// the request path a node agent reads off of ([`receive_request`]).
fn decode_and_check<A: Authenticator>(
    stream: &mut TcpStream,
    auth: &A,
    timeout: Duration,
    allow_forward: bool,
) -> Result<crate::frame::Frame, Error> {
    let buf = read_framed(stream, timeout)?;
    let frame = crate::frame::decode(&buf)?;

    if let Err(e) = frame.header.check_version() {
        let peer_uid = auth
            .unpack(&frame.credential, frame.header.version)
            .ok()
            .and_then(|c| auth.uid(&c));
        warn!(peer = ?stream.peer_addr().ok(), uid = ?peer_uid, "protocol version mismatch");
        return Err(match e {
            Error::VersionError { got, supported, .. } => Error::VersionError {
                got,
                supported,
                peer_uid,
            },
            other => other,
        });
    }

    if frame.header.return_count > 0 {
        warn!("rejecting return_count > 0 on this receive path");
        return Err(protocol_violation_as_incomplete());
    }
    if !allow_forward && frame.header.forward.count > 0 {
        warn!("rejecting forward.count > 0 on the single-reply receive path");
        return Err(protocol_violation_as_incomplete());
    }

    Ok(frame)
}

/// Unpacks and verifies `frame`'s credential, choosing the secret per its
/// flags (spec §4.6 "Receive" steps 2-4). Rate-limits either failure with a
/// 10 ms sleep before returning (spec §5 "Backpressure").
fn unpack_and_verify<A: Authenticator>(auth: &A, frame: &crate::frame::Frame) -> Result<(), Error> {
    let secret = secret_for_flags(frame.header.flags);
    let cred = auth.unpack(&frame.credential, frame.header.version).map_err(|e| {
        std::thread::sleep(AUTH_FAILURE_DELAY);
        e
    })?;
    auth.verify(&cred, &secret).map_err(|e| {
        std::thread::sleep(AUTH_FAILURE_DELAY);
        e
    })?;
    Ok(())
}

/// Builds the caller-facing [`Message`] from a decoded, authenticated
/// `frame`. `conn` is a clone of `stream`'s fd so a server-side handler can
/// send its response back through `msg.conn` without a separate lookup
/// (spec §3's `conn_fd`); cloning the fd is best-effort and never fails the
/// receive itself.
fn message_from_frame(stream: &TcpStream, frame: crate::frame::Frame) -> Message {
    Message {
        protocol_version: frame.header.version,
        message_type: frame.header.message_type,
        flags: frame.header.flags,
        address: stream.peer_addr().ok().and_then(endpoint_from_sockaddr),
        orig_address: frame
            .header
            .origin_address
            .map(|a| Endpoint::new(*a.ip(), a.port())),
        forward: frame.header.forward,
        ret_list: Vec::new(),
        auth_credential: frame.credential,
        payload: frame.payload,
        conn: stream.try_clone().ok(),
    }
}

/// Reads exactly one response frame from `stream` within `timeout` (spec
/// §4.6 "Receive"). Rejects both `return_count > 0` and `forward.count >
/// 0` on this path — those belong to [`receive_request`] and
/// [`receive_many`] respectively (spec §3's invariant).
pub fn receive<A: Authenticator>(stream: &mut TcpStream, auth: &A, timeout: Duration) -> Result<Message, Error> {
    let frame = decode_and_check(stream, auth, timeout, false)?;
    unpack_and_verify(auth, &frame)?;
    Ok(message_from_frame(stream, frame))
}

/// Reads exactly one inbound *request* frame from `stream` within
/// `timeout`. Unlike [`receive`], this tolerates `forward.count > 0` (spec
/// §3: "`forward.count > 0` on a request is valid ... when the receiver is
/// expected to fan out"), since a node agent's request path is exactly
/// where the Forwarding Tree's descriptor shows up. Still rejects
/// `return_count > 0` — a request never carries an aggregated reply list.
pub fn receive_request<A: Authenticator>(stream: &mut TcpStream, auth: &A, timeout: Duration) -> Result<Message, Error> {
    let frame = decode_and_check(stream, auth, timeout, true)?;
    unpack_and_verify(auth, &frame)?;
    Ok(message_from_frame(stream, frame))
}

/// Per-level timeout budget for an aggregated receive across `steps` tree
/// hops (spec §4.6): `(total - msg_timeout * (steps - 1)) / steps`.
fn per_level_timeout(steps: usize, total: Duration) -> Duration {
    if steps == 0 {
        return total;
    }
    let msg_timeout = config::try_current()
        .map(|c| c.msg_timeout)
        .unwrap_or(Duration::ZERO);
    let reserved = msg_timeout.saturating_mul(steps.saturating_sub(1) as u32);
    total.checked_sub(reserved).unwrap_or(Duration::ZERO) / steps as u32
}

/// Reads one frame and accepts `return_count > 0`, splitting the wire
/// `return_list` into per-node [`ReturnEntry`] values (spec §4.6
/// "Aggregated receive"). A non-aggregated reply is returned as a
/// single-entry list, so callers always deal with a list.
pub fn receive_many<A: Authenticator>(
    stream: &mut TcpStream,
    auth: &A,
    steps: usize,
    timeout: Duration,
) -> Result<Vec<ReturnEntry>, Error> {
    let budget = per_level_timeout(steps, timeout);
    let buf = read_framed(stream, budget)?;
    let frame = crate::frame::decode(&buf)?;

    if let Err(e) = frame.header.check_version() {
        let peer_uid = auth
            .unpack(&frame.credential, frame.header.version)
            .ok()
            .and_then(|c| auth.uid(&c));
        warn!(peer = ?stream.peer_addr().ok(), uid = ?peer_uid, "protocol version mismatch");
        return Err(match e {
            Error::VersionError { got, supported, .. } => Error::VersionError {
                got,
                supported,
                peer_uid,
            },
            other => other,
        });
    }

    let secret = secret_for_flags(frame.header.flags);
    let cred = auth.unpack(&frame.credential, frame.header.version).map_err(|e| {
        std::thread::sleep(AUTH_FAILURE_DELAY);
        e
    })?;
    auth.verify(&cred, &secret).map_err(|e| {
        std::thread::sleep(AUTH_FAILURE_DELAY);
        e
    })?;

    if frame.header.return_count == 0 {
        let node_name = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        return Ok(vec![ReturnEntry {
            node_name,
            message_type: frame.header.message_type,
            error_code: 0,
            payload: frame.payload,
        }]);
    }

    Ok(frame
        .header
        .return_list
        .into_iter()
        .map(|e| ReturnEntry {
            node_name: e.node_name,
            message_type: e.message_type,
            error_code: e.error_code,
            payload: e.payload,
        })
        .collect())
}

fn protocol_violation_as_incomplete() -> Error {
    Error::IncompletePacket {
        buffer_len: 0,
        expected: 0,
    }
}
