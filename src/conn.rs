//! Connection Manager (spec §4.5): opens outbound TCP connections with
//! bounded retry, binds listening sockets within a port range, and
//! resolves a socket's peer address back to an [`Endpoint`].

use std::net::{SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::ops::RangeInclusive;
use std::process;
use std::thread;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

use crate::config;
use crate::endpoint::Endpoint;
use crate::error::Error;

/// Backlog used for every listening socket this crate binds.
const LISTEN_BACKLOG: i32 = 128;

/// The fallback port range `listen` retries across when an ephemeral
/// (`port = 0`) bind comes back `AddrInUse` (spec §4.5).
const EPHEMERAL_FALLBACK_RANGE: RangeInclusive<u16> = 10001..=65535;

/// Opens a single blocking TCP connection to `endpoint`. Sockets created
/// by `std::net` are already close-on-exec on Unix, satisfying spec
/// §4.5's "marked close-on-exec" without extra `fcntl` calls.
pub fn open(endpoint: Endpoint) -> Result<TcpStream, Error> {
    debug!(peer = %endpoint, "connecting");
    let stream = TcpStream::connect(SocketAddr::from(endpoint)).map_err(Error::ConnectionError)?;
    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// Opens a connection to `endpoint`, retrying up to `attempts` times with
/// `backoff` between tries (spec's overview: "opens a TCP connection...
/// with bounded retry").
pub fn open_with_retry(endpoint: Endpoint, attempts: usize, backoff: Duration) -> Result<TcpStream, Error> {
    let attempts = attempts.max(1);
    let mut last_err = None;
    for attempt in 0..attempts {
        match open(endpoint) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                warn!(peer = %endpoint, attempt, error = %e, "connect attempt failed");
                last_err = Some(e);
                if attempt + 1 < attempts {
                    thread::sleep(backoff);
                }
            }
        }
    }
    Err(last_err.expect("attempts.max(1) guarantees at least one iteration"))
}

/// Binds a listening socket on `port`. When `port == 0` and the OS-chosen
/// ephemeral port collides (`AddrInUse`), falls back to scanning the full
/// `[10001, 65535]` range via [`listen_range`] (spec §4.5).
pub fn listen(port: u16) -> Result<(TcpListener, u16), Error> {
    match bind_one(SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, port)) {
        Ok(listener) => {
            let bound_port = listener.local_addr().map_err(Error::Io)?.port();
            Ok((listener, bound_port))
        }
        Err(e) if port == 0 && e.kind() == std::io::ErrorKind::AddrInUse => {
            warn!("ephemeral bind collided, falling back to full port range scan");
            listen_range(EPHEMERAL_FALLBACK_RANGE)
        }
        Err(e) => Err(Error::Io(e)),
    }
}

/// Binds a listening socket somewhere within `range`, starting from a
/// pseudo-random offset seeded by the process id and scanning linearly
/// with wrap-around (spec §4.5). Returns the listener and the port it
/// bound to, or [`Error::PortRangeExhausted`] if every candidate refused.
pub fn listen_range(range: RangeInclusive<u16>) -> Result<(TcpListener, u16), Error> {
    let (min, max) = (*range.start(), *range.end());
    let span = (max - min) as u32 + 1;
    let start_offset = process::id() % span;

    for i in 0..span {
        let port = min + ((start_offset + i) % span) as u16;
        debug!(port, "trying bind candidate");
        match bind_one(SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, port)) {
            Ok(listener) => return Ok((listener, port)),
            Err(_) => continue,
        }
    }

    Err(Error::PortRangeExhausted(min, max))
}

fn bind_one(addr: SocketAddrV4) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

/// Resolves `comm_params` into the address a listening socket should bind
/// to: the any-address, unless the configured flag says to bind the local
/// hostname's address instead (spec §6).
pub fn listen_address(local_hostname: std::net::Ipv4Addr, is_controller: bool) -> std::net::Ipv4Addr {
    let cfg = config::try_current();
    let restrict = cfg
        .map(|c| {
            if is_controller {
                c.comm_params.no_ctld_in_addr_any
            } else {
                c.comm_params.no_in_addr_any
            }
        })
        .unwrap_or(false);

    if restrict {
        config::log_bind_mode_once(|| format!("binding to {local_hostname} per comm_params"));
        local_hostname
    } else {
        std::net::Ipv4Addr::UNSPECIFIED
    }
}

/// The remote endpoint of an established connection (spec §4.5).
pub fn peer_address(stream: &TcpStream) -> Result<Endpoint, Error> {
    match stream.peer_addr().map_err(Error::Io)? {
        SocketAddr::V4(v4) => Ok(Endpoint::new(*v4.ip(), v4.port())),
        SocketAddr::V6(_) => Err(Error::ConnectionError(std::io::Error::other(
            "peer address is IPv6, this crate only models IPv4 endpoints",
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn listen_port_zero_picks_an_ephemeral_port() {
        let (listener, port) = listen(0).unwrap();
        assert_eq!(listener.local_addr().unwrap().port(), port);
        assert!(port > 0);
    }

    #[test]
    fn open_connects_to_a_listening_socket() {
        let (listener, port) = listen(0).unwrap();
        let accept_thread = thread::spawn(move || listener.accept().unwrap());

        let endpoint = Endpoint::new(std::net::Ipv4Addr::LOCALHOST, port);
        let client = open(endpoint).unwrap();

        let (server_side, _) = accept_thread.join().unwrap();
        assert_eq!(
            peer_address(&client).unwrap().port,
            server_side.local_addr().unwrap().port()
        );
    }

    #[test]
    fn listen_range_exhaustion_returns_error() {
        // Occupy all three candidate ports, then verify the range is
        // reported exhausted (spec §8 scenario 4).
        let held: Vec<_> = (20100..=20102).map(bind_and_hold).collect();
        let result = listen_range(20100..=20102);
        assert!(matches!(result, Err(Error::PortRangeExhausted(20100, 20102))));
        drop(held);
    }

    #[test]
    fn listen_range_finds_the_one_free_port() {
        let _a = bind_and_hold(20200);
        let _b = bind_and_hold(20202);
        let (listener, port) = listen_range(20200..=20202).unwrap();
        assert_eq!(port, 20201);
        drop(listener);
    }

    fn bind_and_hold(port: u16) -> TcpListener {
        TcpListener::bind(SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, port))
            .unwrap_or_else(|_| panic!("port {port} already in use by test setup"))
    }

    #[test]
    fn peer_address_roundtrips_through_endpoint() {
        let (listener, port) = listen(0).unwrap();
        let accept_thread = thread::spawn(move || listener.accept().unwrap());
        let mut client = open(Endpoint::new(std::net::Ipv4Addr::LOCALHOST, port)).unwrap();
        client.write_all(b"x").unwrap();
        let (server_side, client_addr) = accept_thread.join().unwrap();

        // From the server's side, the peer is the client's local socket.
        assert_eq!(client_addr, client.local_addr().unwrap());
        // From the client's side, the peer is the server's listening socket.
        let endpoint = peer_address(&client).unwrap();
        assert_eq!(endpoint.host, std::net::Ipv4Addr::LOCALHOST);
        assert_eq!(endpoint.port, server_side.local_addr().unwrap().port());
    }
}
