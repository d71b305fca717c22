//! End-to-end scenarios driven over real loopback TCP, exercising only the
//! crate's public API. Each test spins up its own listener thread(s) on
//! `127.0.0.1:0` inside the test process rather than mocking the
//! transport.

use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use cluster_rpc::auth::InsecureTestAuthenticator;
use cluster_rpc::config::{self, CommParams, ConfigSnapshot};
use cluster_rpc::controller::{ControllerClient, RcPayload, RC_IN_STANDBY_MODE};
use cluster_rpc::{conn, engine, tree, Endpoint, Error, Forward, Message};

/// Every scenario here installs its own process-wide [`ConfigSnapshot`];
/// since `cargo test` runs the tests in this binary concurrently by
/// default, each test takes this lock for its duration so one test's
/// config can't be clobbered mid-exchange by another's `config::replace`.
static SERIAL: Mutex<()> = Mutex::new(());

/// Installs a `tracing_subscriber::fmt` subscriber routed through the test
/// harness's captured output, so the `warn!`/`info!` events this crate
/// emits on failover, reroute, and decode failures are visible under
/// `cargo test -- --nocapture` instead of going nowhere. `try_init` makes
/// this safe to call from every scenario in this binary.
fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn install_config(controllers: Vec<Endpoint>, tree_width: u16, slurmctld_timeout: Duration) {
    config::replace(ConfigSnapshot {
        controllers,
        vip: None,
        controller_port_count: 1,
        msg_timeout: Duration::from_secs(2),
        slurmctld_timeout,
        tree_width,
        authinfo: String::new(),
        comm_params: CommParams::default(),
        default_auth_secret: b"end-to-end-test-secret".to_vec(),
    });
}

// Scenario 1: echo.
#[test]
fn scenario_echo() {
    init_tracing();
    let _guard = SERIAL.lock().unwrap();
    install_config(vec![], 1, Duration::from_secs(5));

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        let auth = InsecureTestAuthenticator { uid: 1000 };
        let req = engine::receive(&mut sock, &auth, Duration::from_secs(2)).unwrap();
        assert_eq!(req.payload, vec![0xDE, 0xAD]);

        let mut resp = Message::new(req.protocol_version, req.message_type + 1, 0, vec![0xBE, 0xEF]);
        engine::send(&mut sock, &mut resp, &auth, 0, || {}).unwrap();
    });

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let auth = InsecureTestAuthenticator { uid: 1000 };
    let mut req = Message::new(9, 30, 0, vec![0xDE, 0xAD]);
    engine::send(&mut client, &mut req, &auth, 0, || {}).unwrap();

    let resp = engine::receive(&mut client, &auth, Duration::from_secs(2)).unwrap();
    assert_eq!(resp.message_type, 31);
    assert_eq!(resp.payload, vec![0xBE, 0xEF]);
    assert!(resp.ret_list.is_empty());

    server.join().unwrap();
}

// Scenario 2: version skew.
#[test]
fn scenario_version_skew() {
    init_tracing();
    let _guard = SERIAL.lock().unwrap();
    install_config(vec![], 1, Duration::from_secs(5));

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let auth = InsecureTestAuthenticator { uid: 77 };

    let server = thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        let auth = InsecureTestAuthenticator { uid: 77 };
        let bad_version = *cluster_rpc::SUPPORTED_VERSIONS.end() + 1;
        let mut resp = Message::new(bad_version, 1, 0, vec![]);
        engine::send(&mut sock, &mut resp, &auth, 0, || {}).unwrap();
    });

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    match engine::receive(&mut client, &auth, Duration::from_secs(2)) {
        Err(Error::VersionError { got, peer_uid, .. }) => {
            assert_eq!(got, *cluster_rpc::SUPPORTED_VERSIONS.end() + 1);
            assert_eq!(peer_uid, Some(77));
        }
        other => panic!("expected VersionError, got {other:?}"),
    }

    server.join().unwrap();
}

// Scenario 3: fan-out of 5 nodes, one width-5 bucket per node so each
// dispatch is a direct one-hop exchange, and one node is unreachable.
#[test]
fn scenario_fan_out_with_one_unreachable_node() {
    init_tracing();
    let _guard = SERIAL.lock().unwrap();
    install_config(vec![], 5, Duration::from_secs(5));
    let auth = InsecureTestAuthenticator { uid: 0 };

    assert_eq!(cluster_rpc::span(5, 3).as_slice(), &[3, 2, 0]);
    assert_eq!(cluster_rpc::span(5, 5).as_slice(), &[1, 1, 1, 1, 1]);

    // Four live agents, plus one unreachable host, each in its own
    // singleton bucket (width == node count) so every dispatch is a
    // direct one-hop exchange with no further recursive forwarding.
    let mut hosts = Vec::new();
    let mut handles = Vec::new();
    for i in 0..4 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        hosts.push(format!("127.0.0.1:{port}"));
        handles.push(thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let auth = InsecureTestAuthenticator { uid: 0 };
            let req = engine::receive(&mut sock, &auth, Duration::from_secs(2)).unwrap();
            assert_eq!(req.forward.count, 0);
            let mut resp = Message::new(9, 200 + i, 0, vec![i as u8]);
            engine::send(&mut sock, &mut resp, &auth, 0, || {}).unwrap();
        }));
    }
    // Port 1 is reserved and refuses connections.
    hosts.push("127.0.0.1:1".to_string());

    let mut req = Message::new(9, 1, 0, vec![]);
    req.forward = Forward::new(hosts.join(","), 5, Some(Duration::from_millis(300)));

    let entries = tree::fan_out(&req, &auth, Duration::from_millis(300));
    assert_eq!(entries.len(), 5);

    let failed: Vec<_> = entries.iter().filter(|e| e.is_forward_failed()).collect();
    let ok: Vec<_> = entries.iter().filter(|e| !e.is_forward_failed()).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(ok.len(), 4);
    assert_eq!(failed[0].node_name, "127.0.0.1:1");

    for h in handles {
        h.join().unwrap();
    }
}

// Scenario 4: port-range bind exhaustion, then a free port found.
#[test]
fn scenario_port_range_exhaustion_then_free_port() {
    init_tracing();
    let held_a = TcpListener::bind(("127.0.0.1", 20000)).ok();
    let held_b = TcpListener::bind(("127.0.0.1", 20001)).ok();
    let held_c = TcpListener::bind(("127.0.0.1", 20002)).ok();

    // Depending on what a concurrently-run test left bound, only assert
    // the documented failure mode when we actually hold all three ports.
    if held_a.is_some() && held_b.is_some() && held_c.is_some() {
        let result = conn::listen_range(20000..=20002);
        assert!(matches!(result, Err(Error::PortRangeExhausted(20000, 20002))));
    }
    drop(held_b);

    let (listener, port) = conn::listen_range(20000..=20002).unwrap();
    assert_eq!(port, 20001);
    drop(listener);
}

// Scenario 5: standby retry, total elapsed within 1.5x the standby window.
#[test]
fn scenario_standby_retry_within_budget() {
    init_tracing();
    let _guard = SERIAL.lock().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let slurmctld_timeout = Duration::from_millis(300);
    install_config(
        vec![
            Endpoint::new(Ipv4Addr::LOCALHOST, port),
            Endpoint::new(Ipv4Addr::LOCALHOST, port),
        ],
        1,
        slurmctld_timeout,
    );

    let server = thread::spawn(move || {
        let auth = InsecureTestAuthenticator { uid: 3 };
        for attempt in 0..2 {
            let (mut sock, _) = listener.accept().unwrap();
            let _req = engine::receive(&mut sock, &auth, Duration::from_secs(2)).unwrap();
            let mut resp = if attempt == 0 {
                Message::new(
                    9,
                    cluster_rpc::controller::MSG_TYPE_RC,
                    0,
                    RcPayload { code: RC_IN_STANDBY_MODE }.encode(),
                )
            } else {
                Message::new(9, 9, 0, vec![])
            };
            engine::send(&mut sock, &mut resp, &auth, 0, || {}).unwrap();
        }
    });

    let client = ControllerClient::new(InsecureTestAuthenticator { uid: 3 });
    let mut req = Message::new(9, 1, 0, vec![]);
    let start = Instant::now();
    let resp = client.send_recv(&mut req, None).unwrap();
    let elapsed = start.elapsed();

    assert_eq!(resp.message_type, 9);
    assert!(elapsed <= slurmctld_timeout.mul_f64(1.5) + Duration::from_secs(1));

    server.join().unwrap();
}

// Scenario 6: auth replay guard, two consecutive malformed-credential
// receives each incur at least the rate-limiting delay.
#[test]
fn scenario_auth_replay_guard_delays_each_attempt() {
    init_tracing();
    let _guard = SERIAL.lock().unwrap();
    install_config(vec![], 1, Duration::from_secs(5));

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = thread::spawn(move || {
        for _ in 0..2 {
            let (mut sock, _) = listener.accept().unwrap();
            let header = cluster_rpc::Header::init_from_message(9, 3, 0, Forward::none(), None);
            let framed = cluster_rpc::frame::encode(&header, b"short", b"");
            std::io::Write::write_all(&mut sock, &framed).unwrap();
        }
    });

    let auth = InsecureTestAuthenticator { uid: 1 };
    for _ in 0..2 {
        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let start = Instant::now();
        let result = engine::receive(&mut client, &auth, Duration::from_secs(2));
        assert!(result.is_err());
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    server.join().unwrap();
}
