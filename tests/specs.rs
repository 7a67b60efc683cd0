// SPDX-License-Identifier: MIT

//! End-to-end scenarios exercising the daemon through real sockets. Each
//! test binds an ephemeral listener, drives a `Daemon` in a background
//! thread, and talks to it over an actual TCP or Unix-domain connection —
//! no mocked notifier or fake fd.

use dsd_adapters::{EchoConnection, FixedThreadPool};
use dsd_core::{bind_all, AddressFamilyPreference, BindOptions, Connection, ThreadPool};
use dsd_daemon::{Daemon, DaemonConfig, HupBehavior};
use serial_test::serial;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

fn bind_opts() -> BindOptions {
    BindOptions { backlog: 128, family_preference: AddressFamilyPreference::Any, proxied: false }
}

fn spawn_daemon(urls: &[&str], shards: usize) -> (Arc<Daemon>, std::thread::JoinHandle<()>) {
    let (daemon, _connection, handle) = spawn_daemon_with_connection(urls, shards);
    (daemon, handle)
}

fn spawn_daemon_with_connection(
    urls: &[&str],
    shards: usize,
) -> (Arc<Daemon>, Arc<dsd_adapters::EchoConnection>, std::thread::JoinHandle<()>) {
    let urls: Vec<String> = urls.iter().map(|s| s.to_string()).collect();
    let listeners = bind_all(&urls, &bind_opts()).expect("bind");
    let pool: Arc<dyn ThreadPool> = Arc::new(FixedThreadPool::new(4));
    let connection = EchoConnection::new(None);
    let daemon = Daemon::new(
        listeners,
        pool,
        connection.clone() as Arc<dyn Connection>,
        DaemonConfig { shards, idle_timeout: None, hup_behavior: HupBehavior::Gentle, ready_callback: None },
    )
    .expect("construct daemon");

    let handle = {
        let daemon = daemon.clone();
        std::thread::Builder::new()
            .name("test-daemon".into())
            .spawn(move || {
                daemon.run().expect("daemon run");
            })
            .expect("spawn daemon thread")
    };

    // Give the shard threads a moment to reach `wait` before we connect.
    std::thread::sleep(Duration::from_millis(50));
    (daemon, connection, handle)
}

/// Count this process's currently open descriptors, so a test can lower
/// `RLIMIT_NOFILE` to just above that baseline rather than to an absolute
/// guess that would vary with however many fds the test harness itself
/// happens to hold open.
fn current_open_fd_count() -> u64 {
    std::fs::read_dir("/proc/self/fd").map(|it| it.count() as u64).unwrap_or(256)
}

fn shutdown_and_join(daemon: Arc<Daemon>, handle: std::thread::JoinHandle<()>) {
    daemon.request_gentle_shutdown();
    handle.join().expect("daemon thread panicked");
}

/// S1 — single listen URL, N=1, a client round-trips bytes through the
/// echo connection.
#[test]
#[serial]
fn s1_single_listen_round_trip() {
    let (daemon, handle) = spawn_daemon(&["plain-ldap://127.0.0.1:0"], 1);
    let port = daemon.listeners[0].address_port().expect("bound port");

    let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    stream.write_all(b"hello").expect("write");

    let mut buf = [0u8; 5];
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    stream.read_exact(&mut buf).expect("echo read");
    assert_eq!(&buf, b"hello");

    drop(stream);
    shutdown_and_join(daemon, handle);
}

/// S3 — a Unix-domain listener created under a scratch directory accepts a
/// client and the socket file exists with the requested mode while the
/// daemon is up.
#[test]
#[serial]
fn s3_unix_domain_listener_accepts_and_echoes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let sock_path = dir.path().join("d.sock");
    let encoded = sock_path.to_str().unwrap().replace('/', "%2F");
    let url = format!("unix-ipc://{encoded}?x-mod=0770");

    let (daemon, connection, handle) = spawn_daemon_with_connection(&[&url], 1);

    let meta = std::fs::metadata(&sock_path).expect("socket file exists");
    assert_eq!(meta.permissions().mode() & 0o777, 0o770);

    let mut stream = UnixStream::connect(&sock_path).expect("connect");
    stream.write_all(b"who").expect("write");
    let mut buf = [0u8; 3];
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    stream.read_exact(&mut buf).expect("echo read");
    assert_eq!(&buf, b"who");

    let uid = nix::unistd::getuid().as_raw();
    let gid = nix::unistd::getgid().as_raw();
    let expected_authid = format!("gidNumber={gid}+uidNumber={uid},cn=peercred,cn=external,cn=auth");
    assert_eq!(connection.last_authid(), Some(expected_authid));

    drop(stream);
    shutdown_and_join(daemon, handle);

    assert!(!sock_path.exists(), "unix socket file must be unlinked after shutdown");
}

/// S2 — descriptor exhaustion mutes the listener (§4.7); closing a session
/// frees exactly one descriptor and `remove` unmutes the listener again
/// without the daemon ever needing to be restarted.
#[test]
#[serial]
fn s2_emfile_recovery_mutes_then_unmutes_listener() {
    use nix::sys::resource::{getrlimit, setrlimit, Resource};

    let (daemon, handle) = spawn_daemon(&["plain-ldap://127.0.0.1:0"], 1);
    let port = daemon.listeners[0].address_port().expect("bound port");

    let (soft, hard) = getrlimit(Resource::RLIMIT_NOFILE).expect("getrlimit");
    let baseline = current_open_fd_count();
    // Leave only a handful of descriptors of headroom so `accept` runs into
    // EMFILE well before the test exhausts its own attempt budget.
    setrlimit(Resource::RLIMIT_NOFILE, baseline + 6, hard).expect("lower rlimit");

    let mut streams = Vec::new();
    let mut muted_observed = false;
    for _ in 0..200 {
        if let Ok(s) = TcpStream::connect(("127.0.0.1", port)) {
            streams.push(s);
        }
        std::thread::sleep(Duration::from_millis(5));
        if daemon.listeners[0].is_muted() {
            muted_observed = true;
            break;
        }
    }
    assert!(muted_observed, "listener must mute once descriptors are exhausted");

    // Free one descriptor; the shard that owns the closed session's fd
    // unmutes the listener on its next `remove`, even though the listener
    // may live on a different shard.
    streams.pop();
    let mut unmuted_observed = false;
    for _ in 0..40 {
        std::thread::sleep(Duration::from_millis(10));
        if !daemon.listeners[0].is_muted() {
            unmuted_observed = true;
            break;
        }
    }
    assert!(unmuted_observed, "listener must unmute within one session-close");

    // Restore the real descriptor budget before any further teardown work
    // (unlinking sockets, closing remaining sessions) needs fds of its own.
    setrlimit(Resource::RLIMIT_NOFILE, soft, hard).expect("restore rlimit");

    drop(streams);
    shutdown_and_join(daemon, handle);
}

/// S4 — binding both the IPv4 and IPv6 wildcard on the same port yields a
/// single surviving listener (the IPv6 one); the IPv4 wildcard is skipped.
#[test]
#[serial]
fn s4_wildcard_v4_v6_coexistence() {
    // Bind the v6 wildcard first on an ephemeral port, then ask for the v4
    // wildcard on that same concrete port — bind_all must skip the v4 one
    // rather than erroring with AddrInUse.
    let probe = bind_all(&["plain-ldap://[::]:0".to_string()], &bind_opts()).expect("bind v6 probe");
    let port = probe[0].address_port().expect("v6 port");
    drop(probe);

    let urls = vec![format!("plain-ldap://0.0.0.0:{port}"), format!("plain-ldap://[::]:{port}")];
    let listeners = bind_all(&urls, &bind_opts()).expect("bind both");
    assert_eq!(listeners.len(), 1, "only the IPv6 wildcard should survive");
    assert!(matches!(listeners[0].address, dsd_core::ListenerAddress::Inet(std::net::SocketAddr::V6(_))));
}

/// S5 — while sessions are alive, a gentle shutdown stops new accepts but
/// waits for those sessions to end on their own before the daemon exits.
#[test]
#[serial]
fn s5_graceful_shutdown_waits_for_active_sessions() {
    let (daemon, handle) = spawn_daemon(&["plain-ldap://127.0.0.1:0"], 1);
    let port = daemon.listeners[0].address_port().expect("bound port");

    let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    stream.write_all(b"ping").expect("write");
    let mut buf = [0u8; 4];
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    stream.read_exact(&mut buf).expect("echo read");

    daemon.request_gentle_shutdown();
    // The daemon must not force-close our still-open session.
    std::thread::sleep(Duration::from_millis(200));
    stream.write_all(b"pong").expect("session still alive after gentle shutdown request");
    stream.read_exact(&mut buf).expect("still echoing");
    assert_eq!(&buf, b"pong");

    drop(stream);
    handle.join().expect("daemon exits once the last session ends naturally");
}

/// Invariant 3: after shutdown, every listener socket is closed (a fresh
/// connect attempt fails) and every Unix-domain socket file is unlinked.
#[test]
#[serial]
fn invariant_listeners_closed_after_shutdown() {
    let (daemon, handle) = spawn_daemon(&["plain-ldap://127.0.0.1:0"], 1);
    let port = daemon.listeners[0].address_port().expect("bound port");
    shutdown_and_join(daemon, handle);

    let result = TcpStream::connect(("127.0.0.1", port));
    assert!(result.is_err(), "listener socket must be closed after shutdown");
}

/// Testable property 6 (partial, single-shard slice): resizing while a
/// session is actively echoing must not stall or drop data.
#[test]
#[serial]
fn s6_resize_preserves_active_session_traffic() {
    let (daemon, handle) = spawn_daemon(&["plain-ldap://127.0.0.1:0"], 2);
    let port = daemon.listeners[0].address_port().expect("bound port");

    let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    stream.write_all(b"before").expect("write before resize");
    let mut buf = [0u8; 6];
    stream.read_exact(&mut buf).expect("echo before resize");
    assert_eq!(&buf, b"before");

    daemon.resize(8).expect("resize up");
    std::thread::sleep(Duration::from_millis(100));

    stream.write_all(b"after!").expect("write after resize");
    stream.read_exact(&mut buf).expect("echo after resize");
    assert_eq!(&buf, b"after!");

    drop(stream);
    shutdown_and_join(daemon, handle);
}
