// SPDX-License-Identifier: MIT

//! Listener table: a process-wide, append-only-at-startup vector of bound
//! listening endpoints (§3 "Listener", §4.3 accept-path address tie-breaks).

use crate::error::ListenError;
use crate::family::{AddressFamily, AddressFamilyPreference};
use crate::url::{Host, ListenUrl, Scheme};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{info, warn};

/// Default listen backlog, matching the original's `SLAPD_LISTEN_BACKLOG`.
pub const DEFAULT_LISTEN_BACKLOG: i32 = 2048;

/// A bound, listening endpoint. Created during daemon initialization,
/// destroyed only at daemon teardown.
pub struct Listener {
    pub url: String,
    pub address: ListenerAddress,
    pub family: AddressFamily,
    socket: Socket,
    pub name: String,
    /// Temporarily suppresses acceptance due to resource pressure (§4.7).
    pub mute: AtomicBool,
    /// An accept is in flight on a worker (§4.3).
    pub busy: AtomicBool,
    pub tls: bool,
    pub datagram: bool,
    pub proxied: bool,
    pub unix_mode: Option<u32>,
    pub rcvbuf_hint: Option<usize>,
    pub sndbuf_hint: Option<usize>,
    /// Monotonic counter of connections opened through this listener.
    pub opened: AtomicU64,
}

#[derive(Debug, Clone)]
pub enum ListenerAddress {
    Inet(SocketAddr),
    Unix(PathBuf),
}

impl fmt::Display for ListenerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerAddress::Inet(SocketAddr::V4(a)) => write!(f, "IP={a}"),
            ListenerAddress::Inet(SocketAddr::V6(a)) => write!(f, "IP=[{}]:{}", a.ip(), a.port()),
            ListenerAddress::Unix(p) => write!(f, "PATH={}", p.display()),
        }
    }
}

impl Listener {
    pub fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub fn accept(&self) -> std::io::Result<(Socket, SockAddr)> {
        self.socket.accept()
    }

    pub fn is_muted(&self) -> bool {
        self.mute.load(Ordering::Acquire)
    }

    pub fn set_muted(&self, value: bool) {
        self.mute.store(value, Ordering::Release);
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn set_busy(&self, value: bool) {
        self.busy.store(value, Ordering::Release);
    }

    pub fn note_opened(&self) {
        self.opened.fetch_add(1, Ordering::Relaxed);
    }

    /// The bound TCP/UDP port, or `None` for a Unix-domain listener.
    pub fn address_port(&self) -> Option<u16> {
        match self.address {
            ListenerAddress::Inet(addr) => Some(addr.port()),
            ListenerAddress::Unix(_) => None,
        }
    }
}

/// Options controlling how a `ListenUrl` is resolved and bound.
#[derive(Debug, Clone)]
pub struct BindOptions {
    pub backlog: i32,
    pub family_preference: AddressFamilyPreference,
    pub proxied: bool,
}

impl Default for BindOptions {
    fn default() -> Self {
        Self {
            backlog: DEFAULT_LISTEN_BACKLOG,
            family_preference: AddressFamilyPreference::Any,
            proxied: false,
        }
    }
}

/// Resolve and bind every URL in `urls`, applying the wildcard v4/v6
/// tie-break (§4.3): if a wildcard IPv4 bind fails with "address in use"
/// while a wildcard IPv6 listener on the same port already exists, the IPv4
/// attempt is silently dropped rather than treated as a startup error.
pub fn bind_all(urls: &[String], opts: &BindOptions) -> Result<Vec<Listener>, ListenError> {
    let mut listeners = Vec::new();
    for raw in urls {
        let parsed = ListenUrl::parse(raw)?;
        for candidate in resolve_candidates(&parsed, opts.family_preference)? {
            match bind_one(&parsed, candidate, opts) {
                Ok(l) => listeners.push(l),
                Err(ListenError::BindFailed { url, source })
                    if source.kind() == std::io::ErrorKind::AddrInUse
                        && matches!(candidate, ResolvedAddr::Inet(SocketAddr::V4(a)) if a.ip().is_unspecified())
                        && listeners.iter().any(|l| is_wildcard_v6_same_port(l, port_of(candidate))) =>
                {
                    info!(url = %url, "wildcard IPv4 listen skipped: wildcard IPv6 already bound on this port");
                }
                Err(e) => return Err(e),
            }
        }
    }
    Ok(listeners)
}

fn port_of(addr: ResolvedAddr) -> u16 {
    match addr {
        ResolvedAddr::Inet(a) => a.port(),
        ResolvedAddr::Unix => 0,
    }
}

fn is_wildcard_v6_same_port(l: &Listener, port: u16) -> bool {
    matches!(&l.address, ListenerAddress::Inet(SocketAddr::V6(a)) if a.ip().is_unspecified() && a.port() == port)
}

#[derive(Debug, Clone, Copy)]
enum ResolvedAddr {
    Inet(SocketAddr),
    /// The real path lives on the parsed URL and is re-read in `bind_one`.
    Unix,
}

fn resolve_candidates(
    url: &ListenUrl,
    pref: AddressFamilyPreference,
) -> Result<Vec<ResolvedAddr>, ListenError> {
    if url.scheme.is_unix() {
        return Ok(vec![ResolvedAddr::Unix]);
    }

    let port = url.port.unwrap_or(if url.scheme.is_tls() { 636 } else { 389 });
    let candidates: Vec<IpAddr> = match &url.host {
        Host::Wildcard => match pref {
            AddressFamilyPreference::PreferInet => vec![IpAddr::V4(Ipv4Addr::UNSPECIFIED)],
            _ => vec![IpAddr::V6(Ipv6Addr::UNSPECIFIED), IpAddr::V4(Ipv4Addr::UNSPECIFIED)],
        },
        Host::Name(n) => {
            if let Ok(ip) = n.parse::<IpAddr>() {
                vec![ip]
            } else {
                let resolved: Vec<IpAddr> = (n.as_str(), port)
                    .to_socket_addrs()
                    .map_err(|_| ListenError::NoAddressResolved(n.clone()))?
                    .map(|sa| sa.ip())
                    .filter(|ip| matches!(ip, IpAddr::V4(_) | IpAddr::V6(_)))
                    .collect();
                if resolved.is_empty() {
                    return Err(ListenError::NoAddressResolved(n.clone()));
                }
                match pref {
                    AddressFamilyPreference::PreferInet => {
                        let v4: Vec<_> = resolved.iter().copied().filter(|a| a.is_ipv4()).collect();
                        if !v4.is_empty() {
                            v4
                        } else {
                            resolved
                        }
                    }
                    AddressFamilyPreference::PreferInet6 => {
                        let v6: Vec<_> = resolved.iter().copied().filter(|a| a.is_ipv6()).collect();
                        if !v6.is_empty() {
                            v6
                        } else {
                            resolved
                        }
                    }
                    AddressFamilyPreference::Any => resolved,
                }
            }
        }
        Host::Path(_) => unreachable!("unix-ipc handled above"),
    };

    Ok(candidates.into_iter().map(|ip| ResolvedAddr::Inet(SocketAddr::new(ip, port))).collect())
}

fn bind_one(url: &ListenUrl, candidate: ResolvedAddr, opts: &BindOptions) -> Result<Listener, ListenError> {
    match candidate {
        ResolvedAddr::Inet(addr) => bind_inet(url, addr, opts),
        ResolvedAddr::Unix => bind_unix(url, opts),
    }
}

fn bind_inet(url: &ListenUrl, addr: SocketAddr, opts: &BindOptions) -> Result<Listener, ListenError> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let (ty, proto) = if url.scheme.is_datagram() {
        (Type::DGRAM, Some(Protocol::UDP))
    } else {
        (Type::STREAM, Some(Protocol::TCP))
    };
    let socket = Socket::new(domain, ty, proto)
        .map_err(|e| ListenError::BindFailed { url: url.original.clone(), source: e })?;
    socket.set_reuse_address(true).ok();
    if addr.is_ipv6() {
        socket.set_only_v6(false).ok();
    }
    socket
        .bind(&addr.into())
        .map_err(|e| ListenError::BindFailed { url: url.original.clone(), source: e })?;
    if !url.scheme.is_datagram() {
        socket
            .listen(opts.backlog)
            .map_err(|e| ListenError::BindFailed { url: url.original.clone(), source: e })?;
    }
    if let Some(sz) = url.rcvbuf {
        if let Err(e) = socket.set_recv_buffer_size(sz) {
            warn!(url = %url.original, error = %e, "setsockopt SO_RCVBUF failed, continuing");
        }
    }
    if let Some(sz) = url.sndbuf {
        if let Err(e) = socket.set_send_buffer_size(sz) {
            warn!(url = %url.original, error = %e, "setsockopt SO_SNDBUF failed, continuing");
        }
    }
    socket.set_nonblocking(true).ok();

    // Port 0 asks the OS to pick an ephemeral port; reflect the address it
    // actually bound rather than the caller's port-0 request.
    let bound_addr = socket.local_addr().ok().and_then(|sa| sa.as_socket()).unwrap_or(addr);

    let family = if addr.is_ipv4() { AddressFamily::Inet } else { AddressFamily::Inet6 };
    let address = ListenerAddress::Inet(bound_addr);
    Ok(Listener {
        url: url.original.clone(),
        name: address.to_string(),
        address,
        family,
        socket,
        mute: AtomicBool::new(false),
        busy: AtomicBool::new(false),
        tls: url.scheme.is_tls(),
        datagram: url.scheme.is_datagram(),
        proxied: opts.proxied,
        unix_mode: None,
        rcvbuf_hint: url.rcvbuf,
        sndbuf_hint: url.sndbuf,
        opened: AtomicU64::new(0),
    })
}

fn bind_unix(url: &ListenUrl, opts: &BindOptions) -> Result<Listener, ListenError> {
    let Host::Path(path) = &url.host else { unreachable!("unix-ipc always parses to Host::Path") };
    // sockaddr_un.sun_path is typically 104-108 bytes depending on platform;
    // 100 leaves room for the terminator across all of them.
    if path.as_os_str().len() > 100 {
        return Err(ListenError::PathTooLong(path.clone()));
    }
    if path.exists() {
        let _ = std::fs::remove_file(path);
    }
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)
        .map_err(|e| ListenError::BindFailed { url: url.original.clone(), source: e })?;
    let sock_addr = SockAddr::unix(path)
        .map_err(|e| ListenError::BindFailed { url: url.original.clone(), source: e })?;
    socket
        .bind(&sock_addr)
        .map_err(|e| ListenError::BindFailed { url: url.original.clone(), source: e })?;
    socket
        .listen(opts.backlog)
        .map_err(|e| ListenError::BindFailed { url: url.original.clone(), source: e })?;
    socket.set_nonblocking(true).ok();

    if let Some(mode) = url.unix_mode {
        let perms = std::fs::Permissions::from_mode(mode);
        if let Err(e) = std::fs::set_permissions(path, perms) {
            warn!(path = %path.display(), error = %e, "failed to set unix socket mode");
        }
    }

    let address = ListenerAddress::Unix(path.clone());
    Ok(Listener {
        url: url.original.clone(),
        name: address.to_string(),
        address,
        family: AddressFamily::Unix,
        socket,
        mute: AtomicBool::new(false),
        busy: AtomicBool::new(false),
        tls: url.scheme.is_tls(),
        datagram: false,
        proxied: opts.proxied,
        unix_mode: url.unix_mode,
        rcvbuf_hint: None,
        sndbuf_hint: None,
        opened: AtomicU64::new(0),
    })
}

/// Unlink every Unix-domain socket file owned by `listeners`. Called once at
/// shutdown per §6 "Persisted state: none."
pub fn unlink_unix_sockets<'a>(listeners: impl IntoIterator<Item = &'a Listener>) {
    for l in listeners {
        if let ListenerAddress::Unix(path) = &l.address {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to unlink unix socket file");
                }
            }
        }
    }
}
