// SPDX-License-Identifier: MIT

//! Accept path (§4.3). `listener_activate` marks a listener busy and hands
//! the blocking `accept` off to the thread pool; this module holds the
//! pure, reusable pieces of that job — socket configuration and peer
//! identity/credential extraction — while job submission and descriptor
//! registration live in [`crate::daemon`], which has access to the shard
//! array and the `Connection` collaborator.

use dsd_core::{ConnectionFlags, Listener, PeerName};
use socket2::{SockAddr, Socket};
use std::os::fd::AsRawFd;
use tracing::warn;

/// Everything the accept path learned about a freshly accepted peer.
pub struct AcceptedPeer {
    pub peer: PeerName,
    pub flags: ConnectionFlags,
    pub ssf: u32,
    pub authid: Option<String>,
}

/// Apply TCP keepalive/nodelay where applicable. Failures are logged and
/// swallowed (§7: "setsockopt failures on keepalive/nodelay: log, proceed").
pub fn configure_accepted_socket(socket: &Socket, listener: &Listener) {
    if listener.datagram || matches!(listener.family, dsd_core::AddressFamily::Unix) {
        return;
    }
    if let Err(e) = socket.set_keepalive(true) {
        warn!(listener = %listener.name, error = %e, "setsockopt SO_KEEPALIVE failed, continuing");
    }
    if let Err(e) = socket.set_nodelay(true) {
        warn!(listener = %listener.name, error = %e, "setsockopt TCP_NODELAY failed, continuing");
    }
    let _ = socket.set_nonblocking(true);
}

/// Build the peer identity the `Connection` collaborator is handed. For
/// inet sockets this is `"IP=<addr>:<port>"`, `ssf=0`, no authid. For
/// Unix-domain sockets, `SO_PEERCRED` (Linux) yields the synthetic SASL
/// EXTERNAL identity described in §6: `"gidNumber=<gid>+uidNumber=<uid>,
/// cn=peercred,cn=external,cn=auth"`. TLS listeners carry the `TLS` flag so
/// the upper layer knows a handshake is pending; this layer never touches
/// the handshake itself (§1 "out of scope").
pub fn describe_peer(listener: &Listener, socket: &Socket, addr: &SockAddr) -> AcceptedPeer {
    let mut flags = ConnectionFlags::empty();
    if listener.tls {
        flags |= ConnectionFlags::TLS;
    }
    if listener.datagram {
        flags |= ConnectionFlags::DATAGRAM;
    }
    if listener.proxied {
        flags |= ConnectionFlags::PROXIED;
    }

    if matches!(listener.family, dsd_core::AddressFamily::Unix) {
        let authid = unix_peer_credentials(socket.as_raw_fd()).map(|(uid, gid)| {
            format!("gidNumber={gid}+uidNumber={uid},cn=peercred,cn=external,cn=auth")
        });
        return AcceptedPeer { peer: PeerName(listener.name.clone()), flags, ssf: 0, authid };
    }

    let peer = match addr.as_socket() {
        Some(std::net::SocketAddr::V4(a)) => PeerName(format!("IP={a}")),
        Some(std::net::SocketAddr::V6(a)) => PeerName(format!("IP=[{}]:{}", a.ip(), a.port())),
        None => PeerName("IP=unknown".to_string()),
    };
    AcceptedPeer { peer, flags, ssf: 0, authid: None }
}

#[cfg(target_os = "linux")]
fn unix_peer_credentials(fd: std::os::fd::RawFd) -> Option<(u32, u32)> {
    use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
    use std::os::fd::BorrowedFd;

    #[allow(unsafe_code)]
    // SAFETY: `fd` is the freshly accepted peer socket, owned by the caller
    // for the duration of this call; no other thread can close it yet.
    let borrowed: BorrowedFd<'_> = unsafe { BorrowedFd::borrow_raw(fd) };
    match getsockopt(&borrowed, PeerCredentials) {
        Ok(creds) => Some((creds.uid(), creds.gid())),
        Err(e) => {
            warn!(error = %e, "SO_PEERCRED lookup failed");
            None
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn unix_peer_credentials(_fd: std::os::fd::RawFd) -> Option<(u32, u32)> {
    // LOCAL_PEERCRED (BSD/macOS) has no portable wrapper in the crates this
    // workspace depends on; credentials are simply unavailable here.
    None
}
