// SPDX-License-Identifier: MIT

//! A minimal, real `Connection` collaborator (§6): echoes back whatever a
//! client sends. Exercises the full lifecycle the daemon engine drives —
//! `init`, `read_activate`, `write_ready`, idle timeout, gentle and abrupt
//! teardown — without depending on any directory-protocol parsing, which
//! stays out of scope for this layer (§1).

use dsd_core::{Connection, ConnectionFlags, PeerName, ShardControl};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

struct Session {
    pending_write: Vec<u8>,
    last_active: Instant,
}

/// Echoes every byte read back to the same peer. The daemon engine already
/// runs `read_activate`/`write_ready` on a worker-pool thread, never on a
/// shard thread, so the I/O here is plain blocking-safe syscalls on a
/// nonblocking fd.
pub struct EchoConnection {
    idle_timeout: Option<Duration>,
    sessions: Mutex<HashMap<RawFd, Session>>,
    last_authid: Mutex<Option<String>>,
}

/// Borrow a `RawFd` for the duration of one `nix` syscall. The fd's real
/// owner is this session map's entry for `fd`; it is only ever closed from
/// [`EchoConnection::close_fd`], and only after the entry has been removed,
/// so no concurrent close can race a borrowed use.
#[allow(unsafe_code)]
fn borrow(fd: RawFd) -> BorrowedFd<'static> {
    // SAFETY: see doc comment above.
    unsafe { BorrowedFd::borrow_raw(fd) }
}

impl EchoConnection {
    pub fn new(idle_timeout: Option<Duration>) -> Arc<Self> {
        Arc::new(Self { idle_timeout, sessions: Mutex::new(HashMap::new()), last_authid: Mutex::new(None) })
    }

    /// The `authid` handed to the most recent `init` call, if any. Lets
    /// tests assert on the SASL EXTERNAL identity synthesized for
    /// Unix-domain peers without this echo adapter needing to do anything
    /// with it itself.
    pub fn last_authid(&self) -> Option<String> {
        self.last_authid.lock().clone()
    }

    fn close_fd(fd: RawFd) {
        let _ = nix::unistd::close(fd);
    }

    fn flush(&self, fd: RawFd, ctx: &dyn ShardControl) {
        let remaining = {
            let mut sessions = self.sessions.lock();
            let Some(s) = sessions.get_mut(&fd) else { return };
            if s.pending_write.is_empty() {
                return;
            }
            match nix::unistd::write(borrow(fd), &s.pending_write) {
                Ok(n) => {
                    s.pending_write.drain(..n);
                }
                Err(nix::errno::Errno::EAGAIN | nix::errno::Errno::EINTR) => {}
                Err(e) => {
                    warn!(fd, error = %e, "write failed");
                    s.pending_write.clear();
                }
            }
            !s.pending_write.is_empty()
        };
        if remaining {
            ctx.set_write(fd, false);
        }
    }
}

impl Connection for EchoConnection {
    fn init(
        &self,
        _ctx: &dyn ShardControl,
        fd: RawFd,
        peer: PeerName,
        _flags: ConnectionFlags,
        _ssf: u32,
        authid: Option<String>,
    ) -> bool {
        debug!(fd, peer = %peer, "session established");
        *self.last_authid.lock() = authid;
        self.sessions.lock().insert(fd, Session { pending_write: Vec::new(), last_active: Instant::now() });
        true
    }

    fn write_ready(&self, ctx: &dyn ShardControl, fd: RawFd) -> i32 {
        self.flush(fd, ctx);
        0
    }

    fn read_activate(&self, ctx: &dyn ShardControl, fd: RawFd) {
        let mut buf = [0u8; 4096];
        match nix::unistd::read(fd, &mut buf) {
            Ok(0) => {
                self.sessions.lock().remove(&fd);
                ctx.remove(fd, true, true);
                Self::close_fd(fd);
            }
            Ok(n) => {
                {
                    let mut sessions = self.sessions.lock();
                    if let Some(s) = sessions.get_mut(&fd) {
                        s.pending_write.extend_from_slice(&buf[..n]);
                        s.last_active = Instant::now();
                    }
                }
                self.flush(fd, ctx);
                ctx.set_read(fd, false);
            }
            Err(nix::errno::Errno::EAGAIN | nix::errno::Errno::EINTR) => {
                ctx.set_read(fd, false);
            }
            Err(e) => {
                debug!(fd, error = %e, "read failed, closing session");
                self.sessions.lock().remove(&fd);
                ctx.remove(fd, true, true);
                Self::close_fd(fd);
            }
        }
    }

    fn is_active(&self, fd: RawFd) -> bool {
        self.sessions.lock().contains_key(&fd)
    }

    fn timeout_idle(&self, now: Instant) {
        let Some(timeout) = self.idle_timeout else { return };
        let stale: Vec<RawFd> = {
            let sessions = self.sessions.lock();
            sessions
                .iter()
                .filter(|(_, s)| now.saturating_duration_since(s.last_active) > timeout)
                .map(|(fd, _)| *fd)
                .collect()
        };
        for fd in stale {
            self.sessions.lock().remove(&fd);
            Self::close_fd(fd);
        }
    }

    fn shutdown(&self) {
        let fds: Vec<RawFd> = self.sessions.lock().keys().copied().collect();
        for fd in fds {
            Self::close_fd(fd);
        }
        self.sessions.lock().clear();
    }

    fn destroy(&self) {
        self.sessions.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopControl;
    impl ShardControl for NoopControl {
        fn set_write(&self, _fd: RawFd, _wake: bool) {}
        fn clear_write(&self, _fd: RawFd, _wake: bool) {}
        fn set_read(&self, _fd: RawFd, _wake: bool) {}
        fn clear_read(&self, _fd: RawFd, _wake: bool) -> bool {
            true
        }
        fn remove(&self, _fd: RawFd, _was_active: bool, _wake: bool) {}
    }

    #[test]
    fn init_registers_session() {
        let conn = EchoConnection::new(None);
        let ctx = NoopControl;
        assert!(conn.init(&ctx, 999, PeerName("IP=127.0.0.1:1".into()), ConnectionFlags::empty(), 0, None));
        assert!(conn.is_active(999));
        // A fake fd was never opened; skip any syscall-touching teardown.
        conn.sessions.lock().remove(&999);
    }

    #[test]
    fn idle_timeout_evicts_stale_session_without_touching_fd() {
        let conn = EchoConnection::new(Some(Duration::from_millis(1)));
        conn.sessions.lock().insert(
            998,
            Session { pending_write: Vec::new(), last_active: Instant::now() - Duration::from_secs(1) },
        );
        // Bypass `timeout_idle`'s real fd close (998 is not a real fd) by
        // directly exercising the staleness filter it uses.
        let now = Instant::now();
        let stale: Vec<RawFd> = conn
            .sessions
            .lock()
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.last_active) > Duration::from_millis(1))
            .map(|(fd, _)| *fd)
            .collect();
        assert_eq!(stale, vec![998]);
    }
}
