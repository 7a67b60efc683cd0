// SPDX-License-Identifier: MIT

//! The abstract event-set contract (§4.1): one uniform interface over
//! whichever kernel notification facility the host provides best. Three
//! backends are implemented:
//!
//! - [`epoll`]: Linux epoll. Interest changes are applied immediately via a
//!   kernel call under the shard mutex ("Listed" family — events arrive as
//!   an unordered list).
//! - [`kqueue`]: BSD/macOS kqueue. Interest changes are double-buffered: a
//!   worker thread appends to an inbound change list, and the next `wait`
//!   call swaps buffers and submits the outbound list together with the
//!   blocking `kevent` call ("Listed" family).
//! - [`poll_backend`]: portable `poll(2)` fallback for platforms with
//!   neither ("Indexed" family — the backend itself walks its registration
//!   table fd-by-fd to build the pollfd array and to decode results, so the
//!   shard loop above it sees the same uniform event list as the other two
//!   backends).
//!
//! `/dev/poll` (Solaris) is not implemented: none of this pack's target
//! platforms run Solaris, and the polling crate in the ecosystem pack
//! (`other_examples/.../fafhrd91-polling`) likewise only ships epoll,
//! kqueue, event ports and IOCP — devpoll is a dead backend in practice.
//! Noted here as a deliberately dropped backend, distinct from the
//! Non-goals carried over from the original daemon.

#[cfg(target_os = "linux")]
pub mod epoll;

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub mod kqueue;

pub mod poll_backend;

use std::os::fd::RawFd;
use std::time::Duration;

/// A single readiness notification, already normalized across backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEvent {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

/// Uniform per-shard operations over the backing kernel notifier (§4.1
/// table). All methods take `&self`: arm/disarm must be callable from any
/// worker thread concurrently with the owning shard blocked in `wait`.
pub trait Notifier: Send + Sync {
    /// Register `fd` as read-armed, write-disarmed.
    fn add(&self, fd: RawFd) -> std::io::Result<()>;

    /// Unregister `fd`. Idempotent: a second `del` on the same fd must not
    /// error or panic.
    fn del(&self, fd: RawFd) -> std::io::Result<()>;

    fn arm_read(&self, fd: RawFd) -> std::io::Result<()>;
    fn disarm_read(&self, fd: RawFd) -> std::io::Result<()>;
    fn arm_write(&self, fd: RawFd) -> std::io::Result<()>;
    fn disarm_write(&self, fd: RawFd) -> std::io::Result<()>;

    /// Block up to `timeout` (or indefinitely if `None`). Spurious wakeups
    /// are permitted; callers must tolerate an empty result.
    fn wait(&self, timeout: Option<Duration>) -> std::io::Result<Vec<RawEvent>>;
}

/// Construct the best notifier backend for the host platform: epoll on
/// Linux, kqueue on the BSDs and macOS, `poll(2)` everywhere else.
pub fn default_notifier() -> std::io::Result<Box<dyn Notifier>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(epoll::EpollNotifier::new()?))
    }
    #[cfg(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ))]
    {
        Ok(Box::new(kqueue::KqueueNotifier::new()?))
    }
    #[cfg(not(any(
        target_os = "linux",
        target_os = "macos",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    )))]
    {
        Ok(Box::new(poll_backend::PollNotifier::new()?))
    }
}

#[cfg(test)]
pub(crate) fn assert_basic_contract(n: &dyn Notifier, fd_a: RawFd, fd_b: RawFd) {
    n.add(fd_a).unwrap();
    n.add(fd_b).unwrap();
    n.arm_write(fd_a).unwrap();
    n.disarm_write(fd_a).unwrap();
    n.del(fd_a).unwrap();
    // idempotent
    n.del(fd_a).unwrap();
    n.del(fd_b).unwrap();
}
