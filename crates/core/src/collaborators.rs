// SPDX-License-Identifier: MIT

//! Contracts for the external collaborators described in §6: the
//! `Connection` layer that owns accepted sockets once this core hands them
//! off, and the `ShardControl` callback surface the daemon exposes back to
//! that layer so it can re-arm read/write interest after doing I/O on a
//! worker thread.
//!
//! Neither trait is implemented in this crate. Concrete adapters live in
//! `dsd-adapters`; the daemon engine in `dsd-daemon` only ever holds
//! `Arc<dyn Connection>` / passes `&dyn ShardControl`.

use bitflags::bitflags;
use std::os::fd::RawFd;
use std::time::Instant;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ConnectionFlags: u8 {
        const TLS      = 0b0000_0001;
        const DATAGRAM = 0b0000_0010;
        const PROXIED  = 0b0000_0100;
    }
}

/// Displayable peer identity, formatted the way the original renders it:
/// `"IP=<addr>:<port>"` for inet sockets, `"PATH=<path>"` for Unix-domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerName(pub String);

impl std::fmt::Display for PeerName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Callback surface the daemon gives a `Connection` implementation so it can
/// mutate its own fd's interest after performing I/O on a worker thread.
/// Every method here is safe to call concurrently with the owning shard's
/// `wait` (§4.4, §4.1 double-buffering).
pub trait ShardControl: Send + Sync {
    fn set_write(&self, fd: RawFd, wake: bool);
    fn clear_write(&self, fd: RawFd, wake: bool);
    fn set_read(&self, fd: RawFd, wake: bool);
    /// Returns whether `fd` was active before clearing, so callers can
    /// detect a double-clear.
    fn clear_read(&self, fd: RawFd, wake: bool) -> bool;
    /// Deregister `fd` entirely (session end).
    fn remove(&self, fd: RawFd, was_active: bool, wake: bool);
}

/// The upper-layer collaborator that owns accepted connections. The daemon
/// core never parses request bytes; it only ever calls these four
/// lifecycle hooks plus idle/shutdown housekeeping.
pub trait Connection: Send + Sync {
    /// Called once per accepted session, on the worker thread that accepted
    /// it. Returning `false` means initialization failed and the daemon
    /// should close `fd` without registering it.
    #[allow(clippy::too_many_arguments)]
    fn init(
        &self,
        ctx: &dyn ShardControl,
        fd: RawFd,
        peer: PeerName,
        flags: ConnectionFlags,
        ssf: u32,
        authid: Option<String>,
    ) -> bool;

    /// Invoked from a shard loop when `fd` is writable and write-armed.
    /// A negative return means the write failed; the caller must not also
    /// process a pending read event for the same fd this iteration.
    fn write_ready(&self, ctx: &dyn ShardControl, fd: RawFd) -> i32;

    /// Invoked from a shard loop when `fd` is readable and read-armed.
    /// Submits the actual read to the thread pool internally.
    fn read_activate(&self, ctx: &dyn ShardControl, fd: RawFd);

    fn is_active(&self, fd: RawFd) -> bool;

    /// Close sessions that have been idle past the configured timeout.
    fn timeout_idle(&self, now: Instant);

    /// Forcibly close every remaining live session. Invoked only on the
    /// abrupt-shutdown path; a gentle shutdown lets sessions end on their
    /// own and never calls this.
    fn shutdown(&self);

    /// Final resource teardown, called exactly once after every session has
    /// ended — whether they ended naturally (gentle drain) or were forced
    /// closed by `shutdown`.
    fn destroy(&self);
}
