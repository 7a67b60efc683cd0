// SPDX-License-Identifier: MIT

//! Linux epoll backend. Interest changes are applied immediately with an
//! `epoll_ctl` call under `interest`'s lock: for notifiers whose interest
//! modification is a kernel call, arm/disarm issues the call immediately
//! rather than queuing it (contrast [`super::kqueue`], §4.1).

use super::{Notifier, RawEvent};
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::time::Duration;

pub struct EpollNotifier {
    epoll: Epoll,
    /// Tracked so `arm_write`/`disarm_write` can recompute the full desired
    /// flag set: `EPOLL_CTL_MOD` replaces interest wholesale, it doesn't
    /// toggle individual bits.
    interest: Mutex<HashMap<RawFd, EpollFlags>>,
}

impl EpollNotifier {
    pub fn new() -> std::io::Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::empty())?;
        Ok(Self { epoll, interest: Mutex::new(HashMap::new()) })
    }

    fn modify(&self, fd: RawFd, flags: EpollFlags) -> std::io::Result<()> {
        let borrowed = borrow(fd);
        let mut event = EpollEvent::new(flags, fd as u64);
        self.epoll.modify(borrowed, &mut event)?;
        Ok(())
    }
}

/// The shard interest map stores plain `RawFd` keys, not owning handles
/// (§9, raw fd as identity), so every epoll_ctl call must briefly
/// reconstruct a borrow. Safe because the caller (`shard.rs`) only ever
/// calls `Notifier` methods while the fd's real owner — the `Listener` or
/// the `Connection` collaborator's session object — is still alive; the fd
/// is never closed by anyone other than that owner, and never reused by the
/// OS for something else while registered here.
#[allow(unsafe_code)]
fn borrow(fd: RawFd) -> BorrowedFd<'static> {
    // SAFETY: see doc comment above.
    unsafe { BorrowedFd::borrow_raw(fd) }
}

impl Notifier for EpollNotifier {
    fn add(&self, fd: RawFd) -> std::io::Result<()> {
        let flags = EpollFlags::EPOLLIN;
        self.epoll.add(borrow(fd), EpollEvent::new(flags, fd as u64))?;
        self.interest.lock().insert(fd, flags);
        Ok(())
    }

    fn del(&self, fd: RawFd) -> std::io::Result<()> {
        if self.interest.lock().remove(&fd).is_none() {
            return Ok(());
        }
        match self.epoll.delete(borrow(fd)) {
            Ok(()) => Ok(()),
            Err(nix::errno::Errno::EBADF | nix::errno::Errno::ENOENT) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn arm_read(&self, fd: RawFd) -> std::io::Result<()> {
        let flags = {
            let mut guard = self.interest.lock();
            let e = guard.entry(fd).or_insert(EpollFlags::empty());
            *e |= EpollFlags::EPOLLIN;
            *e
        };
        self.modify(fd, flags)
    }

    fn disarm_read(&self, fd: RawFd) -> std::io::Result<()> {
        let flags = {
            let mut guard = self.interest.lock();
            let e = guard.entry(fd).or_insert(EpollFlags::empty());
            e.remove(EpollFlags::EPOLLIN);
            *e
        };
        self.modify(fd, flags)
    }

    fn arm_write(&self, fd: RawFd) -> std::io::Result<()> {
        let flags = {
            let mut guard = self.interest.lock();
            let e = guard.entry(fd).or_insert(EpollFlags::empty());
            *e |= EpollFlags::EPOLLOUT;
            *e
        };
        self.modify(fd, flags)
    }

    fn disarm_write(&self, fd: RawFd) -> std::io::Result<()> {
        let flags = {
            let mut guard = self.interest.lock();
            let e = guard.entry(fd).or_insert(EpollFlags::empty());
            e.remove(EpollFlags::EPOLLOUT);
            *e
        };
        self.modify(fd, flags)
    }

    fn wait(&self, timeout: Option<Duration>) -> std::io::Result<Vec<RawEvent>> {
        let mut buf = vec![EpollEvent::new(EpollFlags::empty(), 0); 256];
        let epoll_timeout = match timeout {
            None => EpollTimeout::NONE,
            Some(d) => {
                let ms = d.as_millis().min(u16::MAX as u128) as u16;
                EpollTimeout::from(ms)
            }
        };
        let n = match self.epoll.wait(&mut buf, epoll_timeout) {
            Ok(n) => n,
            Err(nix::errno::Errno::EINTR) => 0,
            Err(e) => return Err(e.into()),
        };
        Ok(buf[..n]
            .iter()
            .map(|ev| {
                let fd = ev.data() as RawFd;
                let flags = ev.events();
                RawEvent {
                    fd,
                    readable: flags.intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLHUP),
                    writable: flags.contains(EpollFlags::EPOLLOUT),
                    error: flags.contains(EpollFlags::EPOLLERR),
                }
            })
            .collect())
    }
}

impl AsRawFd for EpollNotifier {
    fn as_raw_fd(&self) -> RawFd {
        self.epoll.as_fd().as_raw_fd()
    }
}
