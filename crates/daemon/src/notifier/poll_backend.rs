// SPDX-License-Identifier: MIT

//! Portable `poll(2)` fallback for hosts with neither epoll nor kqueue. This
//! is the "Indexed" family from §4.1: `poll(2)` has no persistent kernel-side
//! registration, so the backend itself keeps the registration table and
//! rebuilds the `pollfd` array fd-by-fd on every `wait` call. Shard-loop code
//! above sees the same uniform [`RawEvent`] list regardless of backend.

use super::{Notifier, RawEvent};
use nix::poll::{PollFd, PollFlags, PollTimeout};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::os::fd::{BorrowedFd, RawFd};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default)]
struct Interest {
    read: bool,
    write: bool,
}

pub struct PollNotifier {
    registered: Mutex<BTreeMap<RawFd, Interest>>,
}

impl PollNotifier {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self { registered: Mutex::new(BTreeMap::new()) })
    }

    fn set(&self, fd: RawFd, f: impl FnOnce(&mut Interest)) {
        let mut guard = self.registered.lock();
        let entry = guard.entry(fd).or_default();
        f(entry);
    }
}

/// Same raw-fd-as-identity borrow as the epoll backend (§9): the interest
/// table holds plain `RawFd` keys, never an owning handle.
#[allow(unsafe_code)]
fn borrow(fd: RawFd) -> BorrowedFd<'static> {
    // SAFETY: `fd` is only ever registered here while its real owner
    // (`Listener` or the `Connection` collaborator's session object) is
    // alive and has not closed or reused it.
    unsafe { BorrowedFd::borrow_raw(fd) }
}

impl Notifier for PollNotifier {
    fn add(&self, fd: RawFd) -> std::io::Result<()> {
        self.set(fd, |i| *i = Interest { read: true, write: false });
        Ok(())
    }

    fn del(&self, fd: RawFd) -> std::io::Result<()> {
        self.registered.lock().remove(&fd);
        Ok(())
    }

    fn arm_read(&self, fd: RawFd) -> std::io::Result<()> {
        self.set(fd, |i| i.read = true);
        Ok(())
    }

    fn disarm_read(&self, fd: RawFd) -> std::io::Result<()> {
        self.set(fd, |i| i.read = false);
        Ok(())
    }

    fn arm_write(&self, fd: RawFd) -> std::io::Result<()> {
        self.set(fd, |i| i.write = true);
        Ok(())
    }

    fn disarm_write(&self, fd: RawFd) -> std::io::Result<()> {
        self.set(fd, |i| i.write = false);
        Ok(())
    }

    fn wait(&self, timeout: Option<Duration>) -> std::io::Result<Vec<RawEvent>> {
        let table: Vec<(RawFd, Interest)> =
            self.registered.lock().iter().map(|(fd, i)| (*fd, *i)).collect();

        let borrows: Vec<BorrowedFd<'static>> = table.iter().map(|(fd, _)| borrow(*fd)).collect();
        let mut fds: Vec<PollFd> = table
            .iter()
            .zip(borrows.iter())
            .map(|((_, interest), bfd)| {
                let mut flags = PollFlags::empty();
                if interest.read {
                    flags |= PollFlags::POLLIN;
                }
                if interest.write {
                    flags |= PollFlags::POLLOUT;
                }
                PollFd::new(*bfd, flags)
            })
            .collect();

        let poll_timeout = match timeout {
            None => PollTimeout::NONE,
            Some(d) => PollTimeout::from(d.as_millis().min(u16::MAX as u128) as u16),
        };

        match nix::poll::poll(&mut fds, poll_timeout) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        }

        Ok(fds
            .iter()
            .zip(table.iter())
            .filter_map(|(pfd, (fd, _))| {
                let revents = pfd.revents()?;
                if revents.is_empty() {
                    return None;
                }
                Some(RawEvent {
                    fd: *fd,
                    readable: revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP),
                    writable: revents.contains(PollFlags::POLLOUT),
                    error: revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL),
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::assert_basic_contract;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn honors_basic_contract() {
        let notifier = PollNotifier::new().unwrap();
        let (a, b) = UnixStream::pair().unwrap();
        assert_basic_contract(&notifier, a.as_raw_fd(), b.as_raw_fd());
    }

    #[test]
    fn wait_reports_readable_peer_write() {
        let notifier = PollNotifier::new().unwrap();
        let (a, b) = UnixStream::pair().unwrap();
        notifier.add(a.as_raw_fd()).unwrap();
        std::io::Write::write_all(&mut (&b), b"x").unwrap();
        let events = notifier.wait(Some(Duration::from_millis(200))).unwrap();
        assert!(events.iter().any(|e| e.fd == a.as_raw_fd() && e.readable));
    }
}
