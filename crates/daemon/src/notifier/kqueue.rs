// SPDX-License-Identifier: MIT

//! BSD/macOS kqueue backend. Unlike epoll, `kevent` both submits changes and
//! collects results in the same call, so interest changes from worker
//! threads are buffered rather than applied immediately: `arm_read` and
//! friends append to a pending change list under `pending`'s lock, and the
//! next `wait` call drains that list, submits it together with the blocking
//! `kevent`, and returns whatever fired (§4.1, "double-buffered" family).

use super::{Notifier, RawEvent};
use nix::sys::event::{EventFilter, EventFlag, FilterFlag, KEvent, Kqueue};
use parking_lot::Mutex;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::time::Duration;

pub struct KqueueNotifier {
    kq: Kqueue,
    pending: Mutex<Vec<KEvent>>,
}

fn change(fd: RawFd, filter: EventFilter, flags: EventFlag) -> KEvent {
    KEvent::new(fd as usize, filter, flags, FilterFlag::empty(), 0, 0)
}

impl KqueueNotifier {
    pub fn new() -> std::io::Result<Self> {
        let kq = Kqueue::new()?;
        Ok(Self { kq, pending: Mutex::new(Vec::new()) })
    }

    fn push(&self, ev: KEvent) {
        self.pending.lock().push(ev);
    }
}

impl Notifier for KqueueNotifier {
    fn add(&self, fd: RawFd) -> std::io::Result<()> {
        self.push(change(
            fd,
            EventFilter::EVFILT_READ,
            EventFlag::EV_ADD | EventFlag::EV_CLEAR,
        ));
        // A fresh registration has no write interest yet; queue a disabled
        // write filter so later `arm_write` calls only need EV_ENABLE.
        self.push(change(
            fd,
            EventFilter::EVFILT_WRITE,
            EventFlag::EV_ADD | EventFlag::EV_CLEAR | EventFlag::EV_DISABLE,
        ));
        Ok(())
    }

    fn del(&self, fd: RawFd) -> std::io::Result<()> {
        self.push(change(fd, EventFilter::EVFILT_READ, EventFlag::EV_DELETE));
        self.push(change(fd, EventFilter::EVFILT_WRITE, EventFlag::EV_DELETE));
        Ok(())
    }

    fn arm_read(&self, fd: RawFd) -> std::io::Result<()> {
        self.push(change(fd, EventFilter::EVFILT_READ, EventFlag::EV_ENABLE));
        Ok(())
    }

    fn disarm_read(&self, fd: RawFd) -> std::io::Result<()> {
        self.push(change(fd, EventFilter::EVFILT_READ, EventFlag::EV_DISABLE));
        Ok(())
    }

    fn arm_write(&self, fd: RawFd) -> std::io::Result<()> {
        self.push(change(fd, EventFilter::EVFILT_WRITE, EventFlag::EV_ENABLE));
        Ok(())
    }

    fn disarm_write(&self, fd: RawFd) -> std::io::Result<()> {
        self.push(change(fd, EventFilter::EVFILT_WRITE, EventFlag::EV_DISABLE));
        Ok(())
    }

    fn wait(&self, timeout: Option<Duration>) -> std::io::Result<Vec<RawEvent>> {
        let outbound = std::mem::take(&mut *self.pending.lock());

        let mut eventlist = vec![
            KEvent::new(
                0,
                EventFilter::EVFILT_READ,
                EventFlag::empty(),
                FilterFlag::empty(),
                0,
                0,
            );
            256
        ];

        let timespec = timeout.map(|d| {
            nix::sys::time::TimeSpec::new(d.as_secs() as i64, d.subsec_nanos() as i64)
        });

        let n = match self.kq.kevent(&outbound, &mut eventlist, timespec) {
            Ok(n) => n,
            Err(nix::errno::Errno::EINTR) => 0,
            Err(e) => return Err(e.into()),
        };

        Ok(eventlist[..n]
            .iter()
            .map(|ev| {
                let fd = ev.ident() as RawFd;
                let filter = ev.filter().ok();
                let flags = ev.flags();
                RawEvent {
                    fd,
                    readable: filter == Some(EventFilter::EVFILT_READ),
                    writable: filter == Some(EventFilter::EVFILT_WRITE),
                    error: flags.contains(EventFlag::EV_ERROR),
                }
            })
            .collect())
    }
}

impl AsRawFd for KqueueNotifier {
    fn as_raw_fd(&self) -> RawFd {
        self.kq.as_fd().as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::assert_basic_contract;
    use std::os::unix::net::UnixStream;

    #[test]
    fn honors_basic_contract() {
        let notifier = KqueueNotifier::new().unwrap();
        let (a, b) = UnixStream::pair().unwrap();
        assert_basic_contract(&notifier, a.as_raw_fd(), b.as_raw_fd());
    }
}
