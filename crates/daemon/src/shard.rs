// SPDX-License-Identifier: MIT

//! Daemon shard (§2 "Daemon shards", §3 "Shard state"): one of `N` identical
//! event-loop partitions. Each shard owns its event-notifier handle, its
//! wake pipe, the mutex protecting its interest map, and the `nactives` /
//! `nwriters` / `nfds` counters. The loop itself lives in [`crate::daemon`];
//! this module is the per-shard bookkeeping it drives.

use crate::notifier::{default_notifier, Notifier, RawEvent};
use crate::wake::WakePipe;
use dsd_core::Listener;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What a registered fd is, for dispatch purposes. Mirrors §3's "interest
/// record": a listener carries its `Listener` back-pointer, a session
/// carries none, and the wake endpoint is excluded from the interest map
/// entirely (the shard checks it by raw fd before consulting this map).
#[derive(Clone)]
pub enum Registrant {
    Listener(Arc<Listener>),
    Session,
}

struct InterestEntry {
    registrant: Registrant,
    readable: bool,
    writable: bool,
}

#[derive(Default)]
struct ShardInner {
    interest: HashMap<RawFd, InterestEntry>,
}

pub struct Shard {
    pub id: usize,
    notifier: Box<dyn Notifier>,
    wake: WakePipe,
    inner: Mutex<ShardInner>,
    nactives: AtomicUsize,
    nwriters: AtomicUsize,
    nfds: AtomicUsize,
    consecutive_errors: AtomicUsize,
}

impl Shard {
    pub fn new(id: usize) -> std::io::Result<Self> {
        let notifier = default_notifier()?;
        let wake = WakePipe::new()?;
        notifier.add(wake.read_raw_fd())?;
        Ok(Self {
            id,
            notifier,
            wake,
            inner: Mutex::new(ShardInner::default()),
            nactives: AtomicUsize::new(0),
            nwriters: AtomicUsize::new(0),
            nfds: AtomicUsize::new(1), // the wake endpoint itself
            consecutive_errors: AtomicUsize::new(0),
        })
    }

    pub fn wake_fd(&self) -> RawFd {
        self.wake.read_raw_fd()
    }

    pub fn wake(&self) {
        self.wake.wake();
    }

    pub fn nactives(&self) -> usize {
        self.nactives.load(Ordering::Acquire)
    }

    pub fn nwriters(&self) -> usize {
        self.nwriters.load(Ordering::Acquire)
    }

    pub fn nfds(&self) -> usize {
        self.nfds.load(Ordering::Acquire)
    }

    /// Register `fd` (§4.4 "add"). Asserts the invariant that `fd` is not
    /// already active on this shard — the caller (the descriptor router)
    /// guarantees `fd` is only ever added to the shard it hashes to.
    pub fn add(&self, fd: RawFd, registrant: Registrant, is_active: bool) -> std::io::Result<()> {
        {
            let mut inner = self.inner.lock();
            debug_assert!(
                !inner.interest.contains_key(&fd),
                "fd {fd} registered twice on shard without an intervening remove"
            );
            inner.interest.insert(fd, InterestEntry { registrant, readable: true, writable: false });
        }
        self.notifier.add(fd)?;
        self.nfds.fetch_add(1, Ordering::AcqRel);
        if is_active {
            self.nactives.fetch_add(1, Ordering::AcqRel);
        }
        self.wake();
        Ok(())
    }

    /// Deregister `fd` (§4.4 "remove"). Returns whether `fd` was a writer so
    /// the emfile/housekeeping path can keep its own accounting.
    pub fn remove(&self, fd: RawFd, was_active: bool) -> std::io::Result<bool> {
        let was_writer = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.interest.remove(&fd) else {
                return Ok(false);
            };
            entry.writable
        };
        self.notifier.del(fd)?;
        self.nfds.fetch_sub(1, Ordering::AcqRel);
        if was_active {
            self.nactives.fetch_sub(1, Ordering::AcqRel);
        }
        if was_writer {
            self.nwriters.fetch_sub(1, Ordering::AcqRel);
        }
        Ok(was_writer)
    }

    pub fn set_write(&self, fd: RawFd, wake: bool) {
        let newly_armed = {
            let mut inner = self.inner.lock();
            match inner.interest.get_mut(&fd) {
                Some(e) if !e.writable => {
                    e.writable = true;
                    true
                }
                _ => false,
            }
        };
        if newly_armed {
            self.nwriters.fetch_add(1, Ordering::AcqRel);
            let _ = self.notifier.arm_write(fd);
        }
        if wake {
            self.wake();
        }
    }

    pub fn clear_write(&self, fd: RawFd, wake: bool) {
        let was_armed = {
            let mut inner = self.inner.lock();
            match inner.interest.get_mut(&fd) {
                Some(e) if e.writable => {
                    e.writable = false;
                    true
                }
                _ => false,
            }
        };
        if was_armed {
            self.nwriters.fetch_sub(1, Ordering::AcqRel);
            let _ = self.notifier.disarm_write(fd);
        }
        if wake {
            self.wake();
        }
    }

    pub fn set_read(&self, fd: RawFd, wake: bool) {
        {
            let mut inner = self.inner.lock();
            if let Some(e) = inner.interest.get_mut(&fd) {
                e.readable = true;
            }
        }
        let _ = self.notifier.arm_read(fd);
        if wake {
            self.wake();
        }
    }

    /// Disarm read interest. Returns whether `fd` was active, so the caller
    /// can detect a double-clear (§4.4 "clr_read").
    pub fn clear_read(&self, fd: RawFd, wake: bool) -> bool {
        let was_active = {
            let mut inner = self.inner.lock();
            match inner.interest.get_mut(&fd) {
                Some(e) if e.readable => {
                    e.readable = false;
                    true
                }
                _ => false,
            }
        };
        if was_active {
            let _ = self.notifier.disarm_read(fd);
        }
        if wake {
            self.wake();
        }
        was_active
    }

    /// Re-arm every listener owned by this shard as readable iff it is
    /// neither muted nor busy, and disarm it otherwise so the notifier does
    /// not spin on a listener that cannot currently accept (§4.2 step 2).
    pub fn rearm_listeners(&self) {
        let listeners: Vec<(RawFd, Arc<Listener>)> = {
            let inner = self.inner.lock();
            inner
                .interest
                .iter()
                .filter_map(|(fd, e)| match &e.registrant {
                    Registrant::Listener(l) => Some((*fd, l.clone())),
                    Registrant::Session => None,
                })
                .collect()
        };
        for (fd, listener) in listeners {
            if listener.is_muted() || listener.is_busy() {
                let _ = self.notifier.disarm_read(fd);
            } else {
                let _ = self.notifier.arm_read(fd);
            }
        }
    }

    pub fn wait(&self, timeout: Option<Duration>) -> std::io::Result<Vec<RawEvent>> {
        self.notifier.wait(timeout)
    }

    /// Look up what kind of registrant `fd` is, without taking it out of the
    /// interest map. Used by the dispatch loop to decide whether an event is
    /// a listener-accept or a session read/write.
    pub fn registrant_of(&self, fd: RawFd) -> Option<Registrant> {
        self.inner.lock().interest.get(&fd).map(|e| e.registrant.clone())
    }

    /// Disarm every listener owned by this shard without unregistering it
    /// (used while a shutdown is in progress: stop accepting immediately
    /// but keep the fd around for the final close in `finish_shutdown`).
    pub fn disarm_all_listeners(&self) {
        let fds: Vec<RawFd> = {
            let inner = self.inner.lock();
            inner
                .interest
                .iter()
                .filter(|(_, e)| matches!(e.registrant, Registrant::Listener(_)))
                .map(|(fd, _)| *fd)
                .collect()
        };
        for fd in fds {
            let _ = self.notifier.disarm_read(fd);
        }
    }

    pub fn drain_wake(&self) {
        self.wake.drain();
    }

    /// Every fd currently registered on this shard. Used by `resize` to
    /// decide which fds need to migrate to a different shard.
    pub fn registered_fds(&self) -> Vec<RawFd> {
        self.inner.lock().interest.keys().copied().collect()
    }

    /// Remove `fd` from this shard entirely — bookkeeping and notifier
    /// registration alike — and return its state so it can be re-registered
    /// on the destination shard during a resize migration (§4.6).
    pub fn snapshot_and_forget(&self, fd: RawFd) -> Option<(Registrant, bool, bool, bool)> {
        let entry = {
            let mut inner = self.inner.lock();
            inner.interest.remove(&fd)?
        };
        let _ = self.notifier.del(fd);
        let was_active = !matches!(entry.registrant, Registrant::Listener(_));
        if was_active {
            self.nactives.fetch_sub(1, Ordering::AcqRel);
        }
        if entry.writable {
            self.nwriters.fetch_sub(1, Ordering::AcqRel);
        }
        self.nfds.fetch_sub(1, Ordering::AcqRel);
        Some((entry.registrant, entry.readable, entry.writable, was_active))
    }

    pub fn note_notifier_error(&self) -> usize {
        self.consecutive_errors.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn reset_notifier_errors(&self) {
        self.consecutive_errors.store(0, Ordering::Release);
    }
}
