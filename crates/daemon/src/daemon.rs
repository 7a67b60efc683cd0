// SPDX-License-Identifier: MIT

//! The `Daemon` handle (§9 "prefer an explicit handle over process-wide
//! singletons"): owns the listener table, the shard array, the thread pool
//! and `Connection` collaborator references, the runqueue, and the
//! cooperative shutdown flags. `daemon.rs` is where the per-shard loop
//! described piecewise in §4.2 is assembled from `shard.rs`, `accept.rs`,
//! `emfile.rs` and `runqueue.rs`.

use crate::accept::{configure_accepted_socket, describe_peer};
use crate::emfile::EmfileGuard;
use crate::error::{DaemonError, EBADF_LIMIT};
use crate::runqueue::Runqueue;
use crate::shard::{Registrant, Shard};
use crate::signal::{HupBehavior, ShutdownFlags, SignalThread};
use dsd_core::{shard_for, unlink_unix_sockets, Connection, Listener, ShardControl, ThreadPool};
use parking_lot::RwLock;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// `idle_timeout / IDLE_SWEEP_DIVISOR` gives up to four idle sweeps per
/// configured idle-timeout window (§4.2 step 1).
const IDLE_SWEEP_DIVISOR: u32 = 4;

pub struct DaemonConfig {
    pub shards: usize,
    pub idle_timeout: Option<Duration>,
    pub hup_behavior: HupBehavior,
    /// Invoked exactly once, from whichever shard thread happens to be the
    /// last of the initial set to rearm its listeners for the first time
    /// (§11 "emitted once every listener is armed"). `None` skips it.
    pub ready_callback: Option<Arc<dyn Fn() + Send + Sync>>,
}

pub struct Daemon {
    pub listeners: Vec<Arc<Listener>>,
    shards: RwLock<Vec<Arc<Shard>>>,
    pool: Arc<dyn ThreadPool>,
    connection: Arc<dyn Connection>,
    emfile: EmfileGuard,
    runqueue: Runqueue,
    flags: Arc<ShutdownFlags>,
    idle_timeout: Option<Duration>,
    hup_behavior: HupBehavior,
    dtblsize: usize,
    threads_remaining: AtomicUsize,
    signal_thread: parking_lot::Mutex<Option<SignalThread>>,
    /// Every shard thread this daemon has spawned and not yet joined,
    /// keyed by shard id. `run` drains it to block until every thread
    /// (initial or resize-grown) has exited; `resize` removes the entries
    /// for shards it retires and hands them to a pool job to join.
    thread_handles: parking_lot::Mutex<Vec<(usize, JoinHandle<()>)>>,
    armed_remaining: AtomicUsize,
    ready_callback: parking_lot::Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

impl Daemon {
    pub fn new(
        listeners: Vec<Listener>,
        pool: Arc<dyn ThreadPool>,
        connection: Arc<dyn Connection>,
        config: DaemonConfig,
    ) -> Result<Arc<Self>, DaemonError> {
        if !config.shards.is_power_of_two() {
            return Err(DaemonError::NotPowerOfTwo(config.shards));
        }

        let listeners: Vec<Arc<Listener>> = listeners.into_iter().map(Arc::new).collect();
        let mut shards = Vec::with_capacity(config.shards);
        for id in 0..config.shards {
            shards.push(Arc::new(Shard::new(id).map_err(DaemonError::NotifierInit)?));
        }

        let dtblsize = dsd_core::capture_dtblsize();

        let daemon = Arc::new(Self {
            listeners: listeners.clone(),
            shards: RwLock::new(shards),
            pool,
            connection,
            emfile: EmfileGuard::new(),
            runqueue: Runqueue::new(),
            flags: Arc::new(ShutdownFlags::default()),
            idle_timeout: config.idle_timeout,
            hup_behavior: config.hup_behavior,
            dtblsize,
            threads_remaining: AtomicUsize::new(config.shards),
            signal_thread: parking_lot::Mutex::new(None),
            thread_handles: parking_lot::Mutex::new(Vec::new()),
            armed_remaining: AtomicUsize::new(config.shards),
            ready_callback: parking_lot::Mutex::new(config.ready_callback),
        });

        for listener in &listeners {
            let shard = daemon.shard_for_fd(listener.as_raw_fd());
            shard.add(listener.as_raw_fd(), Registrant::Listener(listener.clone()), false)?;
        }

        Ok(daemon)
    }

    pub fn dtblsize(&self) -> usize {
        self.dtblsize
    }

    pub fn runqueue(&self) -> &Runqueue {
        &self.runqueue
    }

    fn shard_count(&self) -> usize {
        self.shards.read().len()
    }

    fn shard_for_fd(&self, fd: RawFd) -> Arc<Shard> {
        let shards = self.shards.read();
        let idx = shard_for(fd, shards.len());
        shards[idx].clone()
    }

    fn shard_by_id(&self, id: usize) -> Option<Arc<Shard>> {
        self.shards.read().get(id).cloned()
    }

    /// Spawn one shard thread and record its handle so `run` can join it and
    /// a later shrinking `resize` can retire it.
    fn spawn_shard_thread(self: &Arc<Self>, id: usize) {
        let daemon = self.clone();
        let handle = std::thread::Builder::new()
            .name(format!("dsd-shard-{id}"))
            .spawn(move || shard_loop(daemon, id))
            .expect("failed to spawn shard thread");
        self.thread_handles.lock().push((id, handle));
    }

    /// Spawn the shard threads and the signal-forwarding thread, then block
    /// the calling thread until shutdown is complete (§4.2 step 7). Joins
    /// whatever handles remain in `thread_handles` one at a time so shard
    /// threads added later by a growing `resize` are also waited on; shards
    /// retired by a shrinking `resize` are removed from `thread_handles`
    /// (and joined) by `resize` itself, so this loop never double-joins.
    pub fn run(self: &Arc<Self>) -> Result<(), DaemonError> {
        let shard0 = self.shard_by_id(0).expect("at least one shard");
        let signal_thread = SignalThread::spawn(self.flags.clone(), shard0, self.hup_behavior)
            .map_err(DaemonError::Io)?;
        *self.signal_thread.lock() = Some(signal_thread);

        for id in 0..self.shard_count() {
            self.spawn_shard_thread(id);
        }

        loop {
            let next = self.thread_handles.lock().pop();
            let Some((_, handle)) = next else { break };
            let _ = handle.join();
        }

        *self.signal_thread.lock() = None;
        self.pool.close();
        Ok(())
    }

    pub fn request_gentle_shutdown(&self) {
        self.flags.request_gentle();
        self.wake_all_shards();
    }

    pub fn request_abrupt_shutdown(&self) {
        self.flags.request_abrupt();
        self.wake_all_shards();
    }

    fn wake_all_shards(&self) {
        for shard in self.shards.read().iter() {
            shard.wake();
        }
    }

    fn total_active_sessions(&self) -> usize {
        self.shards.read().iter().map(|s| s.nactives()).sum()
    }

    /// Called once by each of the initially-spawned shard threads after its
    /// first `rearm_listeners`. Fires `ready_callback` when the last of them
    /// reports in, i.e. once every listener this daemon started with has
    /// been armed at least once.
    fn note_shard_armed(&self) {
        if self.armed_remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(cb) = self.ready_callback.lock().take() {
                cb();
            }
        }
    }

    /// Final teardown (§4.2 step 7): close every listener, unlink Unix
    /// socket files, optionally force-close remaining sessions, then the
    /// last hook `destroy()`. Run exactly once, by whichever shard thread
    /// observes the last drain.
    fn finish_shutdown(&self) {
        info!("shutting down: closing listeners");
        unlink_unix_sockets(self.listeners.iter().map(|l| l.as_ref()));
        if self.flags.is_abrupt() {
            info!("abrupt shutdown: forcing remaining sessions closed");
            self.connection.shutdown();
        }
        self.connection.destroy();
        info!("shutdown complete");
    }

    /// Dynamic resize (§4.6). `new_n` must be a power of two. Grows by
    /// spawning new shard threads; shrinks by migrating every fd off the
    /// shards being retired, publishing the smaller shard table, and only
    /// then waking the retired shards so they observe the new `shard_count`
    /// and exit — `shard_loop` notices `id >= shard_count()` and returns. A
    /// pool job joins the retired threads so `resize` itself never blocks.
    pub fn resize(self: &Arc<Self>, new_n: usize) -> Result<(), DaemonError> {
        if !new_n.is_power_of_two() {
            return Err(DaemonError::NotPowerOfTwo(new_n));
        }

        let old_shards = self.shards.read().clone();
        let old_n = old_shards.len();
        if new_n == old_n {
            return Ok(());
        }

        if new_n > old_n {
            let mut grown = old_shards.clone();
            for id in old_n..new_n {
                grown.push(Arc::new(Shard::new(id).map_err(DaemonError::NotifierInit)?));
            }
            *self.shards.write() = grown;
            self.threads_remaining.fetch_add(new_n - old_n, Ordering::AcqRel);
            for id in old_n..new_n {
                self.spawn_shard_thread(id);
            }
        }

        // Migrate every fd whose shard membership changes under the new N,
        // including fds on shards a shrink is about to retire entirely —
        // otherwise any live session on a doomed shard would be abandoned.
        for shard in &old_shards {
            let fds: Vec<RawFd> = shard.registered_fds();
            for fd in fds {
                let old_idx = shard_for(fd, old_n);
                let new_idx = shard_for(fd, new_n);
                if old_idx == new_idx {
                    continue;
                }
                if let Some((registrant, readable, writable, was_active)) = shard.snapshot_and_forget(fd) {
                    let target = {
                        let shards = self.shards.read();
                        shards[new_idx].clone()
                    };
                    let _ = target.add(fd, registrant, was_active);
                    if writable {
                        target.set_write(fd, false);
                    }
                    if !readable {
                        target.clear_read(fd, false);
                    }
                }
            }
        }

        if new_n < old_n {
            *self.shards.write() = old_shards[..new_n].to_vec();

            let doomed: Vec<(usize, JoinHandle<()>)> = {
                let mut handles = self.thread_handles.lock();
                let (keep, doomed): (Vec<_>, Vec<_>) = handles.drain(..).partition(|(id, _)| *id < new_n);
                *handles = keep;
                doomed
            };
            // These threads will never reach `shard_loop`'s own shutdown
            // trailer, so account for their retirement here instead.
            self.threads_remaining.fetch_sub(old_n - new_n, Ordering::AcqRel);

            self.pool.submit(Box::new(move || {
                for (id, handle) in doomed {
                    if handle.join().is_err() {
                        warn!(shard = id, "shard thread panicked during resize shrink");
                    }
                }
            }));

            // Wake the retiring shards only now that `self.shards` no longer
            // reaches them, so they see the smaller count on the very wake
            // that reaches them rather than rechecking a stale one.
            for shard in old_shards.iter().skip(new_n) {
                shard.wake();
            }
        }

        // Wake every surviving shard so it rearms listeners and reconsiders
        // its wait timeout under the new shard count.
        for shard in old_shards.iter().take(old_n.min(new_n)) {
            shard.wake();
        }

        Ok(())
    }

    fn do_accept(self: &Arc<Self>, listener: Arc<Listener>) {
        match listener.accept() {
            Ok((socket, addr)) => {
                configure_accepted_socket(&socket, &listener);
                let accepted = describe_peer(&listener, &socket, &addr);
                let fd = socket.as_raw_fd();
                let shard = self.shard_for_fd(fd);

                if let Err(e) = shard.add(fd, Registrant::Session, true) {
                    warn!(error = %e, "failed to register accepted session");
                    listener.set_busy(false);
                    shard.wake();
                    return;
                }

                let ok = self.connection.init(
                    self.as_ref(),
                    fd,
                    accepted.peer,
                    accepted.flags,
                    accepted.ssf,
                    accepted.authid,
                );
                if ok {
                    // Ownership of `fd` now belongs to the `Connection`
                    // collaborator (§9 "no cyclic ownership"); forget the
                    // wrapper so its `Drop` does not close the fd under us.
                    std::mem::forget(socket);
                    listener.note_opened();
                } else {
                    let _ = shard.remove(fd, true);
                }
                listener.set_busy(false);
                shard.wake();
            }
            Err(e) => {
                let errno = e.raw_os_error().map(nix::errno::Errno::from_raw);
                match errno {
                    Some(nix::errno::Errno::EMFILE) | Some(nix::errno::Errno::ENFILE) => {
                        self.emfile.note_exhaustion(&listener);
                    }
                    Some(nix::errno::Errno::EAGAIN) | Some(nix::errno::Errno::EINTR) => {}
                    _ => warn!(listener = %listener.name, error = %e, "accept failed"),
                }
                listener.set_busy(false);
            }
        }
    }
}

impl ShardControl for Daemon {
    fn set_write(&self, fd: RawFd, wake: bool) {
        self.shard_for_fd(fd).set_write(fd, wake);
    }

    fn clear_write(&self, fd: RawFd, wake: bool) {
        self.shard_for_fd(fd).clear_write(fd, wake);
    }

    fn set_read(&self, fd: RawFd, wake: bool) {
        self.shard_for_fd(fd).set_read(fd, wake);
    }

    fn clear_read(&self, fd: RawFd, wake: bool) -> bool {
        self.shard_for_fd(fd).clear_read(fd, wake)
    }

    fn remove(&self, fd: RawFd, was_active: bool, wake: bool) {
        let shard = self.shard_for_fd(fd);
        let _ = shard.remove(fd, was_active);
        let unmuted = self.emfile.on_session_closed(&self.listeners, fd, !self.flags.is_shutting_down());
        if let Some(listener) = unmuted {
            // The unmuted listener may live on a different shard than the
            // session that just closed; that shard's own `wake` below does
            // not reach it.
            self.shard_for_fd(listener.as_raw_fd()).wake();
        }
        if wake {
            shard.wake();
        }
    }
}

fn shard_loop(daemon: Arc<Daemon>, id: usize) {
    let Some(shard) = daemon.shard_by_id(id) else { return };
    let mut armed_once = false;

    loop {
        if id >= daemon.shard_count() {
            // Retired by a `resize` shrink. Our fds were migrated off by
            // `resize` before it published the smaller shard table, and it
            // already accounted for our retirement in `threads_remaining`,
            // so skip the shutdown trailer below entirely.
            return;
        }
        if daemon.flags.is_abrupt() {
            break;
        }
        if daemon.flags.is_gentle() && shard.nactives() == 0 {
            break;
        }

        if daemon.flags.is_shutting_down() {
            // Listeners stop accepting immediately on any shutdown request
            // (S5); existing sessions keep being serviced until they drain.
            shard.disarm_all_listeners();
        } else {
            shard.rearm_listeners();
            if !armed_once {
                armed_once = true;
                daemon.note_shard_armed();
            }
        }

        let idle_timeout = if shard.nactives() > 0 {
            daemon.idle_timeout.map(|d| d / IDLE_SWEEP_DIVISOR)
        } else {
            None
        };
        let mut timeout = idle_timeout;
        if id == 0 {
            if let Some(deadline) = daemon.runqueue.next_deadline() {
                let until = deadline.saturating_duration_since(Instant::now());
                timeout = Some(match timeout {
                    Some(t) => t.min(until),
                    None => until,
                });
            }
        }

        let events = match shard.wait(timeout) {
            Ok(evs) => {
                shard.reset_notifier_errors();
                evs
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                let n = shard.note_notifier_error();
                error!(shard = id, error = %e, consecutive = n, "notifier wait failed");
                if n as u32 >= EBADF_LIMIT {
                    error!(shard = id, "too many consecutive notifier errors, forcing abrupt shutdown");
                    daemon.flags.request_abrupt();
                    break;
                }
                continue;
            }
        };

        if events.is_empty() {
            if id == 0 {
                daemon.connection.timeout_idle(Instant::now());
                daemon.runqueue.drive(Instant::now(), daemon.pool.as_ref());
            }
            continue;
        }

        for ev in events {
            if ev.fd == shard.wake_fd() {
                shard.drain_wake();
                continue;
            }
            match shard.registrant_of(ev.fd) {
                Some(Registrant::Listener(l)) => {
                    if ev.readable && !l.is_busy() {
                        l.set_busy(true);
                        let d = daemon.clone();
                        let target = l.clone();
                        daemon.pool.submit(Box::new(move || d.do_accept(target)));
                    }
                }
                Some(Registrant::Session) => {
                    let mut skip_read = false;
                    if ev.writable {
                        shard.clear_write(ev.fd, false);
                        let rc = daemon.connection.write_ready(&*daemon, ev.fd);
                        if rc < 0 {
                            skip_read = true;
                        }
                    }
                    if ev.readable && !skip_read {
                        shard.clear_read(ev.fd, false);
                        daemon.connection.read_activate(&*daemon, ev.fd);
                    }
                }
                None => {}
            }
        }

        if id == 0 {
            daemon.runqueue.drive(Instant::now(), daemon.pool.as_ref());
        }
    }

    if daemon.threads_remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
        daemon.finish_shutdown();
    }
}
