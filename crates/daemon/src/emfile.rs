// SPDX-License-Identifier: MIT

//! EMFILE/ENFILE backoff and listener mute recovery (§4.7, §2 "EMFILE
//! recovery"). A global counter plus per-listener `mute` flags let the
//! daemon shed load under descriptor pressure without permanently dropping
//! a listening endpoint.

use dsd_core::Listener;
use parking_lot::Mutex;
use std::os::fd::RawFd;
use std::sync::Arc;
use tracing::warn;

#[derive(Default)]
pub struct EmfileGuard {
    count: Mutex<u32>,
}

impl EmfileGuard {
    pub fn new() -> Self {
        Self { count: Mutex::new(0) }
    }

    /// Record one EMFILE/ENFILE hit and mute the offending listener.
    pub fn note_exhaustion(&self, listener: &Listener) {
        *self.count.lock() += 1;
        listener.set_muted(true);
        warn!(listener = %listener.name, "descriptor exhaustion, listener muted");
    }

    /// Called from `remove` (§4.4) whenever a session ends: if the counter
    /// is positive and the daemon is still listening, unmute exactly one
    /// muted listener (never the fd that just closed, though with listeners
    /// that is moot since listeners never reach this path as sessions).
    /// Resets a stale counter to zero if no muted listener is found. Returns
    /// the unmuted listener so the caller can wake its shard — the listener
    /// need not live on the same shard as the session that just closed.
    pub fn on_session_closed(
        &self,
        listeners: &[Arc<Listener>],
        closed_fd: RawFd,
        listening: bool,
    ) -> Option<Arc<Listener>> {
        if !listening {
            return None;
        }
        let mut count = self.count.lock();
        if *count == 0 {
            return None;
        }
        match listeners.iter().find(|l| l.is_muted() && l.as_raw_fd() != closed_fd) {
            Some(l) => {
                l.set_muted(false);
                *count -= 1;
                Some(l.clone())
            }
            None => {
                *count = 0;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsd_core::{bind_all, BindOptions};

    fn loopback_listener() -> Arc<Listener> {
        let listeners = bind_all(&["plain-ldap://127.0.0.1:0".to_string()], &BindOptions::default()).unwrap();
        Arc::new(listeners.into_iter().next().unwrap())
    }

    #[test]
    fn unmutes_on_session_close_when_counter_positive() {
        let guard = EmfileGuard::new();
        let listener = loopback_listener();
        guard.note_exhaustion(&listener);
        assert!(listener.is_muted());
        let unmuted = guard.on_session_closed(&[listener.clone()], -1, true);
        assert!(!listener.is_muted());
        assert_eq!(unmuted.map(|l| l.as_raw_fd()), Some(listener.as_raw_fd()));
    }

    #[test]
    fn resets_stale_counter_when_nothing_muted() {
        let guard = EmfileGuard::new();
        let listener = loopback_listener();
        guard.note_exhaustion(&listener);
        listener.set_muted(false);
        guard.on_session_closed(&[listener], -1, true);
        assert_eq!(*guard.count.lock(), 0);
    }
}
