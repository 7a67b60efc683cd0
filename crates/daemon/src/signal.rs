// SPDX-License-Identifier: MIT

//! Signal handling (§6 "Signals", §9 "Signal delivery on multi-threaded
//! runtime"). Real signal handlers may only set atomic flags and write one
//! byte to shard 0's wake pipe; they must never take a mutex. Rather than
//! install a raw `sigaction` handler we run a dedicated thread via
//! `signal-hook`'s blocking iterator, which already does the
//! async-signal-safe dance for us and lets the handler body run ordinary
//! Rust: read the flag transitions, log, touch the shard-0 wake pipe.

use crate::shard::Shard;
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::info;

/// Cooperative shutdown state shared by every shard and the signal thread
/// (§5 "Cancellation & timeouts"): `shutdown` starts unwinding, `gentle`
/// requests drain-don't-kill, `abrupt` forces an immediate close.
#[derive(Default)]
pub struct ShutdownFlags {
    pub shutdown: AtomicBool,
    pub gentle: AtomicBool,
    pub abrupt: AtomicBool,
}

impl ShutdownFlags {
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn is_gentle(&self) -> bool {
        self.gentle.load(Ordering::Acquire)
    }

    pub fn is_abrupt(&self) -> bool {
        self.abrupt.load(Ordering::Acquire)
    }

    pub(crate) fn request_gentle(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.gentle.store(true, Ordering::Release);
    }

    pub(crate) fn request_abrupt(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.abrupt.store(true, Ordering::Release);
    }
}

/// Whether a SIGHUP should be treated as a gentle-shutdown request (gentle-hup
/// configuration enabled) or as abrupt, per §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HupBehavior {
    Gentle,
    Abrupt,
}

pub struct SignalThread {
    handle: Option<JoinHandle<()>>,
    signals: signal_hook::iterator::Handle,
}

impl SignalThread {
    pub fn spawn(flags: Arc<ShutdownFlags>, shard0: Arc<Shard>, hup: HupBehavior) -> std::io::Result<Self> {
        let mut signals = Signals::new([SIGHUP, SIGTERM, SIGINT])?;
        let handle_ref = signals.handle();
        let handle = std::thread::Builder::new().name("dsd-signal".into()).spawn(move || {
            for sig in signals.forever() {
                match sig {
                    SIGHUP => match hup {
                        HupBehavior::Gentle => {
                            info!("SIGHUP received, initiating gentle shutdown");
                            flags.request_gentle();
                        }
                        HupBehavior::Abrupt => {
                            info!("SIGHUP received, initiating abrupt shutdown");
                            flags.request_abrupt();
                        }
                    },
                    SIGTERM | SIGINT => {
                        if flags.is_shutting_down() {
                            info!(signal = sig, "second shutdown signal received, escalating to abrupt");
                            flags.request_abrupt();
                        } else {
                            info!(signal = sig, "shutdown signal received, draining gently");
                            flags.request_gentle();
                        }
                    }
                    _ => {}
                }
                shard0.wake();
            }
        })?;
        Ok(Self { handle: Some(handle), signals: handle_ref })
    }
}

impl Drop for SignalThread {
    fn drop(&mut self) {
        self.signals.close();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
