// SPDX-License-Identifier: MIT

//! Thread-pool collaborator contract (§6). The daemon submits accept, read,
//! write and runqueue jobs here; it never spawns ad-hoc threads itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// A handle to a submitted job that lets the runqueue cancel it before it
/// starts running (§4.5 "a cancellation cookie").
#[derive(Clone)]
pub struct Cookie(Arc<AtomicBool>);

impl Cookie {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    /// Mark the job cancelled. Has no effect once the job has started.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for Cookie {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker thread-pool collaborator (§6 "Thread pool collaborator").
pub trait ThreadPool: Send + Sync {
    fn submit(&self, job: Job);

    /// Submit a job guarded by a fresh `Cookie`; the trampoline must check
    /// `Cookie::is_cancelled` immediately before invoking the user routine.
    fn submit_with_cookie(&self, job: Job) -> Cookie;

    fn pause(&self);
    fn resume(&self);
    fn close(&self);

    /// Number of jobs queued plus running.
    fn backload(&self) -> usize;

    fn is_paused(&self) -> bool;
}
