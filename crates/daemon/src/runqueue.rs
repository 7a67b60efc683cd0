// SPDX-License-Identifier: MIT

//! Periodic task runqueue (§4.5), owned by shard 0. A deadline-ordered heap
//! of deferred callables; due tasks are submitted to the thread pool behind
//! a trampoline that clears the submission's cancellation cookie before
//! invoking the user routine.

use dsd_core::{Cookie, Job, ThreadPool};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Handle to a scheduled task, usable to cancel it before it next fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskId(u64);

struct Task {
    interval: Duration,
    running: Arc<AtomicBool>,
    callback: Arc<dyn Fn() + Send + Sync>,
}

pub struct Runqueue {
    tasks: Mutex<HashMap<u64, Task>>,
    heap: Mutex<BinaryHeap<Reverse<(Instant, u64)>>>,
    next_id: AtomicU64,
}

impl Default for Runqueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Runqueue {
    pub fn new() -> Self {
        Self { tasks: Mutex::new(HashMap::new()), heap: Mutex::new(BinaryHeap::new()), next_id: AtomicU64::new(1) }
    }

    /// Schedule `callback` to first run at `first_deadline`, then every
    /// `interval` after that (`interval == Duration::ZERO` means one-shot).
    pub fn submit(
        &self,
        first_deadline: Instant,
        interval: Duration,
        callback: Arc<dyn Fn() + Send + Sync>,
    ) -> TaskId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.tasks.lock().insert(id, Task { interval, running: Arc::new(AtomicBool::new(false)), callback });
        self.heap.lock().push(Reverse((first_deadline, id)));
        TaskId(id)
    }

    /// Remove a task so it never fires again. A no-op if it already fired as
    /// one-shot or was already cancelled.
    pub fn cancel(&self, task: TaskId) {
        self.tasks.lock().remove(&task.0);
    }

    /// Soonest remaining deadline, used to shorten the shard-0 wait timeout
    /// (§4.2 step 1, §4.5 "on resume-from-sleep").
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.lock().peek().map(|Reverse((deadline, _))| *deadline)
    }

    /// Pop every due task and submit it to `pool`, per §4.5: already-running
    /// tasks are just rescheduled rather than double-submitted.
    pub fn drive(&self, now: Instant, pool: &dyn ThreadPool) {
        loop {
            let due_id = {
                let mut heap = self.heap.lock();
                match heap.peek() {
                    Some(Reverse((deadline, _))) if *deadline <= now => {
                        let Reverse((_, id)) = heap.pop().unwrap();
                        id
                    }
                    _ => break,
                }
            };

            let mut tasks = self.tasks.lock();
            let Some(task) = tasks.get_mut(&due_id) else {
                // Cancelled between scheduling and firing.
                continue;
            };

            if task.interval.is_zero() {
                let callback = task.callback.clone();
                let running = task.running.clone();
                tasks.remove(&due_id);
                drop(tasks);
                submit_trampoline(pool, running, callback);
            } else {
                if task.running.load(Ordering::Acquire) {
                    self.heap.lock().push(Reverse((now + task.interval, due_id)));
                    continue;
                }
                task.running.store(true, Ordering::Release);
                self.heap.lock().push(Reverse((now + task.interval, due_id)));
                let callback = task.callback.clone();
                let running = task.running.clone();
                drop(tasks);
                submit_trampoline(pool, running, callback);
            }
        }
    }
}

fn submit_trampoline(pool: &dyn ThreadPool, running: Arc<AtomicBool>, callback: Arc<dyn Fn() + Send + Sync>) {
    let job: Job = Box::new(move || {
        running.store(false, Ordering::Release);
        callback();
    });
    let _cookie: Cookie = pool.submit_with_cookie(job);
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsd_adapters::pool::InlineThreadPool;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn one_shot_task_fires_once() {
        let rq = Runqueue::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        rq.submit(Instant::now(), Duration::ZERO, Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        let pool = InlineThreadPool::new();
        rq.drive(Instant::now(), &pool);
        rq.drive(Instant::now(), &pool);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn repeating_task_reschedules() {
        let rq = Runqueue::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        rq.submit(Instant::now(), Duration::from_millis(10), Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        let pool = InlineThreadPool::new();
        rq.drive(Instant::now(), &pool);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        rq.drive(Instant::now() + Duration::from_millis(20), &pool);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cancelled_task_never_fires() {
        let rq = Runqueue::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = rq.submit(Instant::now(), Duration::ZERO, Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        rq.cancel(id);
        let pool = InlineThreadPool::new();
        rq.drive(Instant::now(), &pool);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
