// SPDX-License-Identifier: MIT

//! Concrete `ThreadPool` collaborators (§6). [`FixedThreadPool`] is the
//! production implementation: a fixed set of worker threads pulling jobs
//! off a shared queue. [`InlineThreadPool`] runs every job synchronously on
//! the submitting thread and exists purely for deterministic unit tests.

use dsd_core::{Cookie, Job, ThreadPool};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

enum Message {
    Job(Job),
    Shutdown,
}

pub struct FixedThreadPool {
    sender: Sender<Message>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    backload: Arc<AtomicUsize>,
    paused: Arc<AtomicBool>,
}

impl FixedThreadPool {
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "thread pool needs at least one worker");
        let (sender, receiver) = mpsc::channel::<Message>();
        let receiver = Arc::new(Mutex::new(receiver));
        let backload = Arc::new(AtomicUsize::new(0));
        let paused = Arc::new(AtomicBool::new(false));

        let workers = (0..size)
            .map(|id| spawn_worker(id, receiver.clone(), backload.clone(), paused.clone()))
            .collect();

        Self { sender, workers: Mutex::new(workers), backload, paused }
    }
}

fn spawn_worker(
    id: usize,
    receiver: Arc<Mutex<Receiver<Message>>>,
    backload: Arc<AtomicUsize>,
    paused: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("dsd-worker-{id}"))
        .spawn(move || loop {
            let message = {
                let guard = receiver.lock().unwrap_or_else(|e| e.into_inner());
                guard.recv()
            };
            match message {
                Ok(Message::Job(job)) => {
                    while paused.load(Ordering::Acquire) {
                        std::thread::yield_now();
                    }
                    job();
                    backload.fetch_sub(1, Ordering::AcqRel);
                }
                Ok(Message::Shutdown) | Err(_) => break,
            }
        })
        .expect("failed to spawn worker thread")
}

impl ThreadPool for FixedThreadPool {
    fn submit(&self, job: Job) {
        self.backload.fetch_add(1, Ordering::AcqRel);
        let _ = self.sender.send(Message::Job(job));
    }

    fn submit_with_cookie(&self, job: Job) -> Cookie {
        let cookie = Cookie::new();
        let guard = cookie.clone();
        let wrapped: Job = Box::new(move || {
            if !guard.is_cancelled() {
                job();
            }
        });
        self.submit(wrapped);
        cookie
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    fn close(&self) {
        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));
        for _ in &workers {
            let _ = self.sender.send(Message::Shutdown);
        }
        for w in workers {
            let _ = w.join();
        }
    }

    fn backload(&self) -> usize {
        self.backload.load(Ordering::Acquire)
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }
}

/// Runs every job synchronously, inline, on the calling thread. Useful for
/// deterministic tests of the runqueue and accept-path logic that would
/// otherwise race against real worker threads.
#[derive(Default)]
pub struct InlineThreadPool {
    paused: AtomicBool,
}

impl InlineThreadPool {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ThreadPool for InlineThreadPool {
    fn submit(&self, job: Job) {
        if !self.paused.load(Ordering::Acquire) {
            job();
        }
    }

    fn submit_with_cookie(&self, job: Job) -> Cookie {
        let cookie = Cookie::new();
        if !cookie.is_cancelled() {
            self.submit(job);
        }
        cookie
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    fn close(&self) {}

    fn backload(&self) -> usize {
        0
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as Counter;
    use std::time::Duration;

    #[test]
    fn fixed_pool_runs_submitted_jobs() {
        let pool = FixedThreadPool::new(2);
        let count = Arc::new(Counter::new(0));
        for _ in 0..10 {
            let c = count.clone();
            pool.submit(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }));
        }
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 10);
        pool.close();
    }

    #[test]
    fn cancelled_cookie_skips_job() {
        let pool = FixedThreadPool::new(1);
        let count = Arc::new(Counter::new(0));
        let c = count.clone();
        let cookie = pool.submit_with_cookie(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        cookie.cancel();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        pool.close();
    }
}
