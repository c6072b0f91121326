//! Scheduling seam.
//!
//! The specification describes a single-threaded cooperative model: every
//! component implements an `advance_state` step driven by an injected
//! scheduler, and I/O completion callbacks only reschedule the owning
//! component rather than running business logic themselves. This crate
//! realizes that model idiomatically with `tokio` tasks — one task per
//! stage object, suspending at `.await` points exactly at the suspension
//! points the specification lists (an in-flight read/write, a subordinate
//! driver step, a freeze/hold handshake).
//!
//! [`Scheduler`] remains a thin seam rather than disappearing entirely
//! because the specification calls out, as a testable property, that a
//! *test* scheduler drains its queue synchronously on demand while a
//! *production* scheduler defers to the host event loop. `TokioScheduler`
//! and `ImmediateScheduler` are that pair.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

/// A unit of deferred work. Boxed so both schedulers can store
/// heterogeneous closures in one queue.
pub type Schedulable = Box<dyn FnOnce() + Send + 'static>;

/// Enqueues a [`Schedulable`] for a later call.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, work: Schedulable);
}

/// Production scheduler: hands work to the `tokio` runtime via
/// `tokio::spawn(async move { work() })`, i.e. a zero-delay timer on the
/// host event loop.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule(&self, work: Schedulable) {
        tokio::task::spawn_blocking(move || work());
    }
}

/// Test scheduler: holds work in a FIFO queue and only runs it when
/// [`ImmediateScheduler::drain`] is called, so tests can assert on
/// intermediate state between scheduling and execution.
#[derive(Clone, Default)]
pub struct ImmediateScheduler {
    queue: Arc<Mutex<VecDeque<Schedulable>>>,
}

impl ImmediateScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs every currently-queued item, including ones scheduled by items
    /// run during this same drain, until the queue is empty.
    pub fn drain(&self) {
        loop {
            let next = self.queue.lock().expect("scheduler mutex poisoned").pop_front();
            match next {
                Some(work) => work(),
                None => break,
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().expect("scheduler mutex poisoned").is_empty()
    }
}

impl Scheduler for ImmediateScheduler {
    fn schedule(&self, work: Schedulable) {
        self.queue.lock().expect("scheduler mutex poisoned").push_back(work);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn scheduled_work_waits_for_drain() {
        let scheduler = ImmediateScheduler::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = ran.clone();
        scheduler.schedule(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(!scheduler.is_empty());
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        scheduler.drain();

        assert!(scheduler.is_empty());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drain_runs_work_scheduled_by_work() {
        let scheduler = ImmediateScheduler::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let inner_scheduler = scheduler.clone();
        let inner_ran = ran.clone();
        scheduler.schedule(Box::new(move || {
            inner_ran.fetch_add(1, Ordering::SeqCst);
            let innermost_ran = inner_ran.clone();
            inner_scheduler.schedule(Box::new(move || {
                innermost_ran.fetch_add(1, Ordering::SeqCst);
            }));
        }));

        scheduler.drain();

        assert!(scheduler.is_empty());
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }
}
