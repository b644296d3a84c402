//! Timer scheduling.
//!
//! All periodic and delayed work goes through one [`Scheduler`] per owner.
//! Every timer it starts is tracked, so teardown is a single
//! [`Scheduler::cancel_all`].

use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Cancellation handle for one timer.
#[derive(Debug, Clone)]
#[must_use = "dropping a TimerHandle does not cancel the timer"]
pub struct TimerHandle {
    abort: AbortHandle,
}

impl TimerHandle {
    /// Stop the timer. Idempotent.
    pub fn cancel(&self) {
        self.abort.abort();
    }

    /// Check if the timer has stopped (cancelled or, for `after`, fired).
    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

/// A set of timers released together.
#[derive(Debug, Default)]
pub struct TimerSet {
    handles: Vec<TimerHandle>,
}

impl TimerSet {
    pub fn push(&mut self, handle: TimerHandle) {
        self.handles.retain(|h| !h.is_finished());
        self.handles.push(handle);
    }

    /// Cancel everything. Returns how many timers were still running.
    pub fn cancel_all(&mut self) -> usize {
        let running = self.handles.iter().filter(|h| !h.is_finished()).count();
        for handle in self.handles.drain(..) {
            handle.cancel();
        }
        running
    }

    /// Timers not yet finished.
    pub fn active(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_finished()).count()
    }
}

impl Drop for TimerSet {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

/// Starts timers on the current tokio runtime and tracks them.
#[derive(Debug, Default)]
pub struct Scheduler {
    timers: Mutex<TimerSet>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` every `period`, first after one period.
    pub fn every<F>(&self, period: Duration, mut f: F) -> TimerHandle
    where
        F: FnMut() + Send + 'static,
    {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                f();
            }
        });
        self.track(task.abort_handle())
    }

    /// Run `f` once after `delay`.
    pub fn after<F>(&self, delay: Duration, f: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            f();
        });
        self.track(task.abort_handle())
    }

    /// Cancel every timer started by this scheduler.
    pub fn cancel_all(&self) -> usize {
        self.timers.lock().cancel_all()
    }

    /// Timers still running.
    pub fn active(&self) -> usize {
        self.timers.lock().active()
    }

    fn track(&self, abort: AbortHandle) -> TimerHandle {
        let handle = TimerHandle { abort };
        self.timers.lock().push(handle.clone());
        handle
    }
}
