//! Cancellable delayed operations on the serialized context.
//!
//! A timer never runs code itself. When it expires it delivers a
//! [`TimerFired`] message to the context that scheduled it, and the context
//! drops the message if the [`DelayedOperation`] was cancelled in the
//! meantime. Cancellation therefore also covers firings that are already
//! queued behind other work.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;

/// Identifies what a delayed operation is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// A connection attempt produced no message in time.
    OnlineStateTimeout,
    /// Periodic LRU garbage collection.
    LruGarbageCollection,
}

/// Handle to a scheduled timer.
#[derive(Debug)]
pub struct DelayedOperation {
    timer_id: TimerId,
    cancelled: Arc<AtomicBool>,
    task: Option<AbortHandle>,
}

impl DelayedOperation {
    /// Creates a handle sharing `cancelled` with the eventual firing.
    pub fn new(timer_id: TimerId, cancelled: Arc<AtomicBool>, task: Option<AbortHandle>) -> Self {
        Self {
            timer_id,
            cancelled,
            task,
        }
    }

    /// Returns the timer id.
    pub fn timer_id(&self) -> TimerId {
        self.timer_id
    }

    /// Cancels the timer. Its firing is discarded even if already queued.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(task) = &self.task {
            task.abort();
        }
    }

    /// Returns true once [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Message delivered when a timer expires.
#[derive(Debug, Clone)]
pub struct TimerFired {
    timer_id: TimerId,
    cancelled: Arc<AtomicBool>,
}

impl TimerFired {
    /// Creates a firing for the timer sharing `cancelled`.
    pub fn new(timer_id: TimerId, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            timer_id,
            cancelled,
        }
    }

    /// Returns the timer id.
    pub fn timer_id(&self) -> TimerId {
        self.timer_id
    }

    /// Returns true if the timer was cancelled; the firing must be dropped.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Schedules timers whose firings come back to the serialized context.
pub trait Scheduler: Send + Sync {
    /// Arranges for a [`TimerFired`] for `timer_id` after `delay`.
    fn enqueue_after_delay(&self, timer_id: TimerId, delay: Duration) -> DelayedOperation;
}

#[derive(Debug)]
struct PendingTimer {
    timer_id: TimerId,
    delay: Duration,
    cancelled: Arc<AtomicBool>,
}

/// A scheduler driven by hand, for deterministic tests.
///
/// Scheduled timers are recorded in order; [`fire`](Self::fire) hands out
/// the oldest one for a timer id, as the real context would after the delay.
#[derive(Debug, Clone, Default)]
pub struct ManualScheduler {
    pending: Arc<Mutex<Vec<PendingTimer>>>,
}

impl ManualScheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the delays of live timers for `timer_id`, oldest first.
    pub fn scheduled(&self, timer_id: TimerId) -> Vec<Duration> {
        self.pending
            .lock()
            .iter()
            .filter(|t| t.timer_id == timer_id && !t.cancelled.load(Ordering::SeqCst))
            .map(|t| t.delay)
            .collect()
    }

    /// Returns true if a live timer for `timer_id` is scheduled.
    pub fn has_pending(&self, timer_id: TimerId) -> bool {
        !self.scheduled(timer_id).is_empty()
    }

    /// Removes and returns the oldest timer for `timer_id`, cancelled or not.
    ///
    /// Use this to model a firing that was already queued when it got
    /// cancelled.
    pub fn take(&self, timer_id: TimerId) -> Option<TimerFired> {
        let mut pending = self.pending.lock();
        let index = pending.iter().position(|t| t.timer_id == timer_id)?;
        let timer = pending.remove(index);
        Some(TimerFired::new(timer.timer_id, timer.cancelled))
    }

    /// Removes and returns the oldest live timer for `timer_id`.
    pub fn fire(&self, timer_id: TimerId) -> Option<TimerFired> {
        let mut pending = self.pending.lock();
        pending.retain(|t| !t.cancelled.load(Ordering::SeqCst));
        let index = pending.iter().position(|t| t.timer_id == timer_id)?;
        let timer = pending.remove(index);
        Some(TimerFired::new(timer.timer_id, timer.cancelled))
    }
}

impl Scheduler for ManualScheduler {
    fn enqueue_after_delay(&self, timer_id: TimerId, delay: Duration) -> DelayedOperation {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.pending.lock().push(PendingTimer {
            timer_id,
            delay,
            cancelled: Arc::clone(&cancelled),
        });
        DelayedOperation::new(timer_id, cancelled, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_timer_is_not_fired() {
        let scheduler = ManualScheduler::new();
        let op = scheduler.enqueue_after_delay(TimerId::LruGarbageCollection, Duration::from_secs(1));
        assert!(scheduler.has_pending(TimerId::LruGarbageCollection));

        op.cancel();
        assert!(op.is_cancelled());
        assert!(!scheduler.has_pending(TimerId::LruGarbageCollection));
        assert!(scheduler.fire(TimerId::LruGarbageCollection).is_none());
    }

    #[test]
    fn queued_firing_observes_later_cancel() {
        let scheduler = ManualScheduler::new();
        let op = scheduler.enqueue_after_delay(TimerId::OnlineStateTimeout, Duration::from_secs(10));

        let fired = scheduler.take(TimerId::OnlineStateTimeout).unwrap();
        assert!(!fired.is_cancelled());

        op.cancel();
        assert!(fired.is_cancelled());
    }

    #[test]
    fn fires_oldest_first_per_timer_id() {
        let scheduler = ManualScheduler::new();
        let _a = scheduler.enqueue_after_delay(TimerId::LruGarbageCollection, Duration::from_secs(1));
        let _b = scheduler.enqueue_after_delay(TimerId::OnlineStateTimeout, Duration::from_secs(2));
        let _c = scheduler.enqueue_after_delay(TimerId::LruGarbageCollection, Duration::from_secs(3));

        assert_eq!(
            scheduler.scheduled(TimerId::LruGarbageCollection),
            vec![Duration::from_secs(1), Duration::from_secs(3)]
        );
        let fired = scheduler.fire(TimerId::LruGarbageCollection).unwrap();
        assert_eq!(fired.timer_id(), TimerId::LruGarbageCollection);
        assert_eq!(
            scheduler.scheduled(TimerId::LruGarbageCollection),
            vec![Duration::from_secs(3)]
        );
    }
}
