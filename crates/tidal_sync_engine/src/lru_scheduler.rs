//! Periodic LRU garbage collection.

use crate::lru::{LruGarbageCollector, LruResults};
use crate::persistence::Persistence;
use crate::timer::{DelayedOperation, Scheduler, TimerId};
use tracing::{debug, warn};

/// Runs garbage collection on a timer.
///
/// The first pass happens `initial_delay` after [`start`](Self::start); each
/// later pass `regular_delay` after the previous one finished.
#[derive(Debug)]
pub struct LruScheduler {
    garbage_collector: LruGarbageCollector,
    gc_task: Option<DelayedOperation>,
    has_run: bool,
}

impl LruScheduler {
    /// Creates a stopped scheduler.
    pub fn new(garbage_collector: LruGarbageCollector) -> Self {
        Self {
            garbage_collector,
            gc_task: None,
            has_run: false,
        }
    }

    /// Schedules the first pass, unless collection is disabled.
    pub fn start(&mut self, scheduler: &dyn Scheduler) {
        if self.garbage_collector.params().is_disabled() {
            debug!("LRU garbage collection disabled");
            return;
        }
        self.schedule_gc(scheduler);
    }

    /// Cancels the scheduled pass, including one already queued.
    pub fn stop(&mut self) {
        if let Some(task) = self.gc_task.take() {
            task.cancel();
        }
    }

    /// Returns true while a pass is scheduled.
    pub fn is_started(&self) -> bool {
        self.gc_task.is_some()
    }

    /// Returns true once a pass has run.
    pub fn has_run(&self) -> bool {
        self.has_run
    }

    /// Runs a pass and schedules the next one.
    ///
    /// Called when the [`TimerId::LruGarbageCollection`] timer fires.
    ///
    /// What follows a failed pass is a chosen policy, not a derived one: the
    /// error is logged at warn, the pass yields `None` and the next pass keeps
    /// the regular delay. A different policy, such as retrying sooner or
    /// stopping collection, replaces the `Err` arm here; callers already see
    /// the skip through the `None` result.
    pub fn run(
        &mut self,
        persistence: &dyn Persistence,
        scheduler: &dyn Scheduler,
    ) -> Option<LruResults> {
        self.gc_task = None;
        self.has_run = true;

        let results = match persistence.collect_garbage(&self.garbage_collector) {
            Ok(results) => {
                debug!(
                    did_run = results.did_run,
                    targets_removed = results.targets_removed,
                    documents_removed = results.documents_removed,
                    "LRU garbage collection pass complete"
                );
                Some(results)
            }
            Err(err) => {
                warn!(error = %err, "Ignoring failure during LRU garbage collection");
                None
            }
        };

        self.schedule_gc(scheduler);
        results
    }

    fn schedule_gc(&mut self, scheduler: &dyn Scheduler) {
        hard_assert!(self.gc_task.is_none(), "LRU garbage collection already scheduled");
        let params = self.garbage_collector.params();
        let delay = if self.has_run {
            params.regular_delay
        } else {
            params.initial_delay
        };
        debug!(delay_ms = delay.as_millis() as u64, "Scheduling LRU garbage collection");
        self.gc_task = Some(scheduler.enqueue_after_delay(TimerId::LruGarbageCollection, delay));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LruParams;
    use crate::error::{SyncError, SyncResult};
    use crate::timer::ManualScheduler;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingPersistence {
        runs: Mutex<usize>,
        fail: bool,
    }

    impl Persistence for CountingPersistence {
        fn garbage_collector(&self) -> LruGarbageCollector {
            LruGarbageCollector::new(LruParams::default())
        }

        fn collect_garbage(&self, _collector: &LruGarbageCollector) -> SyncResult<LruResults> {
            *self.runs.lock() += 1;
            if self.fail {
                Err(SyncError::persistence("disk unavailable"))
            } else {
                Ok(LruResults::did_not_run())
            }
        }

        fn shutdown(&self) {}
    }

    fn params() -> LruParams {
        LruParams::default().with_delays(Duration::from_secs(60), Duration::from_secs(300))
    }

    #[test]
    fn first_pass_uses_initial_delay_then_regular() {
        let timers = ManualScheduler::new();
        let persistence = CountingPersistence::default();
        let mut scheduler = LruScheduler::new(LruGarbageCollector::new(params()));

        scheduler.start(&timers);
        assert!(scheduler.is_started());
        assert_eq!(
            timers.scheduled(TimerId::LruGarbageCollection),
            vec![Duration::from_secs(60)]
        );

        timers.fire(TimerId::LruGarbageCollection).unwrap();
        scheduler.run(&persistence, &timers);
        assert!(scheduler.has_run());
        assert_eq!(*persistence.runs.lock(), 1);
        assert_eq!(
            timers.scheduled(TimerId::LruGarbageCollection),
            vec![Duration::from_secs(300)]
        );
    }

    #[test]
    fn disabled_never_schedules() {
        let timers = ManualScheduler::new();
        let mut scheduler = LruScheduler::new(LruGarbageCollector::new(LruParams::disabled()));
        scheduler.start(&timers);
        assert!(!scheduler.is_started());
        assert!(!timers.has_pending(TimerId::LruGarbageCollection));
    }

    #[test]
    fn stop_cancels_queued_firing() {
        let timers = ManualScheduler::new();
        let mut scheduler = LruScheduler::new(LruGarbageCollector::new(params()));
        scheduler.start(&timers);

        let queued = timers.take(TimerId::LruGarbageCollection).unwrap();
        scheduler.stop();
        assert!(queued.is_cancelled());
        assert!(!scheduler.is_started());
    }

    #[test]
    fn failed_pass_still_reschedules() {
        let timers = ManualScheduler::new();
        let persistence = CountingPersistence {
            fail: true,
            ..Default::default()
        };
        let mut scheduler = LruScheduler::new(LruGarbageCollector::new(params()));
        scheduler.start(&timers);
        timers.fire(TimerId::LruGarbageCollection).unwrap();

        assert_eq!(scheduler.run(&persistence, &timers), None);
        assert!(scheduler.is_started());
        assert_eq!(
            timers.scheduled(TimerId::LruGarbageCollection),
            vec![Duration::from_secs(300)]
        );
    }
}
