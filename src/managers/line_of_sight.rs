//! Line-of-sight refresh
//!
//! Every registered observer rebuilds the set of creatures it can see once
//! per period. Refreshes are independent, so the whole membership is fanned
//! out over the rayon pool.

use rayon::prelude::*;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use crate::error::TaskError;
use crate::metrics::{ManagerKind, Metrics};
use crate::subject::{ObjectId, Subject};
use crate::task::{DeferredQueue, QueuedEntry, RecurringScheduler, TaskHandle, Verdict};

use super::start_periodic;

pub trait Observer: Subject {
    fn is_spawned(&self) -> bool;

    /// Recompute which creatures this observer sees
    fn refresh_visible(&self) -> Result<(), TaskError>;
}

pub struct LineOfSightManager {
    queue: DeferredQueue<Arc<dyn Observer>>,
    period_ms: u64,
}

impl LineOfSightManager {
    pub fn new(period_ms: u64, metrics: &Metrics) -> Self {
        Self {
            queue: DeferredQueue::new(
                "line_of_sight",
                metrics.register("line_of_sight", ManagerKind::Queue),
            ),
            period_ms,
        }
    }

    pub fn start(self: &Arc<Self>, scheduler: &dyn RecurringScheduler) -> Vec<TaskHandle> {
        start_periodic(
            scheduler,
            self,
            "line_of_sight",
            self.period_ms,
            self.queue.stats(),
            |m| {
                m.run_tick();
            },
        )
        .into_iter()
        .collect()
    }

    pub fn add(&self, observer: Arc<dyn Observer>) -> bool {
        self.queue.insert_if_absent(observer.object_id(), observer)
    }

    pub fn remove(&self, id: ObjectId) -> bool {
        self.queue.remove(id).is_some()
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.queue.contains(id)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Refresh every spawned observer in parallel. Returns how many refreshed.
    pub fn run_tick(&self) -> usize {
        let Some(_guard) = self.queue.try_begin() else {
            return 0;
        };
        let started = Instant::now();
        let stats = self.queue.stats();

        let outcomes: Vec<(QueuedEntry<Arc<dyn Observer>>, Result<bool, TaskError>)> = self
            .queue
            .snapshot()
            .into_par_iter()
            .map(|queued| {
                let observer = &queued.entry;
                let outcome = if observer.is_spawned() {
                    panic::catch_unwind(AssertUnwindSafe(|| observer.refresh_visible()))
                        .unwrap_or_else(|payload| Err(TaskError::from_panic(payload)))
                        .map(|_| true)
                } else {
                    Ok(false)
                };
                (queued, outcome)
            })
            .collect();

        let mut refreshed = 0;
        for (queued, outcome) in outcomes {
            match outcome {
                Ok(true) => refreshed += 1,
                Ok(false) => {
                    if self.queue.settle(queued.id, queued.generation, Verdict::Drop) {
                        stats.released.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(e) => {
                    self.queue.record_fault(queued.id, &e);
                    self.queue.settle(queued.id, queued.generation, Verdict::Drop);
                }
            }
        }

        stats.actions.fetch_add(refreshed as u64, Ordering::Relaxed);
        stats.record_tick(started.elapsed());
        refreshed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    struct Watcher {
        id: ObjectId,
        spawned: AtomicBool,
        failing: AtomicBool,
        refreshes: AtomicUsize,
    }

    impl Watcher {
        fn new(id: ObjectId) -> Arc<Self> {
            Arc::new(Self {
                id,
                spawned: AtomicBool::new(true),
                failing: AtomicBool::new(false),
                refreshes: AtomicUsize::new(0),
            })
        }
    }

    impl Subject for Watcher {
        fn object_id(&self) -> ObjectId {
            self.id
        }
    }

    impl Observer for Watcher {
        fn is_spawned(&self) -> bool {
            self.spawned.load(Ordering::SeqCst)
        }

        fn refresh_visible(&self) -> Result<(), TaskError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(TaskError::fault("region not loaded"));
            }
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_refreshes_every_spawned_observer() {
        let manager = LineOfSightManager::new(1000, &Metrics::new());
        let watchers: Vec<_> = (0..64).map(Watcher::new).collect();
        for w in &watchers {
            manager.add(w.clone());
        }

        assert_eq!(manager.run_tick(), 64);
        assert!(watchers.iter().all(|w| w.refreshes.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn test_despawned_and_failing_dropped() {
        let manager = LineOfSightManager::new(1000, &Metrics::new());
        let gone = Watcher::new(1);
        let broken = Watcher::new(2);
        let fine = Watcher::new(3);
        gone.spawned.store(false, Ordering::SeqCst);
        broken.failing.store(true, Ordering::SeqCst);
        manager.add(gone);
        manager.add(broken);
        manager.add(fine);

        assert_eq!(manager.run_tick(), 1);
        assert_eq!(manager.len(), 1);
        assert!(manager.contains(3));
    }
}
