//! Player auto-save
//!
//! Online players are persisted every interval. At most one player is
//! written per tick, the most overdue one first, so saves trickle out
//! instead of arriving in bursts.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::config::AutosaveConfig;
use crate::error::TaskError;
use crate::metrics::{ManagerKind, Metrics};
use crate::subject::{ObjectId, Subject};
use crate::task::{DeferredQueue, QueuedEntry, RecurringScheduler, TaskHandle, Verdict};
use crate::util::clock::{Clock, Millis};

use super::start_periodic;

pub trait Persistable: Subject {
    fn is_online(&self) -> bool;

    fn store(&self) -> Result<(), TaskError>;
}

#[derive(Clone)]
pub struct SaveEntry {
    pub subject: Arc<dyn Persistable>,
    pub due_at: Millis,
}

pub struct AutosaveManager {
    queue: DeferredQueue<SaveEntry>,
    clock: Arc<dyn Clock>,
    config: AutosaveConfig,
}

impl AutosaveManager {
    pub fn new(config: &AutosaveConfig, clock: Arc<dyn Clock>, metrics: &Metrics) -> Self {
        Self {
            queue: DeferredQueue::new("autosave", metrics.register("autosave", ManagerKind::Queue)),
            clock,
            config: *config,
        }
    }

    pub fn start(self: &Arc<Self>, scheduler: &dyn RecurringScheduler) -> Vec<TaskHandle> {
        start_periodic(
            scheduler,
            self,
            "autosave",
            self.config.period_ms,
            self.queue.stats(),
            |m| {
                m.run_tick();
            },
        )
        .into_iter()
        .collect()
    }

    /// First save one interval after login
    pub fn add(&self, subject: Arc<dyn Persistable>) -> bool {
        let due_at = self.clock.now_millis() + self.config.interval_ms;
        self.queue
            .insert_if_absent(subject.object_id(), SaveEntry { subject, due_at })
    }

    pub fn remove(&self, id: ObjectId) -> bool {
        self.queue.remove(id).is_some()
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.queue.contains(id)
    }

    pub fn due_at(&self, id: ObjectId) -> Option<Millis> {
        self.queue.get(id).map(|entry| entry.due_at)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drop offline players and save the most overdue one.
    /// Returns the id saved this tick.
    pub fn run_tick(&self) -> Option<ObjectId> {
        let _guard = self.queue.try_begin()?;
        let started = Instant::now();
        let now = self.clock.now_millis();
        let stats = self.queue.stats();

        let mut candidate: Option<QueuedEntry<SaveEntry>> = None;
        for queued in self.queue.snapshot() {
            if !queued.entry.subject.is_online() {
                if self.queue.settle(queued.id, queued.generation, Verdict::Drop) {
                    stats.released.fetch_add(1, Ordering::Relaxed);
                }
                continue;
            }
            let overdue = queued.entry.due_at <= now;
            let earlier = candidate
                .as_ref()
                .map_or(true, |c| queued.entry.due_at < c.entry.due_at);
            if overdue && earlier {
                candidate = Some(queued);
            }
        }

        let saved = candidate.and_then(|QueuedEntry { id, generation, entry }| {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| entry.subject.store()))
                .unwrap_or_else(|payload| Err(TaskError::from_panic(payload)));

            match outcome {
                Ok(()) => {
                    stats.actions.fetch_add(1, Ordering::Relaxed);
                    debug!("Auto-saved {}", id);
                    let next = SaveEntry {
                        subject: entry.subject,
                        due_at: now + self.config.interval_ms,
                    };
                    self.queue.settle(id, generation, Verdict::Replace(next));
                    Some(id)
                }
                Err(e) => {
                    self.queue.record_fault(id, &e);
                    self.queue.settle(id, generation, Verdict::Drop);
                    None
                }
            }
        });

        stats.record_tick(started.elapsed());
        saved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::util::clock::ManualClock;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    struct Character {
        id: ObjectId,
        online: AtomicBool,
        broken: AtomicBool,
        saves: AtomicUsize,
    }

    impl Character {
        fn new(id: ObjectId) -> Arc<Self> {
            Arc::new(Self {
                id,
                online: AtomicBool::new(true),
                broken: AtomicBool::new(false),
                saves: AtomicUsize::new(0),
            })
        }

        fn saves(&self) -> usize {
            self.saves.load(Ordering::SeqCst)
        }
    }

    impl Subject for Character {
        fn object_id(&self) -> ObjectId {
            self.id
        }
    }

    impl Persistable for Character {
        fn is_online(&self) -> bool {
            self.online.load(Ordering::SeqCst)
        }

        fn store(&self) -> Result<(), TaskError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(TaskError::persistence("connection refused"));
            }
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn setup() -> (Arc<ManualClock>, AutosaveManager) {
        let clock = Arc::new(ManualClock::new(0));
        let mut config = SchedulerConfig::default().autosave;
        config.interval_ms = 10_000;
        let manager = AutosaveManager::new(&config, clock.clone(), &Metrics::new());
        (clock, manager)
    }

    #[test]
    fn test_saves_one_per_tick_most_overdue_first() {
        let (clock, manager) = setup();
        let early = Character::new(1);
        manager.add(early.clone());
        clock.set(500);
        let late = Character::new(2);
        manager.add(late.clone());

        clock.set(9_999);
        assert_eq!(manager.run_tick(), None);

        clock.set(11_000);
        assert_eq!(manager.run_tick(), Some(1));
        assert_eq!(manager.due_at(1), Some(21_000));
        assert_eq!(late.saves(), 0);

        clock.set(12_000);
        assert_eq!(manager.run_tick(), Some(2));
        assert_eq!(manager.run_tick(), None);
        assert_eq!(early.saves(), 1);
        assert_eq!(late.saves(), 1);
    }

    #[test]
    fn test_offline_players_dropped() {
        let (clock, manager) = setup();
        let player = Character::new(3);
        manager.add(player.clone());
        player.online.store(false, Ordering::SeqCst);

        clock.set(20_000);
        assert_eq!(manager.run_tick(), None);
        assert!(manager.is_empty());
        assert_eq!(player.saves(), 0);
    }

    #[test]
    fn test_failed_save_drops_entry() {
        let (clock, manager) = setup();
        let player = Character::new(4);
        player.broken.store(true, Ordering::SeqCst);
        manager.add(player);

        clock.set(10_000);
        assert_eq!(manager.run_tick(), None);
        assert!(!manager.contains(4));
    }
}
