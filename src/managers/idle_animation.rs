//! Random idle animations
//!
//! Spawned creatures with idle animations play one at a random interval
//! when they have nothing else to do.

use rand::Rng;
use std::sync::Arc;

use crate::config::IdleAnimationConfig;
use crate::metrics::{ManagerKind, Metrics};
use crate::subject::{ObjectId, Subject};
use crate::task::{DeferredQueue, RecurringScheduler, SweepReport, TaskHandle, Verdict};
use crate::util::clock::{Clock, Millis};

use super::start_periodic;

pub trait Animated: Subject {
    fn is_spawned(&self) -> bool;

    /// Not dead, not moving, not fighting and not locked in an action
    fn is_idle(&self) -> bool;

    fn play_idle_animation(&self);
}

#[derive(Clone)]
pub struct AnimationEntry {
    pub subject: Arc<dyn Animated>,
    pub next_at: Millis,
}

pub struct IdleAnimationManager {
    queue: DeferredQueue<AnimationEntry>,
    clock: Arc<dyn Clock>,
    period_ms: u64,
    min_interval_ms: u64,
    max_interval_ms: u64,
}

impl IdleAnimationManager {
    pub fn new(config: &IdleAnimationConfig, clock: Arc<dyn Clock>, metrics: &Metrics) -> Self {
        Self {
            queue: DeferredQueue::new(
                "idle_animation",
                metrics.register("idle_animation", ManagerKind::Queue),
            ),
            clock,
            period_ms: config.period_ms,
            min_interval_ms: config.min_interval_ms,
            max_interval_ms: config.max_interval_ms.max(config.min_interval_ms),
        }
    }

    pub fn start(self: &Arc<Self>, scheduler: &dyn RecurringScheduler) -> Vec<TaskHandle> {
        start_periodic(
            scheduler,
            self,
            "idle_animation",
            self.period_ms,
            self.queue.stats(),
            |m| {
                m.run_tick();
            },
        )
        .into_iter()
        .collect()
    }

    fn next_fire(&self, now: Millis) -> Millis {
        now + rand::thread_rng().gen_range(self.min_interval_ms..=self.max_interval_ms)
    }

    pub fn add(&self, subject: Arc<dyn Animated>) -> bool {
        let next_at = self.next_fire(self.clock.now_millis());
        self.queue
            .insert_if_absent(subject.object_id(), AnimationEntry { subject, next_at })
    }

    pub fn remove(&self, id: ObjectId) -> bool {
        self.queue.remove(id).is_some()
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.queue.contains(id)
    }

    /// Next scheduled animation time of `id`
    pub fn next_at(&self, id: ObjectId) -> Option<Millis> {
        self.queue.get(id).map(|entry| entry.next_at)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn run_tick(&self) -> Option<SweepReport> {
        let now = self.clock.now_millis();
        self.queue.sweep(|_, entry| {
            if !entry.subject.is_spawned() {
                return Ok(Verdict::Drop);
            }
            if now < entry.next_at {
                return Ok(Verdict::Keep);
            }

            // A busy subject skips this turn but still gets a new draw
            if entry.subject.is_idle() {
                entry.subject.play_idle_animation();
            }
            Ok(Verdict::Replace(AnimationEntry {
                subject: entry.subject.clone(),
                next_at: self.next_fire(now),
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::util::clock::ManualClock;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Npc {
        id: ObjectId,
        spawned: AtomicBool,
        idle: AtomicBool,
        animations: AtomicUsize,
    }

    impl Npc {
        fn new(id: ObjectId) -> Arc<Self> {
            Arc::new(Self {
                id,
                spawned: AtomicBool::new(true),
                idle: AtomicBool::new(true),
                animations: AtomicUsize::new(0),
            })
        }
    }

    impl Subject for Npc {
        fn object_id(&self) -> ObjectId {
            self.id
        }
    }

    impl Animated for Npc {
        fn is_spawned(&self) -> bool {
            self.spawned.load(Ordering::SeqCst)
        }

        fn is_idle(&self) -> bool {
            self.idle.load(Ordering::SeqCst)
        }

        fn play_idle_animation(&self) {
            self.animations.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn setup() -> (Arc<ManualClock>, IdleAnimationManager) {
        let clock = Arc::new(ManualClock::new(1_000));
        let manager = IdleAnimationManager::new(
            &SchedulerConfig::default().idle_animation,
            clock.clone(),
            &Metrics::new(),
        );
        (clock, manager)
    }

    #[test]
    fn test_next_fire_within_jitter_window() {
        let (_, manager) = setup();
        for id in 0..200 {
            manager.add(Npc::new(id));
            let next = manager.next_at(id).unwrap();
            assert!((6_000..=61_000).contains(&next), "next_at {} out of range", next);
        }
    }

    #[test]
    fn test_animates_when_due_and_reschedules() {
        let (clock, manager) = setup();
        let npc = Npc::new(1);
        manager.add(npc.clone());
        let due = manager.next_at(1).unwrap();

        clock.set(due - 1);
        manager.run_tick();
        assert_eq!(npc.animations.load(Ordering::SeqCst), 0);

        clock.set(due);
        manager.run_tick();
        assert_eq!(npc.animations.load(Ordering::SeqCst), 1);
        assert!(manager.next_at(1).unwrap() >= due + 5_000);
    }

    #[test]
    fn test_busy_subject_still_rescheduled() {
        let (clock, manager) = setup();
        let npc = Npc::new(2);
        npc.idle.store(false, Ordering::SeqCst);
        manager.add(npc.clone());
        let due = manager.next_at(2).unwrap();

        clock.set(due);
        manager.run_tick();
        assert_eq!(npc.animations.load(Ordering::SeqCst), 0);
        assert!(manager.next_at(2).unwrap() > due);
    }

    #[test]
    fn test_despawned_dropped() {
        let (_, manager) = setup();
        let npc = Npc::new(3);
        manager.add(npc.clone());
        npc.spawned.store(false, Ordering::SeqCst);

        manager.run_tick();
        assert!(manager.is_empty());
    }
}
