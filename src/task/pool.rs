//! Sharded pool scheduler
//!
//! A [`PoolSet`] spreads a growing population over bounded [`Pool`]s, each with
//! its own recurring timer, so iteration cost is spread over the runtime's
//! worker threads instead of one hot collection.
//!
//! - `add` fills the first pool with room, or creates a pool and its timer
//! - Pools are created lazily and never merged or shrunk
//! - A subject lives in at most one pool of a set
//! - One failing subject never stops the rest of its pool's tick

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxBuildHasher;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::error::TaskError;
use crate::metrics::ManagerStats;
use crate::subject::{ObjectId, Subject};
use crate::task::recurring::{Job, RecurringScheduler, TaskHandle};
use crate::util::clock::{Clock, Millis};

type MemberMap<T> = HashMap<ObjectId, Arc<T>, FxBuildHasher>;

/// What to do with a subject after its update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    /// Stay in the pool for the next tick
    Keep,
    /// Leave the pool now
    Release,
}

/// Per-subject update for one behavior category
pub trait PoolWorker<T: ?Sized>: Send + Sync + 'static {
    /// Advance one subject. `Err` drops the subject like a release, minus
    /// the `on_released` hook.
    fn update(&self, subject: &Arc<T>, now: Millis) -> Result<Retention, TaskError>;

    /// Runs after a voluntary release has taken the subject out of its pool,
    /// so terminal callbacks may register the subject again.
    fn on_released(&self, _subject: &Arc<T>, _now: Millis) {}
}

/// Outcome of one pool tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub updated: usize,
    pub released: usize,
    pub faults: usize,
}

/// Bounded group of subjects sharing one recurring timer
pub struct Pool<T: ?Sized> {
    index: usize,
    members: Mutex<MemberMap<T>>,
    task: Mutex<Option<TaskHandle>>,
}

impl<T: ?Sized + Subject> Pool<T> {
    fn new(index: usize) -> Self {
        Self {
            index,
            members: Mutex::new(MemberMap::default()),
            task: Mutex::new(None),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.lock().is_empty()
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.members.lock().contains_key(&id)
    }

    /// True while `subject` is still the exact entry stored under `id`
    fn is_current(&self, id: ObjectId, subject: &Arc<T>) -> bool {
        self.members
            .lock()
            .get(&id)
            .map_or(false, |s| Arc::ptr_eq(s, subject))
    }

    fn try_insert(&self, subject: &Arc<T>, capacity: usize) -> bool {
        let mut members = self.members.lock();
        if members.len() >= capacity {
            return false;
        }
        members.insert(subject.object_id(), subject.clone());
        true
    }

    /// Insert or overwrite, returning the previous entry
    fn upsert(&self, subject: Arc<T>) -> Option<Arc<T>> {
        self.members.lock().insert(subject.object_id(), subject)
    }

    fn remove(&self, id: ObjectId) -> bool {
        self.members.lock().remove(&id).is_some()
    }

    /// Remove `id` only if it still maps to `expected`
    fn release(&self, id: ObjectId, expected: &Arc<T>) -> bool {
        let mut members = self.members.lock();
        match members.get(&id) {
            Some(current) if Arc::ptr_eq(current, expected) => {
                members.remove(&id);
                true
            }
            _ => false,
        }
    }

    /// Run one tick over a snapshot of the members.
    ///
    /// The lock is dropped before any worker code runs, so workers may call
    /// back into the owning set. Members removed after the snapshot are skipped.
    pub fn tick(&self, worker: &dyn PoolWorker<T>, now: Millis, category: &str) -> TickReport {
        let batch: Vec<(ObjectId, Arc<T>)> = self
            .members
            .lock()
            .iter()
            .map(|(id, s)| (*id, s.clone()))
            .collect();

        let mut report = TickReport::default();

        for (id, subject) in batch {
            if !self.is_current(id, &subject) {
                continue;
            }

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| worker.update(&subject, now)))
                .unwrap_or_else(|payload| Err(TaskError::from_panic(payload)));
            report.updated += 1;

            match outcome {
                Ok(Retention::Keep) => {}
                Ok(Retention::Release) => {
                    if self.release(id, &subject) {
                        report.released += 1;
                        let hook = panic::catch_unwind(AssertUnwindSafe(|| {
                            worker.on_released(&subject, now)
                        }));
                        if let Err(payload) = hook {
                            report.faults += 1;
                            error!(
                                "{}: release hook for {} panicked: {}",
                                category,
                                id,
                                TaskError::from_panic(payload)
                            );
                        }
                    }
                }
                Err(e) => {
                    report.faults += 1;
                    if matches!(e, TaskError::Panicked(_)) {
                        error!("{}: dropping {} from pool #{}: {}", category, id, self.index, e);
                    } else {
                        warn!("{}: dropping {} from pool #{}: {}", category, id, self.index, e);
                    }
                    if self.release(id, &subject) {
                        report.released += 1;
                    }
                }
            }
        }

        report
    }

    fn cancel_timer(&self) {
        if let Some(task) = self.task.lock().take() {
            task.cancel();
        }
    }
}

/// Static shape of one behavior category
#[derive(Debug, Clone)]
pub struct PoolSpec {
    pub category: String,
    pub capacity: usize,
    pub period: Duration,
}

impl PoolSpec {
    pub fn new(category: impl Into<String>, capacity: usize, period: Duration) -> Self {
        Self {
            category: category.into(),
            capacity: capacity.max(1),
            period,
        }
    }
}

/// State shared between the set and every pool timer
struct Shared<T: ?Sized> {
    category: String,
    worker: Arc<dyn PoolWorker<T>>,
    clock: Arc<dyn Clock>,
    stats: Arc<ManagerStats>,
    population: AtomicUsize,
}

impl<T: ?Sized + Subject> Shared<T> {
    fn run(&self, pool: &Pool<T>) -> TickReport {
        let started = Instant::now();
        let report = pool.tick(self.worker.as_ref(), self.clock.now_millis(), &self.category);

        if report.released > 0 {
            self.population.fetch_sub(report.released, Ordering::AcqRel);
            self.stats
                .released
                .fetch_add(report.released as u64, Ordering::Relaxed);
        }
        if report.faults > 0 {
            self.stats
                .faults
                .fetch_add(report.faults as u64, Ordering::Relaxed);
        }
        self.stats
            .set_subjects(self.population.load(Ordering::Acquire));
        self.stats.record_tick(started.elapsed());

        report
    }
}

/// Growable collection of pools for one behavior category
pub struct PoolSet<T: ?Sized> {
    capacity: usize,
    period: Duration,
    pools: RwLock<Vec<Arc<Pool<T>>>>,
    scheduler: Arc<dyn RecurringScheduler>,
    shared: Arc<Shared<T>>,
}

impl<T: ?Sized + Subject> PoolSet<T> {
    pub fn new(
        spec: PoolSpec,
        worker: Arc<dyn PoolWorker<T>>,
        scheduler: Arc<dyn RecurringScheduler>,
        clock: Arc<dyn Clock>,
        stats: Arc<ManagerStats>,
    ) -> Self {
        Self {
            capacity: spec.capacity,
            period: spec.period,
            pools: RwLock::new(Vec::new()),
            scheduler,
            shared: Arc::new(Shared {
                category: spec.category,
                worker,
                clock,
                stats,
                population: AtomicUsize::new(0),
            }),
        }
    }

    /// Add a subject unless some pool already holds it.
    /// Returns true if it was inserted.
    pub fn add(&self, subject: Arc<T>) -> bool {
        self.insert(subject, false)
    }

    /// Add a subject, overwriting the entry of a present one in place
    pub fn replace(&self, subject: Arc<T>) {
        self.insert(subject, true);
    }

    fn insert(&self, subject: Arc<T>, overwrite: bool) -> bool {
        let id = subject.object_id();
        let mut pools = self.pools.write();

        // Population is counted before the subject becomes visible to a
        // tick, a release can never be subtracted ahead of its add
        if let Some(pool) = pools.iter().find(|p| p.contains(id)) {
            if overwrite {
                self.grew();
                if pool.upsert(subject).is_some() {
                    self.shrank();
                }
            }
            return false;
        }

        self.grew();
        if pools.iter().any(|p| p.try_insert(&subject, self.capacity)) {
            return true;
        }

        let pool = Arc::new(Pool::new(pools.len()));
        pool.upsert(subject);
        self.start_timer(&pool);
        pools.push(pool);

        self.shared
            .stats
            .pools
            .store(pools.len() as u64, Ordering::Relaxed);
        true
    }

    fn grew(&self) {
        let count = self.shared.population.fetch_add(1, Ordering::AcqRel) + 1;
        self.shared.stats.set_subjects(count);
    }

    fn shrank(&self) {
        let count = self.shared.population.fetch_sub(1, Ordering::AcqRel) - 1;
        self.shared.stats.set_subjects(count);
    }

    fn start_timer(&self, pool: &Arc<Pool<T>>) {
        let name = format!("{}#{}", self.shared.category, pool.index());
        let shared = self.shared.clone();
        let tick_pool = pool.clone();
        let job: Job = Arc::new(move || {
            shared.run(&tick_pool);
        });

        match self.scheduler.schedule_at_fixed_rate(&name, self.period, job) {
            Ok(handle) => {
                info!(
                    "{}: started pool #{} (capacity {}, every {:?})",
                    self.shared.category,
                    pool.index(),
                    self.capacity,
                    self.period
                );
                *pool.task.lock() = Some(handle);
            }
            Err(e) => {
                self.shared
                    .stats
                    .schedule_failures
                    .fetch_add(1, Ordering::Relaxed);
                error!(
                    "{}: pool #{} has no timer and will not tick: {}",
                    self.shared.category,
                    pool.index(),
                    e
                );
            }
        }
    }

    /// Remove a subject. No-op if absent.
    pub fn remove(&self, subject: &T) -> bool {
        self.remove_id(subject.object_id())
    }

    pub fn remove_id(&self, id: ObjectId) -> bool {
        let pools = self.pools.read();
        for pool in pools.iter() {
            if pool.remove(id) {
                self.shrank();
                debug!("{}: removed {} from pool #{}", self.shared.category, id, pool.index());
                return true;
            }
        }
        false
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.pools.read().iter().any(|p| p.contains(id))
    }

    /// Current entry for `id`, if scheduled
    pub fn get(&self, id: ObjectId) -> Option<Arc<T>> {
        self.pools
            .read()
            .iter()
            .find_map(|p| p.members.lock().get(&id).cloned())
    }

    /// Index of the pool holding `id`
    pub fn pool_index_of(&self, id: ObjectId) -> Option<usize> {
        self.pools
            .read()
            .iter()
            .find(|p| p.contains(id))
            .map(|p| p.index())
    }

    /// Number of scheduled subjects
    pub fn len(&self) -> usize {
        self.shared.population.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pool_count(&self) -> usize {
        self.pools.read().len()
    }

    pub fn pool_sizes(&self) -> Vec<usize> {
        self.pools.read().iter().map(|p| p.len()).collect()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn category(&self) -> &str {
        &self.shared.category
    }

    pub fn stats(&self) -> &Arc<ManagerStats> {
        &self.shared.stats
    }

    /// Tick every pool once on the calling thread
    pub fn tick_all(&self) -> TickReport {
        let pools: Vec<Arc<Pool<T>>> = self.pools.read().clone();
        pools.iter().fold(TickReport::default(), |acc, pool| {
            let r = self.shared.run(pool);
            TickReport {
                updated: acc.updated + r.updated,
                released: acc.released + r.released,
                faults: acc.faults + r.faults,
            }
        })
    }

    /// Cancel every pool timer. Membership is left untouched.
    pub fn shutdown(&self) {
        for pool in self.pools.read().iter() {
            pool.cancel_timer();
        }
        debug!("{}: pool timers cancelled", self.shared.category);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ManagerKind;
    use crate::task::recurring::{ManualScheduler, TokioScheduler};
    use crate::util::clock::{ManualClock, SystemClock};
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct Mob {
        id: ObjectId,
        updates: AtomicUsize,
        released: AtomicUsize,
        finish: AtomicBool,
        fail: AtomicBool,
        explode: AtomicBool,
    }

    impl Mob {
        fn new(id: ObjectId) -> Arc<Self> {
            Arc::new(Self {
                id,
                ..Default::default()
            })
        }

        fn updates(&self) -> usize {
            self.updates.load(Ordering::SeqCst)
        }
    }

    impl Subject for Mob {
        fn object_id(&self) -> ObjectId {
            self.id
        }
    }

    struct MobWorker;

    impl PoolWorker<Mob> for MobWorker {
        fn update(&self, subject: &Arc<Mob>, _now: Millis) -> Result<Retention, TaskError> {
            subject.updates.fetch_add(1, Ordering::SeqCst);
            if subject.explode.load(Ordering::SeqCst) {
                panic!("mob {} exploded", subject.id);
            }
            if subject.fail.load(Ordering::SeqCst) {
                return Err(TaskError::fault("mob failure"));
            }
            if subject.finish.load(Ordering::SeqCst) {
                return Ok(Retention::Release);
            }
            Ok(Retention::Keep)
        }

        fn on_released(&self, subject: &Arc<Mob>, _now: Millis) {
            subject.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn setup(capacity: usize) -> (Arc<ManualScheduler>, PoolSet<Mob>) {
        let clock = Arc::new(ManualClock::new(0));
        let scheduler = Arc::new(ManualScheduler::new(clock.clone()));
        let set = PoolSet::new(
            PoolSpec::new("mob", capacity, Duration::from_millis(100)),
            Arc::new(MobWorker),
            scheduler.clone(),
            clock,
            ManagerStats::detached("mob", ManagerKind::Pool),
        );
        (scheduler, set)
    }

    #[test]
    fn test_pool_count_is_ceil() {
        let (scheduler, set) = setup(10);
        for id in 0..25 {
            assert!(set.add(Mob::new(id)));
        }

        assert_eq!(set.pool_count(), 3);
        assert_eq!(set.pool_sizes(), vec![10, 10, 5]);
        assert_eq!(scheduler.job_count(), 3);
        assert_eq!(set.len(), 25);

        let pools = set.pools.read();
        for id in 0..25 {
            let holders = pools.iter().filter(|p| p.contains(id)).count();
            assert_eq!(holders, 1, "subject {} must be in exactly one pool", id);
        }
    }

    #[test]
    fn test_exact_multiple_has_no_spare_pool() {
        let (_, set) = setup(5);
        for id in 0..20 {
            set.add(Mob::new(id));
        }
        assert_eq!(set.pool_count(), 4);
    }

    #[test]
    fn test_add_is_idempotent() {
        let (scheduler, set) = setup(10);
        let mob = Mob::new(1);

        assert!(set.add(mob.clone()));
        assert!(!set.add(mob.clone()));
        assert_eq!(set.len(), 1);
        assert_eq!(set.pool_sizes(), vec![1]);

        scheduler.advance(100);
        assert_eq!(mob.updates(), 1);
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let (_, set) = setup(10);
        set.add(Mob::new(1));

        assert!(!set.remove_id(99));
        assert!(!set.remove(&Mob::new(2)));
        assert_eq!(set.len(), 1);
        assert_eq!(set.pool_count(), 1);
    }

    #[test]
    fn test_removed_subject_is_not_updated() {
        let (scheduler, set) = setup(10);
        let mob = Mob::new(7);
        set.add(mob.clone());

        scheduler.advance(100);
        assert_eq!(mob.updates(), 1);

        assert!(set.remove(&mob));
        assert!(!set.remove(&mob));
        scheduler.advance(500);
        assert_eq!(mob.updates(), 1);
        assert!(set.is_empty());
    }

    #[test]
    fn test_faults_drop_only_the_faulty_subject() {
        let (scheduler, set) = setup(10);
        let healthy = Mob::new(1);
        let failing = Mob::new(2);
        let exploding = Mob::new(3);
        failing.fail.store(true, Ordering::SeqCst);
        exploding.explode.store(true, Ordering::SeqCst);

        set.add(healthy.clone());
        set.add(failing.clone());
        set.add(exploding.clone());

        scheduler.advance(100);
        assert_eq!(healthy.updates(), 1);
        assert!(!set.contains(2));
        assert!(!set.contains(3));
        assert_eq!(set.len(), 1);
        assert_eq!(set.stats().faults.load(Ordering::Relaxed), 2);

        // Timer survives and keeps ticking the rest
        scheduler.advance(100);
        assert_eq!(healthy.updates(), 2);
        assert_eq!(failing.updates(), 1);
        assert_eq!(exploding.updates(), 1);
        assert_eq!(failing.released.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_release_runs_hook_once() {
        let (scheduler, set) = setup(10);
        let mob = Mob::new(4);
        mob.finish.store(true, Ordering::SeqCst);
        set.add(mob.clone());

        scheduler.advance(300);
        assert_eq!(mob.updates(), 1);
        assert_eq!(mob.released.load(Ordering::SeqCst), 1);
        assert!(!set.contains(4));
    }

    #[test]
    fn test_sparse_pools_are_refilled_not_shrunk() {
        let (scheduler, set) = setup(2);
        for id in 0..4 {
            set.add(Mob::new(id));
        }
        set.remove_id(0);
        set.remove_id(1);
        assert_eq!(set.pool_sizes(), vec![0, 2]);

        set.add(Mob::new(10));
        assert_eq!(set.pool_index_of(10), Some(0));
        assert_eq!(set.pool_count(), 2);
        assert_eq!(scheduler.job_count(), 2);
    }

    #[test]
    fn test_replace_overwrites_in_place() {
        let (scheduler, set) = setup(10);
        let old = Mob::new(5);
        let new = Mob::new(5);
        set.add(old.clone());
        set.replace(new.clone());

        assert_eq!(set.len(), 1);
        scheduler.advance(100);
        assert_eq!(old.updates(), 0);
        assert_eq!(new.updates(), 1);
    }

    #[test]
    fn test_failed_timer_keeps_membership() {
        let (scheduler, set) = setup(10);
        scheduler.shutdown();

        assert!(set.add(Mob::new(1)));
        assert_eq!(set.pool_count(), 1);
        assert!(set.contains(1));
        assert_eq!(set.stats().schedule_failures.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_shutdown_cancels_timers() {
        let (scheduler, set) = setup(1);
        let mob = Mob::new(1);
        set.add(mob.clone());
        set.add(Mob::new(2));
        assert_eq!(scheduler.job_count(), 2);

        set.shutdown();
        scheduler.advance(1000);
        assert_eq!(scheduler.job_count(), 0);
        assert_eq!(mob.updates(), 0);
    }

    #[test]
    fn test_tick_all_runs_every_pool() {
        let (_, set) = setup(3);
        let mobs: Vec<_> = (0..7).map(Mob::new).collect();
        for p in &mobs {
            set.add(p.clone());
        }

        let report = set.tick_all();
        assert_eq!(report.updated, 7);
        assert!(mobs.iter().all(|p| p.updates() == 1));
    }

    #[test]
    fn test_release_and_readd_keep_population_exact() {
        let (scheduler, set) = setup(4);
        let mobs: Vec<_> = (0..10).map(Mob::new).collect();
        for m in &mobs {
            m.finish.store(true, Ordering::SeqCst);
            set.add(m.clone());
        }

        for _ in 0..5 {
            scheduler.advance(100);
            assert_eq!(set.len(), 0);
            for m in &mobs {
                set.add(m.clone());
            }
            set.replace(mobs[0].clone());
            assert_eq!(set.len(), 10);
            assert_eq!(set.pool_sizes().iter().sum::<usize>(), 10);
            assert_eq!(set.stats().subjects.load(Ordering::Relaxed), 10);
        }
    }

    // ========================================================================
    // Concurrent membership changes against live tokio timers
    // ========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_add_remove_during_ticks() {
        let scheduler = Arc::new(TokioScheduler::current().unwrap());
        let set: Arc<PoolSet<Mob>> = Arc::new(PoolSet::new(
            PoolSpec::new("mob", 16, Duration::from_millis(1)),
            Arc::new(MobWorker),
            scheduler.clone(),
            Arc::new(SystemClock::new()),
            ManagerStats::detached("mob", ManagerKind::Pool),
        ));

        // Four writers on disjoint id ranges; odd ids stay, even ids go
        let mut writers = Vec::new();
        for w in 0..4u32 {
            let set = set.clone();
            writers.push(tokio::spawn(async move {
                let mobs: Vec<_> = (w * 100..w * 100 + 50).map(Mob::new).collect();
                for round in 0..20 {
                    for m in &mobs {
                        set.add(m.clone());
                    }
                    tokio::task::yield_now().await;
                    for m in mobs.iter().filter(|m| m.id % 2 == 0 || round < 19) {
                        set.remove(m);
                    }
                    tokio::task::yield_now().await;
                }
                mobs
            }));
        }

        let mut all = Vec::new();
        for writer in writers {
            all.extend(writer.await.unwrap());
        }
        let (kept, removed): (Vec<_>, Vec<_>) = all.into_iter().partition(|m| m.id % 2 == 1);

        // Let any in-flight tick drain, then nothing removed may be touched
        tokio::time::sleep(Duration::from_millis(20)).await;
        let frozen: Vec<usize> = removed.iter().map(|m| m.updates()).collect();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(removed.iter().map(|m| m.updates()).collect::<Vec<_>>(), frozen);
        assert!(kept.iter().all(|m| m.updates() > 0));

        assert_eq!(set.len(), kept.len());
        assert_eq!(set.pool_sizes().iter().sum::<usize>(), kept.len());
        assert_eq!(set.stats().subjects.load(Ordering::Relaxed), kept.len() as u64);
        assert!(kept.iter().all(|m| set.contains(m.id)));

        set.shutdown();
        scheduler.shutdown();
    }
}
