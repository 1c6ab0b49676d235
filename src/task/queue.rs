//! Single shared deferred-action queue
//!
//! Used where the population is modest: one map, one timer. Each tick walks a
//! snapshot of the entries, decides a [`Verdict`] per entry outside the lock
//! and settles it afterwards. Every insert stamps a fresh generation so a
//! verdict computed for an entry that was replaced or removed mid-tick is
//! discarded instead of clobbering the newer state.

use hashbrown::HashMap;
use parking_lot::Mutex;
use rustc_hash::FxBuildHasher;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, trace, warn};

use crate::error::TaskError;
use crate::metrics::ManagerStats;
use crate::subject::ObjectId;

/// Skip-if-running guard for a recurring tick.
///
/// Not a lock: a tick that finds the flag set simply does nothing.
#[derive(Debug, Default)]
pub struct BusyFlag(AtomicBool);

impl BusyFlag {
    pub fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Claim the flag, or `None` if a previous tick still holds it
    pub fn try_begin(&self) -> Option<BusyGuard<'_>> {
        self.0
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| BusyGuard(&self.0))
    }

    pub fn is_busy(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Clears the busy flag on drop
#[derive(Debug)]
pub struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Per-entry outcome of a tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict<E> {
    /// Leave the entry untouched
    Keep,
    /// Remove the entry
    Drop,
    /// Swap in new entry state (e.g. a rescheduled due-time)
    Replace(E),
}

/// Entry copied out of the queue for processing
#[derive(Debug, Clone)]
pub struct QueuedEntry<E> {
    pub id: ObjectId,
    pub generation: u64,
    pub entry: E,
}

/// Outcome of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub visited: usize,
    pub dropped: usize,
    pub replaced: usize,
    pub faults: usize,
}

struct Slot<E> {
    generation: u64,
    entry: E,
}

/// One shared map of subject id to entry state, processed by one timer
pub struct DeferredQueue<E> {
    name: String,
    entries: Mutex<HashMap<ObjectId, Slot<E>, FxBuildHasher>>,
    next_generation: AtomicU64,
    busy: BusyFlag,
    stats: Arc<ManagerStats>,
}

impl<E: Clone + Send + 'static> DeferredQueue<E> {
    pub fn new(name: impl Into<String>, stats: Arc<ManagerStats>) -> Self {
        Self {
            name: name.into(),
            entries: Mutex::new(HashMap::default()),
            next_generation: AtomicU64::new(1),
            busy: BusyFlag::new(),
            stats,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> &Arc<ManagerStats> {
        &self.stats
    }

    fn stamp(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Insert or overwrite. Returns true if the id was not present.
    pub fn insert(&self, id: ObjectId, entry: E) -> bool {
        let generation = self.stamp();
        let mut entries = self.entries.lock();
        let added = entries.insert(id, Slot { generation, entry }).is_none();
        self.stats.set_subjects(entries.len());
        added
    }

    /// Insert only if the id is not present. Returns true if inserted.
    pub fn insert_if_absent(&self, id: ObjectId, entry: E) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains_key(&id) {
            return false;
        }
        let generation = self.stamp();
        entries.insert(id, Slot { generation, entry });
        self.stats.set_subjects(entries.len());
        true
    }

    /// Remove an entry. No-op if absent.
    pub fn remove(&self, id: ObjectId) -> Option<E> {
        let mut entries = self.entries.lock();
        let removed = entries.remove(&id).map(|slot| slot.entry);
        self.stats.set_subjects(entries.len());
        removed
    }

    /// Edit an entry in place under the lock, creating it with `make` if absent.
    /// The edit stamps a new generation.
    pub fn upsert_with<M, F>(&self, id: ObjectId, make: M, edit: F)
    where
        M: FnOnce() -> E,
        F: FnOnce(&mut E),
    {
        let generation = self.stamp();
        let mut entries = self.entries.lock();
        let slot = entries.entry(id).or_insert_with(|| Slot {
            generation,
            entry: make(),
        });
        slot.generation = generation;
        edit(&mut slot.entry);
        self.stats.set_subjects(entries.len());
    }

    /// Edit a present entry under the lock. `edit` returns false to remove it.
    /// Returns false if the id was absent.
    pub fn update<F>(&self, id: ObjectId, edit: F) -> bool
    where
        F: FnOnce(&mut E) -> bool,
    {
        let generation = self.stamp();
        let mut entries = self.entries.lock();
        let Some(slot) = entries.get_mut(&id) else {
            return false;
        };
        slot.generation = generation;
        if !edit(&mut slot.entry) {
            entries.remove(&id);
        }
        self.stats.set_subjects(entries.len());
        true
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.entries.lock().contains_key(&id)
    }

    pub fn get(&self, id: ObjectId) -> Option<E> {
        self.entries.lock().get(&id).map(|slot| slot.entry.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        entries.clear();
        self.stats.set_subjects(0);
    }

    /// Copy every entry out for processing without holding the lock
    pub fn snapshot(&self) -> Vec<QueuedEntry<E>> {
        self.entries
            .lock()
            .iter()
            .map(|(id, slot)| QueuedEntry {
                id: *id,
                generation: slot.generation,
                entry: slot.entry.clone(),
            })
            .collect()
    }

    /// Apply a verdict if the entry is still the generation it was computed for
    pub fn settle(&self, id: ObjectId, generation: u64, verdict: Verdict<E>) -> bool {
        if matches!(verdict, Verdict::Keep) {
            return false;
        }

        let mut entries = self.entries.lock();
        let current = entries.get(&id).map(|slot| slot.generation);
        if current != Some(generation) {
            trace!("{}: stale verdict for {} ignored", self.name, id);
            return false;
        }

        match verdict {
            Verdict::Keep => {}
            Verdict::Drop => {
                entries.remove(&id);
            }
            Verdict::Replace(entry) => {
                entries.insert(id, Slot { generation, entry });
            }
        }
        self.stats.set_subjects(entries.len());
        true
    }

    /// Claim the busy flag for a hand-written tick. Counts a skipped tick when
    /// the previous one is still running.
    pub fn try_begin(&self) -> Option<BusyGuard<'_>> {
        let guard = self.busy.try_begin();
        if guard.is_none() {
            self.stats.skipped_ticks.fetch_add(1, Ordering::Relaxed);
            trace!("{}: previous tick still running, skipping", self.name);
        }
        guard
    }

    pub fn is_busy(&self) -> bool {
        self.busy.is_busy()
    }

    /// Log and count a per-entry fault
    pub fn record_fault(&self, id: ObjectId, e: &TaskError) {
        self.stats.faults.fetch_add(1, Ordering::Relaxed);
        if matches!(e, TaskError::Panicked(_)) {
            error!("{}: dropping {}: {}", self.name, id, e);
        } else {
            warn!("{}: dropping {}: {}", self.name, id, e);
        }
    }

    /// Visit every entry once and settle the verdicts.
    ///
    /// `Err` and panics drop the entry. Returns `None` if the tick was skipped
    /// because the previous one is still running.
    pub fn sweep<F>(&self, mut visit: F) -> Option<SweepReport>
    where
        F: FnMut(ObjectId, &E) -> Result<Verdict<E>, TaskError>,
    {
        let _guard = self.try_begin()?;
        let started = Instant::now();
        let mut report = SweepReport::default();

        for QueuedEntry { id, generation, entry } in self.snapshot() {
            report.visited += 1;

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| visit(id, &entry)))
                .unwrap_or_else(|payload| Err(TaskError::from_panic(payload)));

            let verdict = match outcome {
                Ok(verdict) => verdict,
                Err(e) => {
                    report.faults += 1;
                    self.record_fault(id, &e);
                    Verdict::Drop
                }
            };

            let is_drop = matches!(verdict, Verdict::Drop);
            if self.settle(id, generation, verdict) {
                if is_drop {
                    report.dropped += 1;
                } else {
                    report.replaced += 1;
                }
            }
        }

        if report.dropped > 0 {
            self.stats
                .released
                .fetch_add(report.dropped as u64, Ordering::Relaxed);
        }
        self.stats.record_tick(started.elapsed());
        Some(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ManagerKind;

    fn queue() -> DeferredQueue<u64> {
        DeferredQueue::new("test", ManagerStats::detached("test", ManagerKind::Queue))
    }

    #[test]
    fn test_busy_flag_is_non_reentrant() {
        let flag = BusyFlag::new();
        let guard = flag.try_begin();
        assert!(guard.is_some());
        assert!(flag.is_busy());
        assert!(flag.try_begin().is_none());

        drop(guard);
        assert!(!flag.is_busy());
        assert!(flag.try_begin().is_some());
    }

    #[test]
    fn test_sweep_skipped_while_busy() {
        let q = queue();
        q.insert(1, 10);

        let guard = q.try_begin();
        assert!(guard.is_some());
        let mut visited = 0;
        let report = q.sweep(|_, _| {
            visited += 1;
            Ok(Verdict::Keep)
        });
        assert!(report.is_none());
        assert_eq!(visited, 0);
        assert_eq!(q.stats().skipped_ticks.load(Ordering::Relaxed), 1);

        drop(guard);
        assert!(q.sweep(|_, _| Ok(Verdict::Keep)).is_some());
    }

    #[test]
    fn test_verdicts_apply() {
        let q = queue();
        q.insert(1, 100);
        q.insert(2, 200);
        q.insert(3, 300);

        let report = q
            .sweep(|id, due| match id {
                1 => Ok(Verdict::Drop),
                2 => Ok(Verdict::Replace(due + 50)),
                _ => Ok(Verdict::Keep),
            })
            .unwrap();

        assert_eq!(report.visited, 3);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.replaced, 1);
        assert!(!q.contains(1));
        assert_eq!(q.get(2), Some(250));
        assert_eq!(q.get(3), Some(300));
        assert_eq!(q.stats().subjects.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_reinsert_during_sweep_wins() {
        let q = queue();
        q.insert(1, 100);

        q.sweep(|id, _| {
            // A callback re-registers the same subject before the verdict lands
            q.insert(id, 999);
            Ok(Verdict::Drop)
        })
        .unwrap();

        assert_eq!(q.get(1), Some(999));
    }

    #[test]
    fn test_faults_drop_entry() {
        let q = queue();
        q.insert(1, 1);
        q.insert(2, 2);
        q.insert(3, 3);

        let report = q
            .sweep(|id, _| match id {
                1 => Err(TaskError::fault("bad entry")),
                2 => panic!("entry exploded"),
                _ => Ok(Verdict::Keep),
            })
            .unwrap();

        assert_eq!(report.faults, 2);
        assert_eq!(q.len(), 1);
        assert!(q.contains(3));
        assert_eq!(q.stats().faults.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_insert_if_absent_and_remove() {
        let q = queue();
        assert!(q.insert_if_absent(1, 5));
        assert!(!q.insert_if_absent(1, 6));
        assert_eq!(q.get(1), Some(5));

        assert_eq!(q.remove(1), Some(5));
        assert_eq!(q.remove(1), None);
        assert!(q.is_empty());
    }

    #[test]
    fn test_update_edits_in_place() {
        let q = queue();
        assert!(!q.update(1, |v| {
            *v += 1;
            true
        }));
        assert!(q.is_empty());

        q.upsert_with(1, || 10, |v| *v += 1);
        q.upsert_with(1, || 99, |v| *v += 1);
        assert_eq!(q.get(1), Some(12));

        assert!(q.update(1, |_| false));
        assert!(!q.contains(1));
        assert_eq!(q.stats().subjects.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_update_during_sweep_discards_verdict() {
        let q = queue();
        q.insert(1, 100);

        q.sweep(|id, _| {
            q.update(id, |v| {
                *v = 500;
                true
            });
            Ok(Verdict::Drop)
        })
        .unwrap();

        assert_eq!(q.get(1), Some(500));
    }
}
