//! Automatic potion use
//!
//! Players register the consumables they want used for HP, CP and MP.
//! Each tick, every enabled resource below its threshold consumes the first
//! configured item the player still holds.

use smallvec::SmallVec;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::config::SchedulerConfig;
use crate::error::TaskError;
use crate::metrics::{ManagerKind, Metrics};
use crate::subject::{ObjectId, Subject};
use crate::task::{DeferredQueue, RecurringScheduler, SweepReport, TaskHandle, Verdict};

use super::start_periodic;

pub type ItemId = u32;

/// Per-resource item priority list, most entries hold a handful of items
pub type ItemList = SmallVec<[ItemId; 4]>;

// ============================================================================
// Resources And Item Lists
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Hp,
    Cp,
    Mp,
}

impl Resource {
    pub const ALL: [Resource; 3] = [Resource::Hp, Resource::Cp, Resource::Mp];
}

pub trait AutoUser: Subject {
    fn is_online(&self) -> bool;

    fn is_dead(&self) -> bool;

    /// Private store, restricted event or anything else that forbids item use
    fn is_blocked(&self) -> bool;

    /// Whether auto-use is switched on for `resource`
    fn is_enabled(&self, resource: Resource) -> bool;

    /// Current value over maximum, in `0.0..=1.0`
    fn ratio(&self, resource: Resource) -> f32;

    /// Ratio below which an item is used
    fn threshold(&self, resource: Resource) -> f32;

    fn holds(&self, item: ItemId) -> bool;

    fn use_item(&self, item: ItemId) -> Result<(), TaskError>;
}

/// Registered player and their configured items per resource
#[derive(Clone)]
pub struct AutoUseEntry {
    pub player: Arc<dyn AutoUser>,
    pub hp: ItemList,
    pub cp: ItemList,
    pub mp: ItemList,
}

impl AutoUseEntry {
    pub fn new(player: Arc<dyn AutoUser>) -> Self {
        Self {
            player,
            hp: ItemList::new(),
            cp: ItemList::new(),
            mp: ItemList::new(),
        }
    }

    pub fn items(&self, resource: Resource) -> &ItemList {
        match resource {
            Resource::Hp => &self.hp,
            Resource::Cp => &self.cp,
            Resource::Mp => &self.mp,
        }
    }

    fn items_mut(&mut self, resource: Resource) -> &mut ItemList {
        match resource {
            Resource::Hp => &mut self.hp,
            Resource::Cp => &mut self.cp,
            Resource::Mp => &mut self.mp,
        }
    }
}

// ============================================================================
// Auto-Use Manager
// ============================================================================

pub struct AutoUseManager {
    queue: DeferredQueue<AutoUseEntry>,
    period_ms: u64,
}

impl AutoUseManager {
    pub fn new(config: &SchedulerConfig, metrics: &Metrics) -> Self {
        Self {
            queue: DeferredQueue::new("auto_use", metrics.register("auto_use", ManagerKind::Queue)),
            period_ms: config.auto_use_period_ms,
        }
    }

    pub fn start(self: &Arc<Self>, scheduler: &dyn RecurringScheduler) -> Vec<TaskHandle> {
        start_periodic(scheduler, self, "auto_use", self.period_ms, self.queue.stats(), |m| {
            m.run_tick();
        })
        .into_iter()
        .collect()
    }

    /// Register `item` for `resource`. Items are tried in registration order.
    pub fn add_item(&self, player: Arc<dyn AutoUser>, resource: Resource, item: ItemId) {
        let id = player.object_id();
        self.queue.upsert_with(
            id,
            || AutoUseEntry::new(player),
            |entry| {
                let items = entry.items_mut(resource);
                if !items.contains(&item) {
                    items.push(item);
                }
            },
        );
    }

    /// Unregister `item`. The player leaves the queue once no item remains.
    pub fn remove_item(&self, id: ObjectId, resource: Resource, item: ItemId) {
        // Read-modify-write under the queue lock, a concurrent logout stays removed
        self.queue.update(id, |entry| {
            entry.items_mut(resource).retain(|i| *i != item);
            Resource::ALL.iter().any(|r| !entry.items(*r).is_empty())
        });
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

    pub fn run_tick(&self) -> Option<SweepReport> {
        let stats = self.queue.stats().clone();
        self.queue.sweep(|_, entry| {
            let player = &entry.player;
            if !player.is_online() || player.is_dead() || player.is_blocked() {
                return Ok(Verdict::Drop);
            }

            for resource in Resource::ALL {
                if !player.is_enabled(resource) || player.ratio(resource) >= player.threshold(resource) {
                    continue;
                }
                if let Some(item) = entry.items(resource).iter().find(|i| player.holds(**i)) {
                    player.use_item(*item)?;
                    stats.actions.fetch_add(1, Ordering::Relaxed);
                }
            }
            Ok(Verdict::Keep)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicBool;

    struct Player {
        id: ObjectId,
        blocked: AtomicBool,
        hp: Mutex<f32>,
        mp: Mutex<f32>,
        inventory: Mutex<Vec<ItemId>>,
        used: Mutex<Vec<ItemId>>,
    }

    impl Player {
        fn new(id: ObjectId, inventory: Vec<ItemId>) -> Arc<Self> {
            Arc::new(Self {
                id,
                blocked: AtomicBool::new(false),
                hp: Mutex::new(1.0),
                mp: Mutex::new(1.0),
                inventory: Mutex::new(inventory),
                used: Mutex::new(Vec::new()),
            })
        }
    }

    impl Subject for Player {
        fn object_id(&self) -> ObjectId {
            self.id
        }
    }

    impl AutoUser for Player {
        fn is_online(&self) -> bool {
            true
        }

        fn is_dead(&self) -> bool {
            false
        }

        fn is_blocked(&self) -> bool {
            self.blocked.load(Ordering::SeqCst)
        }

        fn is_enabled(&self, resource: Resource) -> bool {
            resource != Resource::Cp
        }

        fn ratio(&self, resource: Resource) -> f32 {
            match resource {
                Resource::Hp => *self.hp.lock(),
                Resource::Mp => *self.mp.lock(),
                Resource::Cp => 0.0,
            }
        }

        fn threshold(&self, _resource: Resource) -> f32 {
            0.5
        }

        fn holds(&self, item: ItemId) -> bool {
            self.inventory.lock().contains(&item)
        }

        fn use_item(&self, item: ItemId) -> Result<(), TaskError> {
            self.used.lock().push(item);
            Ok(())
        }
    }

    fn manager() -> AutoUseManager {
        AutoUseManager::new(&SchedulerConfig::default(), &Metrics::new())
    }

    #[test]
    fn test_uses_first_held_item_per_resource() {
        let manager = manager();
        let player = Player::new(1, vec![20, 21, 30]);
        manager.add_item(player.clone(), Resource::Hp, 10);
        manager.add_item(player.clone(), Resource::Hp, 20);
        manager.add_item(player.clone(), Resource::Hp, 21);
        manager.add_item(player.clone(), Resource::Mp, 30);
        manager.add_item(player.clone(), Resource::Cp, 40);

        manager.run_tick();
        assert!(player.used.lock().is_empty());

        *player.hp.lock() = 0.3;
        *player.mp.lock() = 0.1;
        manager.run_tick();
        assert_eq!(*player.used.lock(), vec![20, 30]);
    }

    #[test]
    fn test_blocked_player_dropped() {
        let manager = manager();
        let player = Player::new(2, vec![1]);
        manager.add_item(player.clone(), Resource::Hp, 1);
        player.blocked.store(true, Ordering::SeqCst);
        *player.hp.lock() = 0.1;

        manager.run_tick();
        assert!(manager.is_empty());
        assert!(player.used.lock().is_empty());
    }

    #[test]
    fn test_removing_last_item_unregisters() {
        let manager = manager();
        let player = Player::new(3, vec![]);
        manager.add_item(player.clone(), Resource::Hp, 1);
        manager.add_item(player.clone(), Resource::Mp, 2);

        manager.remove_item(3, Resource::Hp, 1);
        assert!(manager.contains(3));
        manager.remove_item(3, Resource::Mp, 2);
        assert!(!manager.contains(3));
    }

    #[test]
    fn test_item_edits_do_not_revive_logged_out_player() {
        let manager = manager();
        let player = Player::new(4, vec![1]);
        manager.add_item(player.clone(), Resource::Hp, 1);
        manager.add_item(player.clone(), Resource::Mp, 2);

        // Logout, then a late item edit from the same session
        assert!(manager.remove(4));
        manager.remove_item(4, Resource::Hp, 1);
        assert!(!manager.contains(4));
        assert!(manager.is_empty());
    }
}
