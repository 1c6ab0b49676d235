//! Ground item auto-destroy
//!
//! Dropped items vanish after a per-class delay. A class with delay 0 is
//! never registered.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::debug;

use crate::config::ItemDestroyConfig;
use crate::metrics::{ManagerKind, Metrics};
use crate::subject::{ObjectId, Subject};
use crate::task::{DeferredQueue, RecurringScheduler, SweepReport, TaskHandle, Verdict};
use crate::util::clock::{Clock, Millis};

use super::start_periodic;

// ============================================================================
// Ground Items
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemClass {
    Herb,
    Equipment,
    Other,
}

pub trait GroundItem: Subject {
    fn is_on_ground(&self) -> bool;

    fn item_class(&self) -> ItemClass;

    /// Time the item hit the ground
    fn dropped_at(&self) -> Millis;

    /// Remove the item from the world
    fn destroy(&self);
}

// ============================================================================
// Item Destroy Manager
// ============================================================================

pub struct ItemDestroyManager {
    queue: DeferredQueue<Arc<dyn GroundItem>>,
    clock: Arc<dyn Clock>,
    config: ItemDestroyConfig,
}

impl ItemDestroyManager {
    pub fn new(config: &ItemDestroyConfig, clock: Arc<dyn Clock>, metrics: &Metrics) -> Self {
        Self {
            queue: DeferredQueue::new(
                "item_destroy",
                metrics.register("item_destroy", ManagerKind::Queue),
            ),
            clock,
            config: *config,
        }
    }

    pub fn start(self: &Arc<Self>, scheduler: &dyn RecurringScheduler) -> Vec<TaskHandle> {
        start_periodic(
            scheduler,
            self,
            "item_destroy",
            self.config.period_ms,
            self.queue.stats(),
            |m| {
                m.run_tick();
            },
        )
        .into_iter()
        .collect()
    }

    /// Lifetime on the ground for `class`, 0 if never destroyed
    pub fn delay_for(&self, class: ItemClass) -> Millis {
        match class {
            ItemClass::Herb => self.config.herb_delay_ms,
            ItemClass::Equipment => self.config.equipment_delay_ms,
            ItemClass::Other => self.config.item_delay_ms,
        }
    }

    /// Track a dropped item. Returns false if its class never expires.
    pub fn add(&self, item: Arc<dyn GroundItem>) -> bool {
        if self.delay_for(item.item_class()) == 0 {
            return false;
        }
        self.queue.insert(item.object_id(), item)
    }

    /// Picked up or otherwise gone
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
        let now = self.clock.now_millis();
        self.queue.sweep(|id, item| {
            // Picked up or already gone
            if !item.is_on_ground() {
                return Ok(Verdict::Drop);
            }

            // Lifetime depends on the class, expiry is strict

            let delay = self.delay_for(item.item_class());
            if now.saturating_sub(item.dropped_at()) > delay {
                item.destroy();
                self.queue.stats().actions.fetch_add(1, Ordering::Relaxed);
                debug!("Destroyed ground item {}", id);
                return Ok(Verdict::Drop);
            }
            Ok(Verdict::Keep)
        })
    }
}
