//! Buy-list restock
//!
//! Limited shop products refill at their restock time. The scan timer moves
//! expired products onto a pending channel and the drain timer restocks one
//! pending product per cycle, which spreads the persistence writes out.
//!
//! Every trip through the channel carries a ticket. A product is restocked
//! only while its ticket is still the one recorded for its id, so a removal
//! (or a removal followed by a re-add) voids whatever is already queued.

use crossbeam_channel::{unbounded, Receiver, Sender};
use hashbrown::HashMap;
use parking_lot::Mutex;
use rustc_hash::FxBuildHasher;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::config::RestockConfig;
use crate::error::TaskError;
use crate::metrics::{ManagerKind, ManagerStats, Metrics};
use crate::subject::{ObjectId, Subject};
use crate::task::{BusyFlag, DeferredQueue, RecurringScheduler, SweepReport, TaskHandle, Verdict};
use crate::util::clock::{Clock, Millis};

use super::start_periodic;

// ============================================================================
// Restockable Products
// ============================================================================

pub trait Restockable: Subject {
    /// Next time the product refills
    fn restock_at(&self) -> Millis;

    /// Refill the product and persist it
    fn restock(&self) -> Result<(), TaskError>;
}

// ============================================================================
// Pending Channel
// ============================================================================

/// Product on its way through the pending channel
struct PendingRestock {
    ticket: u64,
    product: Arc<dyn Restockable>,
}

pub struct RestockManager {
    due: DeferredQueue<Arc<dyn Restockable>>,
    pending_tx: Sender<PendingRestock>,
    pending_rx: Receiver<PendingRestock>,
    /// Live ticket per pending id; dropping the ticket cancels the restock
    pending: Mutex<HashMap<ObjectId, u64, FxBuildHasher>>,
    next_ticket: AtomicU64,
    draining: BusyFlag,
    drain_stats: Arc<ManagerStats>,
    clock: Arc<dyn Clock>,
    config: RestockConfig,
}

impl RestockManager {
    pub fn new(config: &RestockConfig, clock: Arc<dyn Clock>, metrics: &Metrics) -> Self {
        let (pending_tx, pending_rx) = unbounded();
        Self {
            due: DeferredQueue::new("restock", metrics.register("restock", ManagerKind::Queue)),
            pending_tx,
            pending_rx,
            pending: Mutex::new(HashMap::default()),
            next_ticket: AtomicU64::new(1),
            draining: BusyFlag::new(),
            drain_stats: metrics.register("restock_drain", ManagerKind::Queue),
            clock,
            config: *config,
        }
    }

    pub fn start(self: &Arc<Self>, scheduler: &dyn RecurringScheduler) -> Vec<TaskHandle> {
        let scan = start_periodic(
            scheduler,
            self,
            "restock_scan",
            self.config.scan_period_ms,
            self.due.stats(),
            |m| {
                m.scan();
            },
        );
        let drain = start_periodic(
            scheduler,
            self,
            "restock_drain",
            self.config.drain_period_ms,
            &self.drain_stats,
            |m| {
                m.drain_one();
            },
        );
        scan.into_iter().chain(drain).collect()
    }

    /// Track a product. No-op if it is already waiting or pending.
    pub fn add(&self, product: Arc<dyn Restockable>) -> bool {
        let id = product.object_id();
        if self.pending.lock().contains_key(&id) {
            return false;
        }
        self.due.insert_if_absent(id, product)
    }

    /// Cancel a product's restock, wherever it is
    pub fn remove(&self, id: ObjectId) -> bool {
        let due = self.due.remove(id).is_some();
        let pending = self.pending.lock().remove(&id).is_some();
        if pending {
            self.drain_stats.set_subjects(self.pending_len());
        }
        due || pending
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.due.contains(id) || self.pending.lock().contains_key(&id)
    }

    pub fn is_pending(&self, id: ObjectId) -> bool {
        self.pending.lock().contains_key(&id)
    }

    pub fn due_len(&self) -> usize {
        self.due.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Move every product past its restock time to the pending channel
    pub fn scan(&self) -> Option<SweepReport> {
        let now = self.clock.now_millis();
        let report = self.due.sweep(|id, product| {
            if now < product.restock_at() {
                return Ok(Verdict::Keep);
            }
            // Marked pending before it leaves the due map, `add` must always
            // find it in one of the two
            let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
            self.pending.lock().insert(id, ticket);
            // Cannot fail, the receiver lives as long as `self`
            let sent = self.pending_tx.send(PendingRestock {
                ticket,
                product: product.clone(),
            });
            debug_assert!(sent.is_ok());
            Ok(Verdict::Drop)
        });
        self.drain_stats.set_subjects(self.pending_len());
        report
    }

    /// Restock at most one pending product. Returns the id restocked.
    pub fn drain_one(&self) -> Option<ObjectId> {
        let Some(_guard) = self.draining.try_begin() else {
            self.drain_stats.skipped_ticks.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        let started = Instant::now();
        let restocked = self.next_pending().and_then(|pending| self.restock(pending));
        self.drain_stats.set_subjects(self.pending_len());
        self.drain_stats.record_tick(started.elapsed());
        restocked
    }

    fn is_live(&self, id: ObjectId, ticket: u64) -> bool {
        self.pending.lock().get(&id) == Some(&ticket)
    }

    /// Pop until a product whose ticket is still live. Voided tickets are
    /// left over from a removal and are discarded.
    fn next_pending(&self) -> Option<PendingRestock> {
        while let Ok(pending) = self.pending_rx.try_recv() {
            let id = pending.product.object_id();
            if self.is_live(id, pending.ticket) {
                return Some(pending);
            }
            debug!("Discarding cancelled restock of {}", id);
        }
        None
    }

    fn restock(&self, pending: PendingRestock) -> Option<ObjectId> {
        let PendingRestock { ticket, product } = pending;
        let id = product.object_id();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| product.restock()))
            .unwrap_or_else(|payload| Err(TaskError::from_panic(payload)));

        // Ticket is settled under the pending lock, a `remove` during the
        // restock keeps the product out of the due map
        let mut tickets = self.pending.lock();
        let live = tickets.get(&id) == Some(&ticket);
        if live {
            tickets.remove(&id);
        }

        match outcome {
            Ok(()) => {
                self.drain_stats.actions.fetch_add(1, Ordering::Relaxed);
                debug!("Restocked product {}", id);
                if live {
                    // Back to waiting for its next restock time
                    self.due.insert_if_absent(id, product);
                }
                Some(id)
            }
            Err(e) => {
                drop(tickets);
                self.drain_stats.faults.fetch_add(1, Ordering::Relaxed);
                self.due.record_fault(id, &e);
                None
            }
        }
    }
}
