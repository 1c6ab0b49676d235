//! PvP flag decay
//!
//! A flagged player stays in the queue until the flag runs out. The flag
//! blinks during its last seconds and is cleared once expired.

use std::sync::Arc;
use tracing::debug;

use crate::config::PvpFlagConfig;
use crate::metrics::{ManagerKind, Metrics};
use crate::subject::{ObjectId, Subject};
use crate::task::{DeferredQueue, RecurringScheduler, SweepReport, TaskHandle, Verdict};
use crate::util::clock::{Clock, Millis};

use super::start_periodic;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PvpFlag {
    None,
    Flagged,
    Blinking,
}

pub trait PvpFlagged: Subject {
    fn is_online(&self) -> bool;

    /// Time at which the flag runs out
    fn flag_expires_at(&self) -> Millis;

    fn pvp_flag(&self) -> PvpFlag;

    fn set_pvp_flag(&self, flag: PvpFlag);
}

pub struct PvpFlagManager {
    queue: DeferredQueue<Arc<dyn PvpFlagged>>,
    clock: Arc<dyn Clock>,
    period_ms: u64,
    blink_threshold_ms: u64,
}

impl PvpFlagManager {
    pub fn new(config: &PvpFlagConfig, clock: Arc<dyn Clock>, metrics: &Metrics) -> Self {
        Self {
            queue: DeferredQueue::new("pvp_flag", metrics.register("pvp_flag", ManagerKind::Queue)),
            clock,
            period_ms: config.period_ms,
            blink_threshold_ms: config.blink_threshold_ms,
        }
    }

    pub fn start(self: &Arc<Self>, scheduler: &dyn RecurringScheduler) -> Vec<TaskHandle> {
        start_periodic(scheduler, self, "pvp_flag", self.period_ms, self.queue.stats(), |m| {
            m.run_tick();
        })
        .into_iter()
        .collect()
    }

    pub fn add(&self, player: Arc<dyn PvpFlagged>) -> bool {
        self.queue.insert_if_absent(player.object_id(), player)
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

    /// Flag tier for `remaining` ms of flag time
    fn tier(&self, remaining: Millis) -> PvpFlag {
        if remaining <= self.blink_threshold_ms {
            PvpFlag::Blinking
        } else {
            PvpFlag::Flagged
        }
    }

    pub fn run_tick(&self) -> Option<SweepReport> {
        let now = self.clock.now_millis();
        self.queue.sweep(|_, player| {
            // Logged out players lose the flag with the session
            if !player.is_online() {
                return Ok(Verdict::Drop);
            }

            // Strictly past the deadline: clear and stop tracking
            let expires_at = player.flag_expires_at();
            if now > expires_at {
                player.set_pvp_flag(PvpFlag::None);
                debug!("PvP flag of {} expired", player.object_id());
                return Ok(Verdict::Drop);
            }

            // Only tier changes are broadcast
            let tier = self.tier(expires_at - now);
            if player.pvp_flag() != tier {
                player.set_pvp_flag(tier);
            }
            Ok(Verdict::Keep)
        })
    }
}
