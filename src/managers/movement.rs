//! Movement interpolation
//!
//! Moving creatures are advanced along their path every tick. Players and
//! everything else live in separate pool sets so player movement can run at
//! a tighter period.

use std::sync::Arc;
use tracing::trace;

use crate::config::MovementConfig;
use crate::error::TaskError;
use crate::metrics::{ManagerKind, Metrics};
use crate::subject::{AiController, ObjectId, Subject};
use crate::task::{PoolSet, PoolSpec, PoolWorker, RecurringScheduler, Retention};
use crate::util::clock::{Clock, Millis};

/// Creature that can walk a path
pub trait Movable: Subject {
    fn is_player(&self) -> bool;

    fn is_alive(&self) -> bool;

    /// Advance along the current path by the distance covered since the last
    /// update. Returns true once the destination is reached.
    fn update_position(&self, now: Millis) -> Result<bool, TaskError>;

    fn controller(&self) -> Option<Arc<dyn AiController>>;
}

// ============================================================================
// Movement Worker
// ============================================================================

struct MovementWorker;

impl PoolWorker<dyn Movable> for MovementWorker {
    fn update(&self, subject: &Arc<dyn Movable>, now: Millis) -> Result<Retention, TaskError> {
        if !subject.is_alive() {
            return Ok(Retention::Release);
        }
        if subject.update_position(now)? {
            return Ok(Retention::Release);
        }
        Ok(Retention::Keep)
    }

    fn on_released(&self, subject: &Arc<dyn Movable>, _now: Millis) {
        // Dead creatures leave silently, arrivals wake their AI
        if !subject.is_alive() {
            return;
        }
        if let Some(ai) = subject.controller() {
            trace!("{} arrived", subject.object_id());
            ai.notify_arrived();
        }
    }
}

// ============================================================================
// Movement Manager
// ============================================================================

pub struct MovementManager {
    players: PoolSet<dyn Movable>,
    npcs: PoolSet<dyn Movable>,
}

impl MovementManager {
    pub fn new(
        config: &MovementConfig,
        scheduler: Arc<dyn RecurringScheduler>,
        clock: Arc<dyn Clock>,
        metrics: &Metrics,
    ) -> Self {
        let worker: Arc<dyn PoolWorker<dyn Movable>> = Arc::new(MovementWorker);

        let players = PoolSet::new(
            PoolSpec::new(
                "movement_players",
                config.players.capacity,
                config.players.period(),
            ),
            worker.clone(),
            scheduler.clone(),
            clock.clone(),
            metrics.register("movement_players", ManagerKind::Pool),
        );
        let npcs = PoolSet::new(
            PoolSpec::new("movement_npcs", config.npcs.capacity, config.npcs.period()),
            worker,
            scheduler,
            clock,
            metrics.register("movement_npcs", ManagerKind::Pool),
        );

        Self { players, npcs }
    }

    fn set_for(&self, is_player: bool) -> &PoolSet<dyn Movable> {
        if is_player {
            &self.players
        } else {
            &self.npcs
        }
    }

    /// Start interpolating a creature's movement
    pub fn add(&self, subject: Arc<dyn Movable>) -> bool {
        self.set_for(subject.is_player()).add(subject)
    }

    /// Stop interpolating. No-op if not moving.
    pub fn remove(&self, subject: &dyn Movable) -> bool {
        self.set_for(subject.is_player()).remove_id(subject.object_id())
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.players.contains(id) || self.npcs.contains(id)
    }

    pub fn len(&self) -> usize {
        self.players.len() + self.npcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn players(&self) -> &PoolSet<dyn Movable> {
        &self.players
    }

    pub fn npcs(&self) -> &PoolSet<dyn Movable> {
        &self.npcs
    }

    pub fn shutdown(&self) {
        self.players.shutdown();
        self.npcs.shutdown();
    }
}
