//! Combat timing
//!
//! Every attack is a small state machine: a scheduled hit is delivered once
//! its deadline passes, dual wield delivers a second hit after its own delay,
//! and the attack finishes when the weapon is ready again. Hits and finishes
//! live in separate pool sets so one can be pending while the other fires.
//!
//! A newer event for the same combatant replaces the pending one.

use std::sync::Arc;
use tracing::trace;

use crate::config::PoolConfig;
use crate::error::TaskError;
use crate::metrics::{ManagerKind, Metrics};
use crate::subject::{ObjectId, Subject};
use crate::task::{PoolSet, PoolSpec, PoolWorker, RecurringScheduler, Retention};
use crate::util::clock::{Clock, Millis};

// ============================================================================
// Combatant Callbacks
// ============================================================================

/// Anything that swings a weapon
pub trait Combatant: Subject {
    type Weapon: Clone + Send + Sync + 'static;
    type Attack: Clone + Send + Sync + 'static;

    fn on_hit(&self, weapon: &Self::Weapon, attack: &Self::Attack, hit_time: Millis, attack_time: Millis);

    fn on_first_dual_hit(
        &self,
        weapon: &Self::Weapon,
        attack: &Self::Attack,
        hit_time: Millis,
        attack_time: Millis,
        second_hit_delay: Millis,
    );

    fn on_second_dual_hit(
        &self,
        weapon: &Self::Weapon,
        attack: &Self::Attack,
        hit_time: Millis,
        attack_time: Millis,
        second_hit_delay: Millis,
    );

    fn on_finish_attack(&self, attack: &Self::Attack);
}

/// Which event an attack is waiting on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttackPhase {
    Hit,
    FirstDualHit,
    SecondDualHit,
    Finish,
}

/// Step payload of a pending attack event
#[derive(Debug, Clone)]
pub enum AttackStep<W, A> {
    Hit {
        weapon: W,
        attack: A,
        hit_time: Millis,
        attack_time: Millis,
    },
    FirstDualHit {
        weapon: W,
        attack: A,
        hit_time: Millis,
        attack_time: Millis,
        second_hit_delay: Millis,
    },
    SecondDualHit {
        weapon: W,
        attack: A,
        hit_time: Millis,
        attack_time: Millis,
        second_hit_delay: Millis,
    },
    Finish {
        attack: A,
    },
}

impl<W, A> AttackStep<W, A> {
    pub fn phase(&self) -> AttackPhase {
        match self {
            AttackStep::Hit { .. } => AttackPhase::Hit,
            AttackStep::FirstDualHit { .. } => AttackPhase::FirstDualHit,
            AttackStep::SecondDualHit { .. } => AttackPhase::SecondDualHit,
            AttackStep::Finish { .. } => AttackPhase::Finish,
        }
    }
}

// ============================================================================
// Pending Attack Events
// ============================================================================

/// Pending attack event, keyed by the combatant's id
pub struct ScheduledAttack<C: Combatant> {
    combatant: Arc<C>,
    step: AttackStep<C::Weapon, C::Attack>,
    deadline: Millis,
}

impl<C: Combatant> ScheduledAttack<C> {
    pub fn combatant(&self) -> &Arc<C> {
        &self.combatant
    }

    pub fn step(&self) -> &AttackStep<C::Weapon, C::Attack> {
        &self.step
    }

    pub fn deadline(&self) -> Millis {
        self.deadline
    }

    fn fire(&self) {
        let c = &self.combatant;
        match &self.step {
            AttackStep::Hit {
                weapon,
                attack,
                hit_time,
                attack_time,
            } => c.on_hit(weapon, attack, *hit_time, *attack_time),
            AttackStep::FirstDualHit {
                weapon,
                attack,
                hit_time,
                attack_time,
                second_hit_delay,
            } => c.on_first_dual_hit(weapon, attack, *hit_time, *attack_time, *second_hit_delay),
            AttackStep::SecondDualHit {
                weapon,
                attack,
                hit_time,
                attack_time,
                second_hit_delay,
            } => c.on_second_dual_hit(weapon, attack, *hit_time, *attack_time, *second_hit_delay),
            AttackStep::Finish { attack } => c.on_finish_attack(attack),
        }
    }
}

impl<C: Combatant> Subject for ScheduledAttack<C> {
    fn object_id(&self) -> ObjectId {
        self.combatant.object_id()
    }
}

/// Releases an event once its deadline passes and fires it after removal
struct DeadlineWorker;

impl<C: Combatant> PoolWorker<ScheduledAttack<C>> for DeadlineWorker {
    fn update(&self, event: &Arc<ScheduledAttack<C>>, now: Millis) -> Result<Retention, TaskError> {
        if now >= event.deadline {
            Ok(Retention::Release)
        } else {
            Ok(Retention::Keep)
        }
    }

    fn on_released(&self, event: &Arc<ScheduledAttack<C>>, now: Millis) {
        trace!(
            "{}: {:?} fired {}ms past deadline",
            event.object_id(),
            event.step.phase(),
            now - event.deadline
        );
        event.fire();
    }
}

// ============================================================================
// Attack Manager
// ============================================================================

pub struct AttackManager<C: Combatant> {
    hits: PoolSet<ScheduledAttack<C>>,
    finishes: PoolSet<ScheduledAttack<C>>,
    clock: Arc<dyn Clock>,
}

impl<C: Combatant> AttackManager<C> {
    pub fn new(
        config: &PoolConfig,
        scheduler: Arc<dyn RecurringScheduler>,
        clock: Arc<dyn Clock>,
        metrics: &Metrics,
    ) -> Self {
        let hits: PoolSet<ScheduledAttack<C>> = PoolSet::new(
            PoolSpec::new("attack_hits", config.capacity, config.period()),
            Arc::new(DeadlineWorker),
            scheduler.clone(),
            clock.clone(),
            metrics.register("attack_hits", ManagerKind::Pool),
        );
        let finishes: PoolSet<ScheduledAttack<C>> = PoolSet::new(
            PoolSpec::new("attack_finishes", config.capacity, config.period()),
            Arc::new(DeadlineWorker),
            scheduler,
            clock.clone(),
            metrics.register("attack_finishes", ManagerKind::Pool),
        );

        Self {
            hits,
            finishes,
            clock,
        }
    }

    fn schedule_hit(&self, combatant: Arc<C>, step: AttackStep<C::Weapon, C::Attack>, delay: Millis) {
        let deadline = self.clock.now_millis() + delay;
        self.hits.replace(Arc::new(ScheduledAttack {
            combatant,
            step,
            deadline,
        }));
    }

    /// Deliver a single hit `hit_time` ms from now
    pub fn schedule_normal_hit(
        &self,
        combatant: Arc<C>,
        weapon: C::Weapon,
        attack: C::Attack,
        hit_time: Millis,
        attack_time: Millis,
    ) {
        let step = AttackStep::Hit {
            weapon,
            attack,
            hit_time,
            attack_time,
        };
        self.schedule_hit(combatant, step, hit_time);
    }

    /// Deliver the first dual-wield hit `hit_time` ms from now
    pub fn schedule_first_dual_hit(
        &self,
        combatant: Arc<C>,
        weapon: C::Weapon,
        attack: C::Attack,
        hit_time: Millis,
        attack_time: Millis,
        second_hit_delay: Millis,
    ) {
        let step = AttackStep::FirstDualHit {
            weapon,
            attack,
            hit_time,
            attack_time,
            second_hit_delay,
        };
        self.schedule_hit(combatant, step, hit_time);
    }

    /// Deliver the second dual-wield hit `second_hit_delay` ms from now.
    /// Normally called from `on_first_dual_hit`.
    pub fn schedule_second_dual_hit(
        &self,
        combatant: Arc<C>,
        weapon: C::Weapon,
        attack: C::Attack,
        hit_time: Millis,
        attack_time: Millis,
        second_hit_delay: Millis,
    ) {
        let step = AttackStep::SecondDualHit {
            weapon,
            attack,
            hit_time,
            attack_time,
            second_hit_delay,
        };
        self.schedule_hit(combatant, step, second_hit_delay);
    }

    /// Finish the attack `delay` ms from now
    pub fn schedule_finish(&self, combatant: Arc<C>, attack: C::Attack, delay: Millis) {
        let deadline = self.clock.now_millis() + delay;
        self.finishes.replace(Arc::new(ScheduledAttack {
            combatant,
            step: AttackStep::Finish { attack },
            deadline,
        }));
    }

    /// Cancel every pending hit and finish of a combatant
    pub fn abort(&self, combatant: &C) {
        let id = combatant.object_id();
        let hit = self.hits.remove_id(id);
        let finish = self.finishes.remove_id(id);
        if hit || finish {
            trace!("{}: attack aborted", id);
        }
    }

    pub fn has_pending_hit(&self, id: ObjectId) -> bool {
        self.hits.contains(id)
    }

    pub fn has_pending_finish(&self, id: ObjectId) -> bool {
        self.finishes.contains(id)
    }

    /// Pending hit phase, else finish, else `None`
    pub fn phase(&self, id: ObjectId) -> Option<AttackPhase> {
        self.hits
            .get(id)
            .map(|event| event.step.phase())
            .or_else(|| self.finishes.contains(id).then_some(AttackPhase::Finish))
    }

    pub fn hits(&self) -> &PoolSet<ScheduledAttack<C>> {
        &self.hits
    }

    pub fn finishes(&self) -> &PoolSet<ScheduledAttack<C>> {
        &self.finishes
    }

    pub fn shutdown(&self) {
        self.hits.shutdown();
        self.finishes.shutdown();
    }
}
