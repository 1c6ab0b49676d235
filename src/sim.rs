//! Synthetic bot population
//!
//! Bots wander around a circular arena, pick fights and get saved like
//! real characters, which exercises every scheduler from the binary and the
//! benchmarks without a game world attached.

use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

use crate::constants::sim::*;
use crate::error::TaskError;
use crate::managers::attack::Combatant;
use crate::managers::autosave::Persistable;
use crate::managers::idle_animation::Animated;
use crate::managers::line_of_sight::Observer;
use crate::managers::mail_expiry::{Attachments, CharacterId, MailStore};
use crate::managers::movement::Movable;
use crate::managers::think::Thinker;
use crate::managers::TaskManagers;
use crate::subject::{AiController, ObjectId, Subject};
use crate::util::clock::Millis;

pub type SimWorld = TaskManagers<SimBot>;

// ============================================================================
// Bot State
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Motion {
    pos: (f32, f32),
    target: Option<(f32, f32)>,
    last_update: Millis,
}

/// Per-bot activity counters
#[derive(Debug, Default)]
pub struct BotCounters {
    pub steps: AtomicU64,
    pub arrivals: AtomicU64,
    pub hits: AtomicU64,
    pub finishes: AtomicU64,
    pub saves: AtomicU64,
    pub refreshes: AtomicU64,
    pub animations: AtomicU64,
}

pub struct SimBot {
    id: ObjectId,
    player: bool,
    motion: Mutex<Motion>,
    brain: Arc<SimBrain>,
    pub counters: BotCounters,
}

impl SimBot {
    pub fn new(id: ObjectId, player: bool, now: Millis, world: Weak<SimWorld>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id,
            player,
            motion: Mutex::new(Motion {
                pos: random_point(),
                target: None,
                last_update: now,
            }),
            brain: Arc::new(SimBrain {
                bot: me.clone(),
                world,
            }),
            counters: BotCounters::default(),
        })
    }

    pub fn position(&self) -> (f32, f32) {
        self.motion.lock().pos
    }

    pub fn is_moving(&self) -> bool {
        self.motion.lock().target.is_some()
    }

    fn set_target(&self, target: (f32, f32), now: Millis) {
        let mut motion = self.motion.lock();
        motion.target = Some(target);
        motion.last_update = now;
    }
}

fn random_point() -> (f32, f32) {
    let mut rng = rand::thread_rng();
    let angle = rng.gen_range(0.0..std::f32::consts::TAU);
    let radius = rng.gen_range(0.0..ARENA_RADIUS);
    (radius * angle.cos(), radius * angle.sin())
}

// ============================================================================
// Scheduler Hooks
// ============================================================================

impl Subject for SimBot {
    fn object_id(&self) -> ObjectId {
        self.id
    }
}

impl Movable for SimBot {
    fn is_player(&self) -> bool {
        self.player
    }

    fn is_alive(&self) -> bool {
        true
    }

    fn update_position(&self, now: Millis) -> Result<bool, TaskError> {
        let mut motion = self.motion.lock();
        let Some((tx, ty)) = motion.target else {
            return Ok(true);
        };

        let dt = now.saturating_sub(motion.last_update) as f32 / 1000.0;
        motion.last_update = now;
        let (x, y) = motion.pos;
        let (dx, dy) = (tx - x, ty - y);
        let dist = (dx * dx + dy * dy).sqrt();
        let step = BOT_SPEED * dt;
        self.counters.steps.fetch_add(1, Ordering::Relaxed);

        if dist <= step {
            motion.pos = (tx, ty);
            motion.target = None;
            return Ok(true);
        }
        motion.pos = (x + dx / dist * step, y + dy / dist * step);
        Ok(false)
    }

    fn controller(&self) -> Option<Arc<dyn AiController>> {
        Some(self.brain.clone())
    }
}

impl Thinker for SimBot {
    fn controller(&self) -> Option<Arc<dyn AiController>> {
        Some(self.brain.clone())
    }
}

impl Combatant for SimBot {
    /// Weapon id
    type Weapon = u32;
    /// Target object id
    type Attack = ObjectId;

    fn on_hit(&self, _weapon: &u32, _target: &ObjectId, _hit_time: Millis, _attack_time: Millis) {
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn on_first_dual_hit(&self, weapon: &u32, target: &ObjectId, hit_time: Millis, attack_time: Millis, second_hit_delay: Millis) {
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        let (Some(world), Some(me)) = (self.brain.world.upgrade(), self.brain.bot.upgrade()) else {
            return;
        };
        world
            .attack
            .schedule_second_dual_hit(me, *weapon, *target, hit_time, attack_time, second_hit_delay);
    }

    fn on_second_dual_hit(&self, _weapon: &u32, _target: &ObjectId, _hit_time: Millis, _attack_time: Millis, _second_hit_delay: Millis) {
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn on_finish_attack(&self, _target: &ObjectId) {
        self.counters.finishes.fetch_add(1, Ordering::Relaxed);
    }
}

impl Persistable for SimBot {
    fn is_online(&self) -> bool {
        true
    }

    fn store(&self) -> Result<(), TaskError> {
        self.counters.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl Observer for SimBot {
    fn is_spawned(&self) -> bool {
        true
    }

    fn refresh_visible(&self) -> Result<(), TaskError> {
        self.counters.refreshes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl Animated for SimBot {
    fn is_spawned(&self) -> bool {
        true
    }

    fn is_idle(&self) -> bool {
        !self.is_moving()
    }

    fn play_idle_animation(&self) {
        self.counters.animations.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// Bot Behavior
// ============================================================================

/// Wander-and-fight behavior of a bot
pub struct SimBrain {
    bot: Weak<SimBot>,
    world: Weak<SimWorld>,
}

impl AiController for SimBrain {
    fn think(&self) {
        let (Some(bot), Some(world)) = (self.bot.upgrade(), self.world.upgrade()) else {
            return;
        };
        if bot.is_moving() {
            return;
        }

        let mut rng = rand::thread_rng();
        if rng.gen_bool(ATTACK_CHANCE) {
            let weapon = rng.gen_range(1..100);
            let target = rng.gen_range(0..=ObjectId::MAX);
            if rng.gen_bool(DUAL_WIELD_CHANCE) {
                world.attack.schedule_first_dual_hit(
                    bot.clone(),
                    weapon,
                    target,
                    HIT_TIME_MS,
                    ATTACK_TIME_MS,
                    SECOND_HIT_DELAY_MS,
                );
            } else {
                world
                    .attack
                    .schedule_normal_hit(bot.clone(), weapon, target, HIT_TIME_MS, ATTACK_TIME_MS);
            }
            world.attack.schedule_finish(bot, target, ATTACK_TIME_MS);
            return;
        }

        let now = world.now();
        bot.set_target(random_point(), now);
        world.movement.add(bot);
    }

    fn notify_arrived(&self) {
        if let Some(bot) = self.bot.upgrade() {
            bot.counters.arrivals.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Spawn `count` bots into `world`. Every fourth bot counts as a player.
pub fn spawn_bots(world: &Arc<SimWorld>, first_id: ObjectId, count: u32) -> Vec<Arc<SimBot>> {
    let now = world.now();
    let bots: Vec<Arc<SimBot>> = (0..count)
        .map(|i| SimBot::new(first_id + i, i % 4 == 0, now, Arc::downgrade(world)))
        .collect();

    for bot in &bots {
        world.think.add(bot.clone());
        world.idle_animation.add(bot.clone());
        world.line_of_sight.add(bot.clone());
        if bot.is_player() {
            world.autosave.add(bot.clone());
        }
    }
    debug!("Spawned {} bots", bots.len());
    bots
}

// ============================================================================
// Collaborators
// ============================================================================

/// Mail store that only logs, for runs without a database
pub struct LogMailStore;

impl MailStore for LogMailStore {
    fn return_attachments(&self, owner: CharacterId, attachments: Attachments) -> Result<(), TaskError> {
        debug!("Returning {} item stacks to {}", attachments.items.len(), owner);
        Ok(())
    }

    fn notify_expired(&self, recipient: CharacterId, message: ObjectId) {
        debug!("Mail {} of {} expired", message, recipient);
    }

    fn purge(&self, message: ObjectId) -> Result<(), TaskError> {
        debug!("Purged mail {}", message);
        Ok(())
    }
}
