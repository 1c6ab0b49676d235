//! Per-behavior schedulers and the bundle that owns them
//!
//! Pool-based managers (movement, attack, think) start their timers lazily
//! as pools are created. Queue-based managers and the game clock register
//! one timer each when the bundle starts.

pub mod attack;
pub mod auto_use;
pub mod autosave;
pub mod game_clock;
pub mod idle_animation;
pub mod item_destroy;
pub mod line_of_sight;
pub mod mail_expiry;
pub mod movement;
pub mod pvp_flag;
pub mod restock;
pub mod think;

use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::error::TaskError;
use crate::metrics::{ManagerStats, Metrics};
use crate::task::{Job, RecurringScheduler, TaskHandle};
use crate::util::clock::{Clock, Millis};

use attack::{AttackManager, Combatant};
use auto_use::AutoUseManager;
use autosave::AutosaveManager;
use game_clock::GameClock;
use idle_animation::IdleAnimationManager;
use item_destroy::ItemDestroyManager;
use line_of_sight::LineOfSightManager;
use mail_expiry::{MailExpiryManager, MailStore};
use movement::MovementManager;
use pvp_flag::PvpFlagManager;
use restock::RestockManager;
use think::ThinkManager;

/// Register `tick` to run on `manager` every `period_ms`.
///
/// The timer holds a weak reference, so a dropped manager stops ticking.
/// A panicking tick is logged and the timer keeps running.
pub(crate) fn start_periodic<M: Send + Sync + 'static>(
    scheduler: &dyn RecurringScheduler,
    manager: &Arc<M>,
    name: &str,
    period_ms: u64,
    stats: &ManagerStats,
    tick: fn(&M),
) -> Option<TaskHandle> {
    let weak = Arc::downgrade(manager);
    let task_name = name.to_string();
    let job: Job = Arc::new(move || {
        let Some(manager) = weak.upgrade() else {
            return;
        };
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| tick(manager.as_ref()))) {
            error!("{}: tick panicked: {}", task_name, TaskError::from_panic(payload));
        }
    });

    match scheduler.schedule_at_fixed_rate(name, Duration::from_millis(period_ms), job) {
        Ok(handle) => {
            debug!("{}: timer started, every {}ms", name, period_ms);
            Some(handle)
        }
        Err(e) => {
            stats.schedule_failures.fetch_add(1, Ordering::Relaxed);
            error!("{}: timer not started, manager will not tick: {}", name, e);
            None
        }
    }
}

/// Every scheduler of the game server, built once at startup
pub struct TaskManagers<C: Combatant> {
    pub movement: MovementManager,
    pub attack: AttackManager<C>,
    pub think: ThinkManager,
    pub pvp_flag: Arc<PvpFlagManager>,
    pub auto_use: Arc<AutoUseManager>,
    pub idle_animation: Arc<IdleAnimationManager>,
    pub item_destroy: Arc<ItemDestroyManager>,
    pub mail_expiry: Arc<MailExpiryManager>,
    pub restock: Arc<RestockManager>,
    pub autosave: Arc<AutosaveManager>,
    pub line_of_sight: Arc<LineOfSightManager>,
    pub game_clock: Arc<GameClock>,
    scheduler: Arc<dyn RecurringScheduler>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    timers: Mutex<Vec<TaskHandle>>,
}

impl<C: Combatant> TaskManagers<C> {
    pub fn new(
        config: &SchedulerConfig,
        scheduler: Arc<dyn RecurringScheduler>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
        mail_store: Arc<dyn MailStore>,
    ) -> Self {
        let m = metrics.as_ref();
        Self {
            movement: MovementManager::new(&config.movement, scheduler.clone(), clock.clone(), m),
            attack: AttackManager::new(&config.attack, scheduler.clone(), clock.clone(), m),
            think: ThinkManager::new(&config.think, scheduler.clone(), clock.clone(), m),
            pvp_flag: Arc::new(PvpFlagManager::new(&config.pvp_flag, clock.clone(), m)),
            auto_use: Arc::new(AutoUseManager::new(config, m)),
            idle_animation: Arc::new(IdleAnimationManager::new(
                &config.idle_animation,
                clock.clone(),
                m,
            )),
            item_destroy: Arc::new(ItemDestroyManager::new(&config.item_destroy, clock.clone(), m)),
            mail_expiry: Arc::new(MailExpiryManager::new(&config.mail, mail_store, clock.clone(), m)),
            restock: Arc::new(RestockManager::new(&config.restock, clock.clone(), m)),
            autosave: Arc::new(AutosaveManager::new(&config.autosave, clock.clone(), m)),
            line_of_sight: Arc::new(LineOfSightManager::new(config.line_of_sight_period_ms, m)),
            game_clock: Arc::new(GameClock::new(&config.clock, clock.clone(), metrics.clone())),
            scheduler,
            clock,
            metrics,
            timers: Mutex::new(Vec::new()),
        }
    }

    /// Register the queue timers and the game clock loop
    pub fn start(&self) {
        let mut timers = self.timers.lock();
        if !timers.is_empty() {
            warn!("Task managers already started");
            return;
        }

        let scheduler = self.scheduler.as_ref();
        timers.extend(self.pvp_flag.start(scheduler));
        timers.extend(self.auto_use.start(scheduler));
        timers.extend(self.idle_animation.start(scheduler));
        timers.extend(self.item_destroy.start(scheduler));
        timers.extend(self.mail_expiry.start(scheduler));
        timers.extend(self.restock.start(scheduler));
        timers.extend(self.autosave.start(scheduler));
        timers.extend(self.line_of_sight.start(scheduler));
        timers.extend(self.game_clock.start(scheduler));

        info!("Task managers started ({} timers)", timers.len());
    }

    /// Number of queue and clock timers currently registered
    pub fn timer_count(&self) -> usize {
        self.timers.lock().len()
    }

    /// Current time on the clock every manager shares
    pub fn now(&self) -> Millis {
        self.clock.now_millis()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Cancel every timer. Registered subjects are left in place.
    pub fn shutdown(&self) {
        for timer in self.timers.lock().drain(..) {
            timer.cancel();
        }
        self.movement.shutdown();
        self.attack.shutdown();
        self.think.shutdown();
        info!("Task managers stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subject::{ObjectId, Subject};
    use crate::task::ManualScheduler;
    use crate::util::clock::ManualClock;
    use mail_expiry::Attachments;

    struct NoMail;

    impl MailStore for NoMail {
        fn return_attachments(&self, _: ObjectId, _: Attachments) -> Result<(), TaskError> {
            Ok(())
        }

        fn notify_expired(&self, _: ObjectId, _: ObjectId) {}

        fn purge(&self, _: ObjectId) -> Result<(), TaskError> {
            Ok(())
        }
    }

    struct Dummy(ObjectId);

    impl Subject for Dummy {
        fn object_id(&self) -> ObjectId {
            self.0
        }
    }

    impl Combatant for Dummy {
        type Weapon = ();
        type Attack = ();

        fn on_hit(&self, _: &(), _: &(), _: Millis, _: Millis) {}

        fn on_first_dual_hit(&self, _: &(), _: &(), _: Millis, _: Millis, _: Millis) {}

        fn on_second_dual_hit(&self, _: &(), _: &(), _: Millis, _: Millis, _: Millis) {}

        fn on_finish_attack(&self, _: &()) {}
    }

    fn setup() -> (Arc<ManualScheduler>, Arc<Metrics>, TaskManagers<Dummy>) {
        let clock = Arc::new(ManualClock::new(0));
        let scheduler = Arc::new(ManualScheduler::new(clock.clone()));
        let metrics = Arc::new(Metrics::new());
        let managers = TaskManagers::new(
            &SchedulerConfig::default(),
            scheduler.clone(),
            clock,
            metrics.clone(),
            Arc::new(NoMail),
        );
        (scheduler, metrics, managers)
    }

    #[test]
    fn test_start_registers_queue_timers_once() {
        let (scheduler, _, managers) = setup();
        managers.start();
        // One each plus the restock drain timer
        assert_eq!(managers.timer_count(), 10);
        assert_eq!(scheduler.job_count(), 10);

        managers.start();
        assert_eq!(scheduler.job_count(), 10);
    }

    #[test]
    fn test_every_manager_reports_metrics() {
        let (_, metrics, _managers) = setup();
        let names: Vec<String> = metrics.snapshots().into_iter().map(|s| s.name).collect();
        for expected in [
            "movement_players",
            "movement_npcs",
            "attack_hits",
            "attack_finishes",
            "think",
            "pvp_flag",
            "auto_use",
            "idle_animation",
            "item_destroy",
            "mail_expiry",
            "restock",
            "restock_drain",
            "autosave",
            "line_of_sight",
            "game_clock",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {}", expected);
        }
    }

    #[test]
    fn test_shutdown_cancels_everything() {
        let (scheduler, _, managers) = setup();
        managers.start();
        managers
            .attack
            .schedule_normal_hit(Arc::new(Dummy(1)), (), (), 100, 200);
        assert_eq!(scheduler.job_count(), 11);

        managers.shutdown();
        scheduler.advance(1000);
        assert_eq!(scheduler.job_count(), 0);
        assert!(managers.attack.has_pending_hit(1));
    }

    #[test]
    fn test_game_clock_feeds_metrics() {
        let (scheduler, metrics, managers) = setup();
        managers.start();
        scheduler.advance(1000);
        assert_eq!(metrics.game_ticks.load(Ordering::Relaxed), 10);
        assert_eq!(metrics.is_night.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_dropped_manager_stops_ticking() {
        let clock = Arc::new(ManualClock::new(0));
        let scheduler = ManualScheduler::new(clock.clone());
        let metrics = Metrics::new();
        let manager = Arc::new(LineOfSightManager::new(100, &metrics));
        let handle = manager.start(&scheduler);
        assert_eq!(handle.len(), 1);

        drop(manager);
        scheduler.advance(500);
        assert_eq!(metrics.manager("line_of_sight").unwrap().ticks.load(Ordering::Relaxed), 0);
    }
}
