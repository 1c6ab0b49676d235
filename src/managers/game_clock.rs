//! In-game clock
//!
//! One dedicated loop counts ticks from the real time elapsed since start
//! and derives the in-game time of day from them. Listeners hear about
//! day/night changes once per transition.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::config::GameClockConfig;
use crate::constants::game_clock::{MINUTES_PER_DAY, NIGHT_END_HOUR, REAL_MS_PER_DAY};
use crate::metrics::{ManagerKind, ManagerStats, Metrics};
use crate::task::{RecurringScheduler, TaskHandle};
use crate::util::clock::{Clock, Millis};

use super::start_periodic;

pub trait DayNightListener: Send + Sync {
    fn on_day_night_change(&self, is_night: bool);
}

// ============================================================================
// Game Clock Loop
// ============================================================================

pub struct GameClock {
    clock: Arc<dyn Clock>,
    started_at: Millis,
    tick_ms: u64,
    ig_days_per_day: u64,
    night: Mutex<bool>,
    listeners: RwLock<Vec<Arc<dyn DayNightListener>>>,
    metrics: Arc<Metrics>,
    stats: Arc<ManagerStats>,
}

impl GameClock {
    pub fn new(config: &GameClockConfig, clock: Arc<dyn Clock>, metrics: Arc<Metrics>) -> Self {
        let started_at = clock.now_millis();
        let stats = metrics.register("game_clock", ManagerKind::Loop);
        let game_clock = Self {
            clock,
            started_at,
            tick_ms: config.tick_ms.max(1),
            ig_days_per_day: config.ig_days_per_day.max(1),
            night: Mutex::new(false),
            listeners: RwLock::new(Vec::new()),
            metrics,
            stats,
        };
        *game_clock.night.lock() = game_clock.is_night();
        game_clock
    }

    pub fn start(self: &Arc<Self>, scheduler: &dyn RecurringScheduler) -> Vec<TaskHandle> {
        info!(
            "Game clock started: {} in-game days per day, night={}",
            self.ig_days_per_day,
            self.is_night()
        );
        start_periodic(scheduler, self, "game_clock", self.tick_ms, &self.stats, |m| {
            m.tick();
        })
        .into_iter()
        .collect()
    }

    pub fn add_listener(&self, listener: Arc<dyn DayNightListener>) {
        self.listeners.write().push(listener);
    }

    /// Ticks since start, from wall-clock elapsed time
    pub fn game_ticks(&self) -> u64 {
        self.clock.now_millis().saturating_sub(self.started_at) / self.tick_ms
    }

    /// In-game minutes since start
    pub fn game_minutes(&self) -> u64 {
        let elapsed_ms = self.game_ticks() as u128 * self.tick_ms as u128;
        let minutes =
            elapsed_ms * self.ig_days_per_day as u128 * MINUTES_PER_DAY as u128 / REAL_MS_PER_DAY as u128;
        minutes as u64
    }

    pub fn minute_of_day(&self) -> u64 {
        self.game_minutes() % MINUTES_PER_DAY
    }

    pub fn hour(&self) -> u64 {
        self.minute_of_day() / 60
    }

    pub fn is_night(&self) -> bool {
        self.hour() < NIGHT_END_HOUR
    }

    /// Advance the clock. Returns the new state on a day/night transition.
    pub fn tick(&self) -> Option<bool> {
        let started = Instant::now();
        let ticks = self.game_ticks();
        let night = self.is_night();
        self.metrics.game_ticks.store(ticks, Ordering::Relaxed);
        self.metrics.is_night.store(night as u64, Ordering::Relaxed);

        let changed = {
            let mut last = self.night.lock();
            let changed = *last != night;
            *last = night;
            changed
        };

        if changed {
            info!("It is now {}", if night { "night" } else { "day" });
            let listeners: Vec<_> = self.listeners.read().clone();
            for listener in listeners {
                listener.on_day_night_change(night);
            }
            self.stats.actions.fetch_add(1, Ordering::Relaxed);
        }

        self.stats.record_tick(started.elapsed());
        changed.then_some(night)
    }
}
