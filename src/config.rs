use std::str::FromStr;
use std::time::Duration;

use crate::constants;
use crate::subject::ObjectId;

/// Period and capacity of one pool set
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub period_ms: u64,
    pub capacity: usize,
}

impl PoolConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MovementConfig {
    pub players: PoolConfig,
    pub npcs: PoolConfig,
}

#[derive(Debug, Clone, Copy)]
pub struct PvpFlagConfig {
    pub period_ms: u64,
    pub blink_threshold_ms: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct IdleAnimationConfig {
    pub period_ms: u64,
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
}

/// Per-class ground item lifetimes, 0 disables auto-destroy for the class
#[derive(Debug, Clone, Copy)]
pub struct ItemDestroyConfig {
    pub period_ms: u64,
    pub item_delay_ms: u64,
    pub herb_delay_ms: u64,
    pub equipment_delay_ms: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct MailConfig {
    pub period_ms: u64,
    pub fallback_owner: ObjectId,
}

#[derive(Debug, Clone, Copy)]
pub struct RestockConfig {
    pub scan_period_ms: u64,
    pub drain_period_ms: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct AutosaveConfig {
    pub period_ms: u64,
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct GameClockConfig {
    pub tick_ms: u64,
    pub ig_days_per_day: u64,
}

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Port of the metrics HTTP endpoint
    pub metrics_port: u16,
    pub movement: MovementConfig,
    pub attack: PoolConfig,
    pub think: PoolConfig,
    pub pvp_flag: PvpFlagConfig,
    pub auto_use_period_ms: u64,
    pub idle_animation: IdleAnimationConfig,
    pub item_destroy: ItemDestroyConfig,
    pub mail: MailConfig,
    pub restock: RestockConfig,
    pub autosave: AutosaveConfig,
    pub line_of_sight_period_ms: u64,
    pub clock: GameClockConfig,
    /// Synthetic bots spawned at startup, 0 for none
    pub sim_bots: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            metrics_port: 9090,
            movement: MovementConfig {
                players: PoolConfig {
                    period_ms: constants::movement::PLAYER_PERIOD_MS,
                    capacity: constants::movement::PLAYER_POOL_CAPACITY,
                },
                npcs: PoolConfig {
                    period_ms: constants::movement::NPC_PERIOD_MS,
                    capacity: constants::movement::NPC_POOL_CAPACITY,
                },
            },
            attack: PoolConfig {
                period_ms: constants::attack::PERIOD_MS,
                capacity: constants::attack::POOL_CAPACITY,
            },
            think: PoolConfig {
                period_ms: constants::think::PERIOD_MS,
                capacity: constants::think::POOL_CAPACITY,
            },
            pvp_flag: PvpFlagConfig {
                period_ms: constants::pvp_flag::PERIOD_MS,
                blink_threshold_ms: constants::pvp_flag::BLINK_THRESHOLD_MS,
            },
            auto_use_period_ms: constants::auto_use::PERIOD_MS,
            idle_animation: IdleAnimationConfig {
                period_ms: constants::idle_animation::PERIOD_MS,
                min_interval_ms: constants::idle_animation::MIN_INTERVAL_MS,
                max_interval_ms: constants::idle_animation::MAX_INTERVAL_MS,
            },
            item_destroy: ItemDestroyConfig {
                period_ms: constants::item_destroy::PERIOD_MS,
                item_delay_ms: constants::item_destroy::ITEM_DELAY_MS,
                herb_delay_ms: constants::item_destroy::HERB_DELAY_MS,
                equipment_delay_ms: constants::item_destroy::EQUIPMENT_DELAY_MS,
            },
            mail: MailConfig {
                period_ms: constants::mail::PERIOD_MS,
                fallback_owner: constants::mail::FALLBACK_OWNER,
            },
            restock: RestockConfig {
                scan_period_ms: constants::restock::SCAN_PERIOD_MS,
                drain_period_ms: constants::restock::DRAIN_PERIOD_MS,
            },
            autosave: AutosaveConfig {
                period_ms: constants::autosave::PERIOD_MS,
                interval_ms: constants::autosave::INTERVAL_MS,
            },
            line_of_sight_period_ms: constants::line_of_sight::PERIOD_MS,
            clock: GameClockConfig {
                tick_ms: constants::game_clock::TICK_MS,
                ig_days_per_day: constants::game_clock::IG_DAYS_PER_DAY,
            },
            sim_bots: 0,
        }
    }
}

/// Overwrite `target` from an environment variable if it parses and passes `valid`
fn env_override<T: FromStr>(key: &str, target: &mut T, valid: impl Fn(&T) -> bool, rule: &str) {
    let Ok(raw) = std::env::var(key) else {
        return;
    };

    match raw.parse::<T>() {
        Ok(parsed) if valid(&parsed) => *target = parsed,
        Ok(_) => tracing::warn!("{} must be {}, using default", key, rule),
        Err(_) => tracing::warn!("Invalid {} '{}', using default", key, raw),
    }
}

fn positive_ms(v: &u64) -> bool {
    *v > 0
}

fn positive_size(v: &usize) -> bool {
    *v > 0 && *v <= 100_000
}

impl SchedulerConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        env_override("METRICS_PORT", &mut config.metrics_port, |p| *p > 0, "> 0");

        env_override("MOVE_PLAYER_PERIOD_MS", &mut config.movement.players.period_ms, positive_ms, "> 0");
        env_override("MOVE_PLAYER_POOL_SIZE", &mut config.movement.players.capacity, positive_size, "1-100000");
        env_override("MOVE_NPC_PERIOD_MS", &mut config.movement.npcs.period_ms, positive_ms, "> 0");
        env_override("MOVE_NPC_POOL_SIZE", &mut config.movement.npcs.capacity, positive_size, "1-100000");

        env_override("ATTACK_PERIOD_MS", &mut config.attack.period_ms, positive_ms, "> 0");
        env_override("ATTACK_POOL_SIZE", &mut config.attack.capacity, positive_size, "1-100000");

        env_override("THINK_PERIOD_MS", &mut config.think.period_ms, positive_ms, "> 0");
        env_override("THINK_POOL_SIZE", &mut config.think.capacity, positive_size, "1-100000");

        env_override("PVP_FLAG_BLINK_MS", &mut config.pvp_flag.blink_threshold_ms, |_| true, "a number");

        env_override("IDLE_ANIM_MIN_MS", &mut config.idle_animation.min_interval_ms, positive_ms, "> 0");
        env_override("IDLE_ANIM_MAX_MS", &mut config.idle_animation.max_interval_ms, positive_ms, "> 0");

        env_override("ITEM_DESTROY_DELAY_MS", &mut config.item_destroy.item_delay_ms, |_| true, "a number");
        env_override("HERB_DESTROY_DELAY_MS", &mut config.item_destroy.herb_delay_ms, |_| true, "a number");
        env_override("EQUIPMENT_DESTROY_DELAY_MS", &mut config.item_destroy.equipment_delay_ms, |_| true, "a number");

        env_override("MAIL_FALLBACK_OWNER", &mut config.mail.fallback_owner, |_| true, "an object id");

        env_override("RESTOCK_DRAIN_PERIOD_MS", &mut config.restock.drain_period_ms, positive_ms, "> 0");

        env_override("AUTOSAVE_INTERVAL_MS", &mut config.autosave.interval_ms, positive_ms, "> 0");

        env_override("IG_DAYS_PER_DAY", &mut config.clock.ig_days_per_day, |d| (1..=1440).contains(d), "1-1440");

        env_override("SIM_BOTS", &mut config.sim_bots, |n| *n <= 1_000_000, "0-1000000");

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let periods = [
            ("movement.players", self.movement.players.period_ms),
            ("movement.npcs", self.movement.npcs.period_ms),
            ("attack", self.attack.period_ms),
            ("think", self.think.period_ms),
            ("pvp_flag", self.pvp_flag.period_ms),
            ("auto_use", self.auto_use_period_ms),
            ("idle_animation", self.idle_animation.period_ms),
            ("item_destroy", self.item_destroy.period_ms),
            ("mail", self.mail.period_ms),
            ("restock.scan", self.restock.scan_period_ms),
            ("restock.drain", self.restock.drain_period_ms),
            ("autosave", self.autosave.period_ms),
            ("line_of_sight", self.line_of_sight_period_ms),
            ("clock", self.clock.tick_ms),
        ];
        if let Some((name, _)) = periods.iter().find(|(_, ms)| *ms == 0) {
            return Err(format!("{} period cannot be 0", name));
        }

        let capacities = [
            ("movement.players", self.movement.players.capacity),
            ("movement.npcs", self.movement.npcs.capacity),
            ("attack", self.attack.capacity),
            ("think", self.think.capacity),
        ];
        if let Some((name, _)) = capacities.iter().find(|(_, c)| *c == 0) {
            return Err(format!("{} pool capacity must be at least 1", name));
        }

        if self.idle_animation.min_interval_ms > self.idle_animation.max_interval_ms {
            return Err("idle animation min interval cannot exceed max interval".to_string());
        }
        if self.clock.ig_days_per_day == 0 {
            return Err("ig_days_per_day must be at least 1".to_string());
        }
        if self.autosave.interval_ms == 0 {
            return Err("autosave interval cannot be 0".to_string());
        }
        Ok(())
    }
}
