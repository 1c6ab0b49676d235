/// Movement interpolation pools
pub mod movement {
    /// Player pools tick faster so movement feels responsive
    pub const PLAYER_PERIOD_MS: u64 = 50;
    pub const PLAYER_POOL_CAPACITY: usize = 500;
    pub const NPC_PERIOD_MS: u64 = 100;
    pub const NPC_POOL_CAPACITY: usize = 1000;
}

/// Melee/ranged hit and finish timing pools
pub mod attack {
    pub const PERIOD_MS: u64 = 10;
    pub const POOL_CAPACITY: usize = 300;
}

/// AI re-evaluation pools
pub mod think {
    pub const PERIOD_MS: u64 = 1000;
    pub const POOL_CAPACITY: usize = 1000;
}

/// PvP flag decay
pub mod pvp_flag {
    pub const PERIOD_MS: u64 = 1000;
    /// Remaining flag time at which the flag starts blinking
    pub const BLINK_THRESHOLD_MS: u64 = 5000;
}

/// Automatic potion use
pub mod auto_use {
    pub const PERIOD_MS: u64 = 1000;
}

/// Random idle animations
pub mod idle_animation {
    pub const PERIOD_MS: u64 = 1000;
    pub const MIN_INTERVAL_MS: u64 = 5_000;
    pub const MAX_INTERVAL_MS: u64 = 60_000;
}

/// Ground item auto-destroy (0 = never destroy that class)
pub mod item_destroy {
    pub const PERIOD_MS: u64 = 5000;
    pub const ITEM_DELAY_MS: u64 = 600_000;
    pub const HERB_DELAY_MS: u64 = 60_000;
    pub const EQUIPMENT_DELAY_MS: u64 = 600_000;
}

/// Mail expiry
pub mod mail {
    pub const PERIOD_MS: u64 = 10_000;
    /// Storage owner for attachments of messages without a sender
    pub const FALLBACK_OWNER: u32 = 0;
}

/// Buy-list restock
pub mod restock {
    pub const SCAN_PERIOD_MS: u64 = 1000;
    /// One pending product is restocked per drain cycle
    pub const DRAIN_PERIOD_MS: u64 = 100;
}

/// Player auto-save
pub mod autosave {
    pub const PERIOD_MS: u64 = 1000;
    pub const INTERVAL_MS: u64 = 15 * 60 * 1000;
}

/// Seen-creatures refresh
pub mod line_of_sight {
    pub const PERIOD_MS: u64 = 1000;
}

/// In-game clock
pub mod game_clock {
    pub const TICK_MS: u64 = 100;
    /// In-game days per real day
    pub const IG_DAYS_PER_DAY: u64 = 6;
    pub const MINUTES_PER_DAY: u64 = 24 * 60;
    /// Night lasts from 00:00 until this hour
    pub const NIGHT_END_HOUR: u64 = 6;
    pub const REAL_MS_PER_DAY: u64 = 24 * 60 * 60 * 1000;
}

/// Synthetic bot population
pub mod sim {
    pub const ARENA_RADIUS: f32 = 2000.0;
    /// Units per second
    pub const BOT_SPEED: f32 = 120.0;
    /// Chance per think that an idle bot starts an attack
    pub const ATTACK_CHANCE: f64 = 0.3;
    pub const DUAL_WIELD_CHANCE: f64 = 0.25;
    pub const HIT_TIME_MS: u64 = 300;
    pub const ATTACK_TIME_MS: u64 = 600;
    pub const SECOND_HIT_DELAY_MS: u64 = 400;
}
