//! Realm Task Scheduler Library
//!
//! Recurring background work of an MMO game server: movement, attack
//! timing, AI thinking and the periodic housekeeping queues (PvP flags,
//! auto-use, idle animations, ground items, mail, restock, auto-save,
//! line of sight, in-game clock).
//!
//! # Features
//!
//! - `metrics_http` - Prometheus/JSON metrics endpoint (enabled by default)

pub mod config;
pub mod constants;
pub mod error;
pub mod managers;
pub mod metrics;
pub mod sim;
pub mod subject;
pub mod task;
pub mod util;
