//! The hot-path bid pipeline: an in-memory hot store holds the live, ranked
//! scoreboards while a batch persister reconciles them with the durable
//! store of record. The hot store is authoritative between persist cycles;
//! durability is guaranteed at session finalization.

pub mod api;
pub mod arguments;
pub mod auth;
pub mod broadcast;
pub mod database;
pub mod hotstore;
pub mod leaderboard;
pub mod monitor;
pub mod persister;
pub mod processor;
pub mod run;
pub mod session_cache;

pub use self::run::{run, start};
