//! Pingscope Backend Library
//!
//! Turns OCR-derived latency readings of game streams into QoE periods:
//! stable regimes, spikes and evicted glitches, per (user, game).

pub mod config;
pub mod models;
pub mod qoe;
pub mod runner;
pub mod storage;

pub use config::{EngineSettings, QoeConfig};
pub use runner::{QoeRunner, RunSummary};
pub use storage::SqliteQoeStore;
