//! Collaborators of the QoE engine
//!
//! The engine only sees these traits. [`SqliteQoeStore`] implements all of
//! them on a single database file.

pub mod sqlite;

pub use sqlite::SqliteQoeStore;

use std::collections::HashSet;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::models::{Accumulator, AlternativeIndex, BacklogEntry, PeriodSummary, Sample, SampleKey};
use crate::qoe::{CarriedOverKeys, CommitPlan};

/// Samples read for one pair plus the number of rows that had to be skipped
#[derive(Debug, Clone, Default)]
pub struct LoadedSamples {
    pub samples: Vec<Sample>,
    pub malformed: usize,
}

/// Raw OCR readings
pub trait SampleSource: Send + Sync {
    /// Every (user, game) pair with at least one sample
    fn pairs(&self) -> Result<Vec<(String, String)>>;

    /// Samples of a pair taken at or after `since`, in no particular order
    fn samples_since(&self, user_id: &str, game_id: &str, since: DateTime<Utc>) -> Result<LoadedSamples>;
}

/// Secondary OCR engine readings
pub trait AlternativeSource: Send + Sync {
    fn alternatives(&self, user_id: &str, game_id: &str, since: DateTime<Utc>) -> Result<AlternativeIndex>;
}

/// Processed state: accumulators, periods, points, glitches, spikes
pub trait ProcessedStore: Send + Sync {
    /// Accumulator of the pair, empty if none was ever committed
    fn accumulator(&self, user_id: &str, game_id: &str) -> Result<Accumulator>;

    /// Most recent persisted period starting at or before `since`
    fn last_period(&self, user_id: &str, game_id: &str, since: DateTime<Utc>) -> Result<Option<PeriodSummary>>;

    /// Persisted periods starting at or before `since`, renumbered by start,
    /// without the last one
    fn old_periods(&self, user_id: &str, game_id: &str, since: DateTime<Utc>) -> Result<Vec<PeriodSummary>>;

    /// Keys of the points persisted at or after `from`, and the sequence index
    /// of the earliest one
    fn carried_over(&self, user_id: &str, game_id: &str, from: DateTime<Utc>) -> Result<(CarriedOverKeys, Option<u64>)>;

    /// Keys of the spikes persisted at or after `from`
    fn spike_keys(&self, user_id: &str, game_id: &str, from: DateTime<Utc>) -> Result<HashSet<SampleKey>>;

    /// Persist glitches of a rejected unit, evicting any point stored under
    /// the same key. Accepted units carry theirs in the commit plan.
    fn store_glitches(&self, glitches: &[Sample]) -> Result<()>;

    /// Persist an accepted unit in one transaction, glitches included.
    /// `stale_spikes` are deleted.
    fn commit(
        &self,
        user_id: &str,
        game_id: &str,
        plan: &CommitPlan,
        spikes: &[Sample],
        stale_spikes: &HashSet<SampleKey>,
    ) -> Result<()>;

    /// Persist a rejected unit to the discard stores
    fn discard(&self, points: &[Sample], spikes: &[Sample]) -> Result<()>;

    /// Wipe every processed collection
    fn reset(&self) -> Result<()>;
}

/// Online backlog, fed by OCR ingestion
pub trait WorkQueue: Send + Sync {
    /// Pop every pending entry at once
    fn drain(&self) -> Result<Vec<BacklogEntry>>;
}

/// Everything the runner needs
pub trait QoeStore: SampleSource + AlternativeSource + ProcessedStore + WorkQueue {}

impl<T> QoeStore for T where T: SampleSource + AlternativeSource + ProcessedStore + WorkQueue {}
