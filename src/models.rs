use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Latencies at or above this value are treated as OCR overflow, never as a reading.
pub const LATENCY_CEILING: u32 = 1000;

/// Number of decimal digits in a latency value (`0` has one digit).
#[inline]
pub fn digit_len(value: u32) -> u32 {
    value.checked_ilog10().map_or(1, |d| d + 1)
}

/// Identity of a sample across stores: one reading per stream per instant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SampleKey {
    pub stream_id: String,
    pub timestamp: DateTime<Utc>,
}

/// One OCR-derived latency reading for a (user, game) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub user_id: String,
    pub game_id: String,
    pub stream_id: String,
    pub timestamp: DateTime<Utc>,
    pub latency: u32,
    pub sequence_index: u64,
    /// Already persisted by a previous run; re-read only to rebuild the open period.
    #[serde(default)]
    pub is_carried_over: bool,
    #[serde(default)]
    pub is_spike: bool,
    #[serde(default)]
    pub was_spike: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_latency: Option<u32>,
}

impl Sample {
    pub fn new(
        user_id: impl Into<String>,
        game_id: impl Into<String>,
        stream_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        latency: u32,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            game_id: game_id.into(),
            stream_id: stream_id.into(),
            timestamp,
            latency,
            sequence_index: 0,
            is_carried_over: false,
            is_spike: false,
            was_spike: false,
            original_latency: None,
        }
    }

    pub fn with_sequence_index(mut self, sequence_index: u64) -> Self {
        self.sequence_index = sequence_index;
        self
    }

    pub fn with_carried_over(mut self, carried_over: bool) -> Self {
        self.is_carried_over = carried_over;
        self
    }

    pub fn key(&self) -> SampleKey {
        SampleKey {
            stream_id: self.stream_id.clone(),
            timestamp: self.timestamp,
        }
    }

    /// True once the latency has been replaced by an alternative reading.
    #[inline]
    pub fn is_repaired(&self) -> bool {
        self.original_latency.is_some()
    }

    /// Replace the latency with an alternative reading.
    ///
    /// The first raw value is kept in `original_latency`; a repaired sample is
    /// no longer considered carried over so it gets re-persisted.
    pub fn repair(&mut self, latency: u32) {
        self.original_latency.get_or_insert(self.latency);
        self.latency = latency;
        self.is_carried_over = false;
    }

    /// Diverted by the segmenter instead of opening or extending a period.
    #[inline]
    pub fn is_out_of_range(&self) -> bool {
        self.latency == 0 || self.latency >= LATENCY_CEILING
    }
}

/// Persisted form of a period: bounds and flags without the samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodSummary {
    pub seq_idx: u32,
    pub user_id: String,
    pub game_id: String,
    pub min: u32,
    pub max: u32,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub stable: bool,
    pub is_spike: bool,
    pub length: usize,
}

/// Maximal chronological run of samples satisfying the band rule
#[derive(Debug, Clone, PartialEq)]
pub struct Period {
    pub seq_idx: u32,
    pub user_id: String,
    pub game_id: String,
    pub min: u32,
    pub max: u32,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub samples: Vec<Sample>,
    pub stable: bool,
    pub is_spike: bool,
    pub to_remove: bool,
}

impl Period {
    /// Build a period over `samples`, deriving bounds and window. `None` if empty.
    pub fn from_samples(
        seq_idx: u32,
        user_id: &str,
        game_id: &str,
        samples: Vec<Sample>,
    ) -> Option<Self> {
        let first = samples.first()?;
        let last = samples.last()?;
        let min = samples.iter().map(|s| s.latency).min()?;
        let max = samples.iter().map(|s| s.latency).max()?;

        Some(Self {
            seq_idx,
            user_id: user_id.to_string(),
            game_id: game_id.to_string(),
            min,
            max,
            start: first.timestamp,
            end: last.timestamp,
            stable: false,
            is_spike: false,
            to_remove: false,
            samples,
        })
    }

    pub fn with_stable(mut self, stable: bool) -> Self {
        self.stable = stable;
        self
    }

    pub fn with_spike(mut self, is_spike: bool) -> Self {
        self.is_spike = is_spike;
        self
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples not yet counted by the accumulator.
    pub fn new_points(&self) -> u64 {
        self.samples.iter().filter(|s| !s.is_carried_over).count() as u64
    }

    pub fn window(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.start, self.end)
    }

    pub fn summary(&self) -> PeriodSummary {
        PeriodSummary {
            seq_idx: self.seq_idx,
            user_id: self.user_id.clone(),
            game_id: self.game_id.clone(),
            min: self.min,
            max: self.max,
            start: self.start,
            end: self.end,
            stable: self.stable,
            is_spike: self.is_spike,
            length: self.samples.len(),
        }
    }
}

/// Durable running totals for one (user, game) pair.
///
/// Counts only grow and the stable bounds only widen. Stands in for a rescan
/// of the full history when deciding whether a period is stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Accumulator {
    pub total_points: u64,
    /// Points keyed by the digit length of their period's max latency
    pub per_digit_length: BTreeMap<u32, u64>,
    /// Lowest min and highest max over all stable periods seen
    pub stable_bounds: Option<(u32, u32)>,
}

impl Accumulator {
    pub fn record(&mut self, period_max: u32, new_points: u64) {
        self.total_points += new_points;
        *self
            .per_digit_length
            .entry(digit_len(period_max))
            .or_insert(0) += new_points;
    }

    /// Fraction of all accumulated points sharing the digit length of `period_max`.
    pub fn share(&self, period_max: u32) -> f64 {
        if self.total_points == 0 {
            return 0.0;
        }
        let class = self
            .per_digit_length
            .get(&digit_len(period_max))
            .copied()
            .unwrap_or(0);
        class as f64 / self.total_points as f64
    }

    pub fn widen(&mut self, min: u32, max: u32) {
        self.stable_bounds = Some(match self.stable_bounds {
            Some((lo, hi)) => (lo.min(min), hi.max(max)),
            None => (min, max),
        });
    }
}

/// Secondary OCR engine readings for one (user, game, timestamp)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlternativeMeasurement {
    pub timestamp: DateTime<Utc>,
    /// One candidate per engine, in engine order
    pub candidates: Vec<u32>,
}

impl AlternativeMeasurement {
    /// Most frequent candidate differing from `current`; ties go to the first seen.
    pub fn candidate_for(&self, current: u32) -> Option<u32> {
        let mut counts: Vec<(u32, usize)> = Vec::with_capacity(self.candidates.len());
        for &value in &self.candidates {
            match counts.iter_mut().find(|(v, _)| *v == value) {
                Some((_, n)) => *n += 1,
                None => counts.push((value, 1)),
            }
        }

        // Stable sort keeps first-seen order among equal counts
        counts.sort_by(|a, b| b.1.cmp(&a.1));
        counts
            .into_iter()
            .map(|(value, _)| value)
            .find(|&value| value != current)
    }
}

/// Alternative measurements for one (user, game), keyed by timestamp
#[derive(Debug, Clone, Default)]
pub struct AlternativeIndex {
    by_timestamp: HashMap<DateTime<Utc>, AlternativeMeasurement>,
}

impl AlternativeIndex {
    pub fn new(measurements: impl IntoIterator<Item = AlternativeMeasurement>) -> Self {
        Self {
            by_timestamp: measurements
                .into_iter()
                .map(|m| (m.timestamp, m))
                .collect(),
        }
    }

    /// Alternative latency for the sample at `timestamp`, if one differs from
    /// `current`. A zero candidate counts as no reading.
    pub fn lookup(&self, timestamp: DateTime<Utc>, current: u32) -> Option<u32> {
        self.by_timestamp
            .get(&timestamp)
            .and_then(|m| m.candidate_for(current))
            .filter(|&value| value != 0)
    }

    pub fn len(&self) -> usize {
        self.by_timestamp.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_timestamp.is_empty()
    }
}

/// Pending online work pushed by OCR ingestion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklogEntry {
    pub user_id: String,
    pub game_id: String,
    pub since: DateTime<Utc>,
}

/// One (user, game) unit of work
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkItem {
    pub user_id: String,
    pub game_id: String,
    pub since: DateTime<Utc>,
}
