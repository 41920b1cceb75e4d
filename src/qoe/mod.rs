//! Latency QoE Segmentation Engine
//!
//! Partitions a noisy OCR latency stream for one (user, game) pair into
//! stability periods, evicts implausible readings as glitches and marks
//! short transient excursions as spikes.
//!
//! Pipeline per unit of work:
//! segment -> classify -> repair glitches -> detect spikes -> reconcile with
//! alternative readings (possibly re-running everything) -> reconcile unstable
//! periods -> quality gate.

pub mod alternatives;
pub mod error;
pub mod glitches;
pub mod neighbours;
pub mod pipeline;
pub mod quality;
pub mod segmenter;
pub mod spikes;
pub mod stability;
pub mod unstable;

pub use alternatives::*;
pub use error::*;
pub use glitches::*;
pub use neighbours::*;
pub use pipeline::*;
pub use quality::*;
pub use segmenter::*;
pub use spikes::*;
pub use stability::*;
pub use unstable::*;

use std::collections::HashSet;

use crate::config::GameConfig;
use crate::models::{Accumulator, AlternativeIndex, Period, PeriodSummary, Sample, SampleKey};

/// Read-only state shared by every pass over one unit of work
#[derive(Debug, Clone, Copy)]
pub struct UnitContext<'a> {
    pub user_id: &'a str,
    pub game_id: &'a str,
    pub config: &'a GameConfig,
    /// Persisted periods preceding the reprocessed range, by seq_idx
    pub old_periods: &'a [PeriodSummary],
    pub alternatives: &'a AlternativeIndex,
    /// Accumulator as persisted before this run
    pub accumulator: &'a Accumulator,
    /// seq_idx of this run's first period
    pub initial_seq_idx: u32,
    pub max_iterations: usize,
}

impl<'a> UnitContext<'a> {
    #[inline]
    pub fn qoe_band(&self) -> u32 {
        self.config.qoe_band
    }

    pub fn segmenter(&self) -> SequenceSegmenter {
        SequenceSegmenter::new(self.config.qoe_band)
    }

    pub fn classifier(&self) -> StabilityClassifier {
        StabilityClassifier::new(self.config)
    }

    /// Segment chronological `samples` and classify the runs.
    ///
    /// Returns the periods and the samples the segmenter diverted.
    pub fn build_periods(
        &self,
        samples: Vec<Sample>,
        spike_windows: &SpikeWindows,
    ) -> (Vec<Period>, Vec<Sample>) {
        let mut segmentation = self.segmenter().segment(samples);
        let diverted = segmentation.take_diverted();
        let periods = self.classifier().classify(
            self.user_id,
            self.game_id,
            self.initial_seq_idx,
            segmentation.groups,
            self.accumulator,
            spike_windows,
        );
        (periods, diverted)
    }

    #[inline]
    pub fn neighbours(&self, periods: &[Period], idx: usize) -> StableNeighbours {
        StableNeighbours::locate(self.old_periods, periods, idx)
    }

    /// Whether the last persisted period before this run is a spike.
    pub fn previous_run_ends_in_spike(&self) -> Option<bool> {
        self.old_periods.last().map(|p| p.is_spike)
    }

    /// Stable period among the persisted ones before this run. The reopened
    /// last period is not in `old_periods`; its samples are re-segmented here
    /// and only count if they still form a stable period.
    pub fn has_old_stable(&self) -> bool {
        self.old_periods.iter().any(|p| p.stable)
    }

    /// Drop `to_remove` periods and `evicted` samples, then re-segment the rest.
    ///
    /// With `keep_spikes`, periods that reappear with the same window as a
    /// confirmed spike period keep their spike mark. Returns the new periods
    /// and any sample the segmenter diverted.
    pub fn restitch(
        &self,
        periods: Vec<Period>,
        evicted: &HashSet<SampleKey>,
        keep_spikes: bool,
    ) -> (Vec<Period>, Vec<Sample>) {
        let mut spike_windows = SpikeWindows::new();
        let mut samples = Vec::new();

        for period in periods {
            if keep_spikes && period.is_spike {
                spike_windows.insert(period.window());
            }
            if period.to_remove {
                continue;
            }
            samples.extend(
                period
                    .samples
                    .into_iter()
                    .filter(|s| !evicted.contains(&s.key())),
            );
        }

        if samples.is_empty() {
            return (Vec::new(), Vec::new());
        }

        self.build_periods(samples, &spike_windows)
    }
}

/// Flatten periods back into a chronological sample list.
pub fn samples_of(periods: &[Period]) -> Vec<Sample> {
    let mut samples: Vec<Sample> = periods.iter().flat_map(|p| p.samples.iter().cloned()).collect();
    samples.sort_by_key(|s| s.timestamp);
    samples
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fixtures shared by the engine's unit tests

    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    pub fn at(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::minutes(minute)
    }

    /// One sample per latency, `step` minutes apart, starting at `from`
    pub fn series(from: i64, step: i64, latencies: &[u32]) -> Vec<Sample> {
        latencies
            .iter()
            .enumerate()
            .map(|(i, &l)| {
                let minute = from + i as i64 * step;
                Sample::new("u", "g", "s", at(minute), l).with_sequence_index(minute as u64)
            })
            .collect()
    }

    /// `count` samples at `latency`, one every 5 minutes
    pub fn plateau(from: i64, count: usize, latency: u32) -> Vec<Sample> {
        series(from, 5, &vec![latency; count])
    }

    pub struct Fixture {
        pub config: GameConfig,
        pub old_periods: Vec<PeriodSummary>,
        pub alternatives: AlternativeIndex,
        pub accumulator: Accumulator,
        pub max_iterations: usize,
    }

    impl Default for Fixture {
        fn default() -> Self {
            Self {
                config: GameConfig::default(),
                old_periods: Vec::new(),
                alternatives: AlternativeIndex::default(),
                accumulator: Accumulator::default(),
                max_iterations: 64,
            }
        }
    }

    impl Fixture {
        pub fn ctx(&self) -> UnitContext<'_> {
            UnitContext {
                user_id: "u",
                game_id: "g",
                config: &self.config,
                old_periods: &self.old_periods,
                alternatives: &self.alternatives,
                accumulator: &self.accumulator,
                initial_seq_idx: self.old_periods.len() as u32,
                max_iterations: self.max_iterations,
            }
        }
    }

    pub fn alternative(minute: i64, candidates: &[u32]) -> crate::models::AlternativeMeasurement {
        crate::models::AlternativeMeasurement {
            timestamp: at(minute),
            candidates: candidates.to_vec(),
        }
    }

    pub fn concat(parts: Vec<Vec<Sample>>) -> Vec<Sample> {
        parts.into_iter().flatten().collect()
    }
}
