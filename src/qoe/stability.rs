//! Stability Classifier
//!
//! Turns segmented runs into numbered periods and labels each one stable or
//! unstable. A period is stable when it lasts long enough and its digit-length
//! class is well represented in the pair's accumulated history.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::config::GameConfig;
use crate::models::{Accumulator, Period, Sample};

/// Windows `(start, end)` of periods already confirmed as spikes
pub type SpikeWindows = HashSet<(DateTime<Utc>, DateTime<Utc>)>;

#[derive(Debug, Clone, Copy)]
pub struct StabilityClassifier {
    stable_length: chrono::Duration,
    stable_share: f64,
}

impl StabilityClassifier {
    pub fn new(config: &GameConfig) -> Self {
        Self {
            stable_length: config.stable_length(),
            stable_share: config.stable_share,
        }
    }

    /// Stability test against an accumulator that already includes the period.
    #[inline]
    pub fn is_stable(&self, period: &Period, accumulator: &Accumulator) -> bool {
        period.end - period.start >= self.stable_length
            && accumulator.share(period.max) > self.stable_share
    }

    /// Number and classify `groups` in order.
    ///
    /// Works on a copy of `baseline`: each period's new points are recorded
    /// before it is tested, so later periods see the earlier ones. A period
    /// whose window is in `spike_windows` keeps its spike mark.
    pub fn classify(
        &self,
        user_id: &str,
        game_id: &str,
        initial_seq_idx: u32,
        groups: Vec<Vec<Sample>>,
        baseline: &Accumulator,
        spike_windows: &SpikeWindows,
    ) -> Vec<Period> {
        let mut running = baseline.clone();
        let mut periods = Vec::with_capacity(groups.len());

        for group in groups {
            let seq_idx = initial_seq_idx + periods.len() as u32;
            let Some(period) = Period::from_samples(seq_idx, user_id, game_id, group) else {
                continue;
            };

            running.record(period.max, period.new_points());
            let stable = self.is_stable(&period, &running);
            let is_spike = spike_windows.contains(&period.window());

            periods.push(period.with_stable(stable).with_spike(is_spike));
        }

        periods
    }
}
