//! QoE Quality Gate
//!
//! Accepts or discards the whole processed batch of a unit depending on how
//! much of it ended up classified as spikes.

use tracing::warn;

use crate::config::GameConfig;
use crate::models::Period;

/// Sample counts per period class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassCounts {
    pub stable: usize,
    pub spikes: usize,
    pub unstable: usize,
}

impl ClassCounts {
    pub fn from_periods(periods: &[Period]) -> Self {
        let mut counts = Self::default();
        for period in periods {
            if period.stable {
                counts.stable += period.len();
            } else if period.is_spike {
                counts.spikes += period.len();
            } else {
                counts.unstable += period.len();
            }
        }
        counts
    }

    #[inline]
    pub fn total(&self) -> usize {
        self.stable + self.spikes + self.unstable
    }

    /// `None` when there is nothing to measure
    pub fn spike_fraction(&self) -> Option<f64> {
        match self.total() {
            0 => None,
            total => Some(self.spikes as f64 / total as f64),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Commit,
    Discard,
}

#[derive(Debug, Clone, Copy)]
pub struct QualityGate {
    max_spike_proportion: f64,
}

impl QualityGate {
    pub fn new(max_spike_proportion: f64) -> Self {
        Self {
            max_spike_proportion,
        }
    }

    pub fn for_game(config: &GameConfig) -> Self {
        Self::new(config.max_spike_proportion)
    }

    /// Discard when the spike fraction reaches the threshold or when there is
    /// no sample at all.
    #[inline]
    pub fn decide(&self, counts: &ClassCounts) -> GateDecision {
        match counts.spike_fraction() {
            Some(fraction) if fraction < self.max_spike_proportion => GateDecision::Commit,
            _ => GateDecision::Discard,
        }
    }

    pub fn evaluate(&self, user_id: &str, game_id: &str, periods: &[Period]) -> GateDecision {
        let counts = ClassCounts::from_periods(periods);
        let decision = self.decide(&counts);

        if decision == GateDecision::Discard {
            warn!(
                user = %user_id,
                game = %game_id,
                stable = counts.stable,
                spikes = counts.spikes,
                unstable = counts.unstable,
                threshold = self.max_spike_proportion,
                "🛑 discarding batch, too many spikes"
            );
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Sample;
    use chrono::{TimeZone, Utc};

    fn counts(stable: usize, spikes: usize, unstable: usize) -> ClassCounts {
        ClassCounts {
            stable,
            spikes,
            unstable,
        }
    }

    #[test]
    fn test_majority_spikes_discarded() {
        let gate = QualityGate::new(0.5);
        assert_eq!(gate.decide(&counts(400, 501, 99)), GateDecision::Discard);
    }

    #[test]
    fn test_threshold_boundary() {
        let gate = QualityGate::new(0.5);
        assert_eq!(gate.decide(&counts(500, 500, 0)), GateDecision::Discard);
        assert_eq!(gate.decide(&counts(501, 499, 0)), GateDecision::Commit);
    }

    #[test]
    fn test_empty_batch_discarded() {
        let gate = QualityGate::new(0.5);
        assert_eq!(gate.decide(&ClassCounts::default()), GateDecision::Discard);
    }

    #[test]
    fn test_counts_by_class() {
        let t0 = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let period = |n: usize, stable: bool, spike: bool| {
            let samples = (0..n)
                .map(|i| Sample::new("u", "g", "s", t0 + chrono::Duration::minutes(i as i64), 40))
                .collect();
            Period::from_samples(0, "u", "g", samples)
                .unwrap()
                .with_stable(stable)
                .with_spike(spike)
        };

        let periods = vec![period(6, true, false), period(3, false, true), period(1, false, false)];
        let c = ClassCounts::from_periods(&periods);
        assert_eq!(c, counts(6, 3, 1));
        assert!((c.spike_fraction().unwrap() - 0.3).abs() < 1e-9);
        assert_eq!(QualityGate::new(0.5).evaluate("u", "g", &periods), GateDecision::Commit);
    }
}
