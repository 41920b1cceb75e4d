//! Glitch Repairer
//!
//! Rescues or evicts implausible readings. Zero/overflow samples are either
//! replaced by an alternative reading and folded back into the periods, or
//! evicted outright. Unstable periods lying entirely below every stable
//! neighbour get a per-point repair attempt; points that cannot be repaired
//! are evicted, and a period with no repairable point is removed.

use std::collections::HashSet;

use tracing::debug;

use super::error::{EngineError, EngineResult, Stage};
use super::neighbours::StableNeighbours;
use super::stability::SpikeWindows;
use super::UnitContext;
use crate::models::{Period, Sample, SampleKey};

/// Result of the glitch repair loop
#[derive(Debug, Clone, Default)]
pub struct RepairOutcome {
    /// Periods after the final restitch
    pub periods: Vec<Period>,
    /// Periods dropped because none of their points could be repaired
    pub removed: Vec<Period>,
    /// Evicted samples
    pub glitches: Vec<Sample>,
    /// Number of repair passes that changed something
    pub passes: usize,
}

/// Try to replace `sample` with its alternative reading.
///
/// The alternative must move the point strictly closer to the previous
/// neighbour's min and, when a next neighbour exists, strictly closer to the
/// next neighbour's min as well. The test starts from `false`, so a period
/// with only a next neighbour never accepts a repair.
pub fn try_alternative_fix(
    ctx: &UnitContext<'_>,
    sample: &mut Sample,
    neighbours: &StableNeighbours,
) -> bool {
    let Some(candidate) = ctx.alternatives.lookup(sample.timestamp, sample.latency) else {
        return false;
    };

    let original = sample.latency;
    let closer = |min: u32| candidate.abs_diff(min) < original.abs_diff(min);

    let mut fixed = false;
    if let Some(previous) = neighbours.previous {
        fixed = fixed || closer(previous.min);
    }
    if let Some(next) = neighbours.next {
        fixed = fixed && closer(next.min);
    }

    if fixed {
        sample.repair(candidate);
    }
    fixed
}

/// Unstable period sitting more than one band below every stable neighbour.
#[inline]
pub fn is_suspiciously_low(period: &Period, neighbours: &StableNeighbours, band: u32) -> bool {
    neighbours
        .iter()
        .all(|n| n.min as i64 - band as i64 > period.max as i64)
}

pub struct GlitchRepairer<'c, 'a> {
    ctx: &'c UnitContext<'a>,
}

impl<'c, 'a> GlitchRepairer<'c, 'a> {
    pub fn new(ctx: &'c UnitContext<'a>) -> Self {
        Self { ctx }
    }

    /// Run the repair loop to a fixed point.
    ///
    /// `diverted` are the zero/overflow samples the segmenter set aside.
    pub fn repair(&self, periods: Vec<Period>, diverted: Vec<Sample>) -> EngineResult<RepairOutcome> {
        let ctx = self.ctx;
        let mut outcome = RepairOutcome::default();

        let mut periods = self.fold_back(periods, diverted, &mut outcome.glitches);

        loop {
            let mut evicted: HashSet<SampleKey> = HashSet::new();
            let mut any_fixed = false;

            for idx in 0..periods.len() {
                if periods[idx].stable {
                    continue;
                }

                let neighbours = ctx.neighbours(&periods, idx);
                if !is_suspiciously_low(&periods[idx], &neighbours, ctx.qoe_band()) {
                    continue;
                }

                let period = &mut periods[idx];
                let mut period_fixed = false;

                for sample in period.samples.iter_mut() {
                    // A point repaired once that is still this low is a glitch
                    if !sample.is_repaired() && try_alternative_fix(ctx, sample, &neighbours) {
                        period_fixed = true;
                        continue;
                    }
                    evicted.insert(sample.key());
                    outcome.glitches.push(sample.clone());
                }

                if !period_fixed {
                    period.to_remove = true;
                    outcome.removed.push(period.clone());
                }
                any_fixed |= period_fixed;
            }

            let (stitched, leftover) = ctx.restitch(periods, &evicted, false);
            periods = stitched;
            outcome.glitches.extend(leftover);

            if !any_fixed {
                break;
            }

            outcome.passes += 1;
            debug!(
                user = %ctx.user_id,
                game = %ctx.game_id,
                pass = outcome.passes,
                "glitch repair pass fixed points, re-segmenting"
            );
            if outcome.passes >= ctx.max_iterations {
                return Err(EngineError::NonConvergence {
                    stage: Stage::GlitchRepair,
                    limit: ctx.max_iterations,
                });
            }
        }

        outcome.periods = periods;
        Ok(outcome)
    }

    /// Replace diverted samples with their alternative reading and merge them
    /// back; samples without one are glitches.
    fn fold_back(&self, periods: Vec<Period>, diverted: Vec<Sample>, glitches: &mut Vec<Sample>) -> Vec<Period> {
        let ctx = self.ctx;
        let mut repaired = Vec::new();

        for mut sample in diverted {
            match ctx.alternatives.lookup(sample.timestamp, sample.latency) {
                Some(candidate) => {
                    sample.repair(candidate);
                    repaired.push(sample);
                }
                None => glitches.push(sample),
            }
        }

        if repaired.is_empty() {
            return periods;
        }

        let mut samples = super::samples_of(&periods);
        samples.extend(repaired);
        samples.sort_by_key(|s| s.timestamp);

        let (periods, still_diverted) = ctx.build_periods(samples, &SpikeWindows::new());
        glitches.extend(still_diverted);
        periods
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::models::AlternativeIndex;
    use crate::qoe::neighbours::Bounds;

    fn sandwich() -> Vec<Sample> {
        concat(vec![plateau(0, 10, 100), series(50, 1, &[20, 18, 20]), plateau(60, 10, 105)])
    }

    #[test]
    fn test_unrepairable_low_period_is_evicted() {
        let fx = Fixture::default();
        let ctx = fx.ctx();
        let (periods, diverted) = ctx.build_periods(sandwich(), &SpikeWindows::new());
        assert_eq!(periods.len(), 3);
        assert!(periods[0].stable && !periods[1].stable && periods[2].stable);

        let outcome = GlitchRepairer::new(&ctx).repair(periods, diverted).unwrap();
        assert_eq!(outcome.glitches.len(), 3);
        assert_eq!(outcome.removed.len(), 1);
        assert_eq!(outcome.passes, 0);
        // Neighbours merge once the low run is gone
        assert_eq!(outcome.periods.len(), 1);
        assert_eq!(outcome.periods[0].len(), 20);
    }

    #[test]
    fn test_repairable_points_survive() {
        let mut fx = Fixture::default();
        fx.alternatives = AlternativeIndex::new(vec![alternative(50, &[102]), alternative(51, &[101])]);
        let ctx = fx.ctx();
        let (periods, diverted) = ctx.build_periods(sandwich(), &SpikeWindows::new());

        let outcome = GlitchRepairer::new(&ctx).repair(periods, diverted).unwrap();
        // minute 52 had no alternative
        assert_eq!(outcome.glitches.len(), 1);
        assert_eq!(outcome.glitches[0].timestamp, at(52));
        assert!(outcome.removed.is_empty());
        assert_eq!(outcome.passes, 1);
        assert_eq!(outcome.periods.len(), 1);
        let repaired: Vec<_> = outcome.periods[0].samples.iter().filter(|s| s.is_repaired()).collect();
        assert_eq!(repaired.len(), 2);
        assert_eq!(repaired[0].original_latency, Some(20));
        assert_eq!(repaired[0].latency, 102);
    }

    #[test]
    fn test_zeroes_folded_back_or_evicted() {
        let mut fx = Fixture::default();
        fx.alternatives = AlternativeIndex::new(vec![alternative(50, &[0, 101, 101])]);
        let ctx = fx.ctx();
        let samples = concat(vec![plateau(0, 10, 100), series(50, 1, &[0, 0, 1500])]);
        let (periods, diverted) = ctx.build_periods(samples, &SpikeWindows::new());
        assert_eq!(diverted.len(), 3);

        let outcome = GlitchRepairer::new(&ctx).repair(periods, diverted).unwrap();
        assert_eq!(outcome.glitches.len(), 2);
        assert_eq!(outcome.periods.len(), 1);
        assert_eq!(outcome.periods[0].len(), 11);
        let folded = outcome.periods[0].samples.last().unwrap();
        assert_eq!((folded.latency, folded.original_latency), (101, Some(0)));
    }

    #[test]
    fn test_fix_needs_previous_neighbour() {
        let mut fx = Fixture::default();
        fx.alternatives = AlternativeIndex::new(vec![alternative(0, &[95])]);
        let ctx = fx.ctx();
        let base = Sample::new("u", "g", "s", at(0), 20);
        let bounds = Bounds { min: 100, max: 110 };

        let mut only_next = base.clone();
        let n = StableNeighbours { previous: None, next: Some(bounds) };
        assert!(!try_alternative_fix(&ctx, &mut only_next, &n));
        assert_eq!(only_next.latency, 20);

        let mut only_previous = base.clone();
        let n = StableNeighbours { previous: Some(bounds), next: None };
        assert!(try_alternative_fix(&ctx, &mut only_previous, &n));
        assert_eq!(only_previous.latency, 95);

        let mut both = base;
        let n = StableNeighbours { previous: Some(bounds), next: Some(Bounds { min: 10, max: 20 }) };
        assert!(!try_alternative_fix(&ctx, &mut both, &n));
    }

    #[test]
    fn test_suspiciously_low_needs_every_neighbour() {
        let period = Period::from_samples(0, "u", "g", series(0, 1, &[20, 25])).unwrap();
        let high = Bounds { min: 100, max: 110 };
        let near = Bounds { min: 35, max: 40 };
        let both_high = StableNeighbours { previous: Some(high), next: Some(high) };
        let one_near = StableNeighbours { previous: Some(high), next: Some(near) };
        assert!(is_suspiciously_low(&period, &both_high, 15));
        assert!(!is_suspiciously_low(&period, &one_near, 15));
    }
}
