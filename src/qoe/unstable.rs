//! Unstable Reconciler
//!
//! Last word on unstable periods that are neither spikes nor close to a
//! stable neighbour. Before giving up on them the orchestrator gets one more
//! chance to repair their points from alternative readings; whatever is still
//! out of place afterwards is evicted.

use std::collections::HashSet;

use super::glitches::try_alternative_fix;
use super::neighbours::{Bounds, StableNeighbours};
use super::UnitContext;
use crate::models::{Period, Sample};

/// Periods left after the final pass and what it evicted
#[derive(Debug, Clone, Default)]
pub struct UnstableOutcome {
    pub periods: Vec<Period>,
    pub removed: Vec<Period>,
    pub glitches: Vec<Sample>,
}

pub struct UnstableReconciler<'c, 'a> {
    ctx: &'c UnitContext<'a>,
}

impl<'c, 'a> UnstableReconciler<'c, 'a> {
    pub fn new(ctx: &'c UnitContext<'a>) -> Self {
        Self { ctx }
    }

    /// Closeness test: the period is kept when it is close to its previous
    /// stable neighbour, or when there is no next neighbour, or when it is
    /// close to the next one.
    pub fn is_retained(&self, period: &Period, neighbours: &StableNeighbours) -> bool {
        let band = self.ctx.qoe_band();
        let bounds = Bounds::from(period);

        if neighbours.previous.is_some_and(|p| bounds.close_to(&p, band)) {
            return true;
        }
        neighbours.next.map_or(true, |n| bounds.close_to(&n, band))
    }

    fn candidates(&self, periods: &[Period]) -> Vec<(usize, StableNeighbours)> {
        (0..periods.len())
            .filter(|&idx| !periods[idx].stable && !periods[idx].is_spike)
            .filter_map(|idx| {
                let neighbours = self.ctx.neighbours(periods, idx);
                (!self.is_retained(&periods[idx], &neighbours)).then_some((idx, neighbours))
            })
            .collect()
    }

    /// Try to repair the points of every period that would be evicted.
    ///
    /// Returns whether any point changed, in which case the unit has to be
    /// reprocessed before the final pass.
    pub fn repair_attempt(&self, periods: &mut [Period]) -> bool {
        let mut fixed_any = false;

        for (idx, neighbours) in self.candidates(periods) {
            for sample in periods[idx].samples.iter_mut() {
                if sample.is_repaired() {
                    continue;
                }
                fixed_any |= try_alternative_fix(self.ctx, sample, &neighbours);
            }
        }

        fixed_any
    }

    /// Evict every period failing the closeness test and re-segment the rest,
    /// keeping spike marks.
    pub fn reconcile(&self, mut periods: Vec<Period>) -> UnstableOutcome {
        let mut outcome = UnstableOutcome::default();

        for (idx, _) in self.candidates(&periods) {
            let period = &mut periods[idx];
            period.to_remove = true;
            outcome.glitches.extend(period.samples.iter().cloned());
            outcome.removed.push(period.clone());
        }

        if outcome.removed.is_empty() {
            outcome.periods = periods;
            return outcome;
        }

        let (stitched, leftover) = self.ctx.restitch(periods, &HashSet::new(), true);
        outcome.periods = stitched;
        outcome.glitches.extend(leftover);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::SpikeWindows;
    use super::*;
    use crate::models::AlternativeIndex;

    #[test]
    fn test_close_to_previous_is_retained() {
        let fx = Fixture::default();
        let ctx = fx.ctx();
        let reconciler = UnstableReconciler::new(&ctx);
        let period = Period::from_samples(1, "u", "g", series(50, 1, &[52, 58])).unwrap();

        let close = Bounds { min: 45, max: 60 };
        let far = Bounds { min: 200, max: 210 };
        assert!(reconciler.is_retained(&period, &StableNeighbours { previous: Some(close), next: Some(far) }));
        assert!(reconciler.is_retained(&period, &StableNeighbours { previous: Some(far), next: None }));
        assert!(reconciler.is_retained(&period, &StableNeighbours { previous: None, next: Some(close) }));
        assert!(!reconciler.is_retained(&period, &StableNeighbours { previous: Some(far), next: Some(far) }));
        assert!(!reconciler.is_retained(&period, &StableNeighbours { previous: None, next: Some(far) }));
    }

    fn layout() -> Vec<Sample> {
        // stable 40s, unstable 70s, stable 40s
        concat(vec![plateau(0, 10, 40), series(50, 1, &[70, 72, 75]), plateau(55, 10, 42)])
    }

    #[test]
    fn test_far_period_evicted_and_neighbours_merge() {
        let fx = Fixture::default();
        let ctx = fx.ctx();
        let (periods, _) = ctx.build_periods(layout(), &SpikeWindows::new());
        assert_eq!(periods.len(), 3);
        assert!(!periods[1].stable);

        let outcome = UnstableReconciler::new(&ctx).reconcile(periods);
        assert_eq!(outcome.removed.len(), 1);
        assert_eq!(outcome.glitches.len(), 3);
        assert_eq!(outcome.periods.len(), 1);
        assert_eq!(outcome.periods[0].len(), 20);
    }

    #[test]
    fn test_spike_periods_survive_and_keep_mark() {
        let fx = Fixture::default();
        let ctx = fx.ctx();
        let samples = concat(vec![
            plateau(0, 10, 40),
            series(50, 1, &[70, 72]),
            series(52, 1, &[140, 141]),
            plateau(55, 10, 42),
        ]);
        let (mut periods, _) = ctx.build_periods(samples, &SpikeWindows::new());
        assert_eq!(periods.len(), 4);
        periods[2].is_spike = true;

        let outcome = UnstableReconciler::new(&ctx).reconcile(periods);
        assert_eq!(outcome.removed.len(), 1);
        assert_eq!(outcome.periods.len(), 3);
        assert!(outcome.periods[1].is_spike);
        assert_eq!(outcome.periods[1].min, 140);
    }

    #[test]
    fn test_repair_attempt_fixes_points_of_far_periods() {
        let mut fx = Fixture::default();
        fx.alternatives = AlternativeIndex::new(vec![alternative(50, &[41]), alternative(51, &[300])]);
        let ctx = fx.ctx();
        let (mut periods, _) = ctx.build_periods(layout(), &SpikeWindows::new());

        assert!(UnstableReconciler::new(&ctx).repair_attempt(&mut periods));
        let latencies: Vec<u32> = periods[1].samples.iter().map(|s| s.latency).collect();
        assert_eq!(latencies, vec![41, 72, 75]);
    }

    #[test]
    fn test_nothing_to_do_keeps_periods() {
        let fx = Fixture::default();
        let ctx = fx.ctx();
        let samples = concat(vec![
            series(0, 5, &[40, 44, 42, 41, 43, 40, 44, 42, 41, 43]),
            series(50, 1, &[56, 46]),
            plateau(55, 10, 100),
        ]);
        let (periods, _) = ctx.build_periods(samples, &SpikeWindows::new());
        let count = periods.len();
        assert_eq!(count, 3);
        assert!(!periods[1].stable);

        let mut copy = periods.clone();
        assert!(!UnstableReconciler::new(&ctx).repair_attempt(&mut copy));
        let outcome = UnstableReconciler::new(&ctx).reconcile(periods);
        assert!(outcome.removed.is_empty());
        assert_eq!(outcome.periods.len(), count);
    }
}
