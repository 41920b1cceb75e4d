//! Per-unit QoE pipeline
//!
//! Drives one (user, game) unit to a fixed point:
//! segment -> classify -> repair glitches -> detect spikes -> reconcile.
//! A reconciliation that rewrites any sample restarts the unit from
//! segmentation with the corrected samples. Once nothing changes, the final
//! unstable pass runs and the result is handed to the quality gate by the
//! caller.

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use tracing::debug;

use super::alternatives::AlternativeReconciler;
use super::error::{EngineError, EngineResult, Stage};
use super::glitches::GlitchRepairer;
use super::spikes::SpikeDetector;
use super::stability::SpikeWindows;
use super::unstable::UnstableReconciler;
use super::{samples_of, UnitContext};
use crate::config::GameConfig;
use crate::models::{Accumulator, AlternativeIndex, Period, PeriodSummary, Sample, SampleKey};

/// Points already persisted by a previous run, by (timestamp, stream, index)
pub type CarriedOverKeys = HashSet<(DateTime<Utc>, String, u64)>;

/// Everything loaded for one unit of work
#[derive(Debug, Clone, Default)]
pub struct UnitInput {
    pub user_id: String,
    pub game_id: String,
    /// Prepared samples, see [`prepare_samples`]
    pub samples: Vec<Sample>,
    /// Persisted periods before the reprocessed range
    pub old_periods: Vec<PeriodSummary>,
    pub alternatives: AlternativeIndex,
    pub accumulator: Accumulator,
    pub initial_seq_idx: u32,
}

/// Converged output of one unit
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitResult {
    pub periods: Vec<Period>,
    /// Periods evicted in the final iteration
    pub removed: Vec<Period>,
    /// Evicted samples, one per key
    pub glitches: Vec<Sample>,
    /// Points of spike periods found in the final iteration
    pub spikes: Vec<Sample>,
    /// Number of full runs, 1 when nothing had to be reprocessed
    pub iterations: usize,
}

/// What a committed unit writes back
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitPlan {
    /// New or rewritten points; carried-over points are already persisted
    pub points: Vec<Sample>,
    /// Evicted samples; their keys leave the points table
    pub glitches: Vec<Sample>,
    pub periods: Vec<PeriodSummary>,
    pub accumulator: Accumulator,
    /// Day offsets from the reference date with at least one point
    pub active_days: BTreeSet<i64>,
}

impl UnitResult {
    /// Points that would be persisted, for both commit and discard.
    pub fn new_points(&self) -> Vec<Sample> {
        self.periods
            .iter()
            .flat_map(|p| p.samples.iter())
            .filter(|s| !s.is_carried_over)
            .cloned()
            .collect()
    }

    pub fn commit_plan(&self, baseline: &Accumulator, reference_date: DateTime<Utc>) -> CommitPlan {
        let mut accumulator = baseline.clone();
        let mut active_days = BTreeSet::new();

        for period in &self.periods {
            if period.stable {
                accumulator.widen(period.min, period.max);
            }
            accumulator.record(period.max, period.new_points());

            for sample in &period.samples {
                active_days.insert(day_offset(reference_date, sample.timestamp));
            }
        }

        CommitPlan {
            points: self.new_points(),
            glitches: self.glitches.clone(),
            periods: self.periods.iter().map(Period::summary).collect(),
            accumulator,
            active_days,
        }
    }
}

/// Whole days from `reference` to `t`, rounded down.
#[inline]
pub fn day_offset(reference: DateTime<Utc>, t: DateTime<Utc>) -> i64 {
    (t - reference).num_seconds().div_euclid(86_400)
}

/// Correct, order and number raw samples for the engine.
///
/// Samples dropped by the game's corrections vanish here. Numbering starts at
/// `init_idx`; a sample whose (timestamp, stream, index) was persisted before
/// is marked carried over.
pub fn prepare_samples(
    raw: Vec<Sample>,
    config: &GameConfig,
    init_idx: u64,
    carried_over: &CarriedOverKeys,
) -> Vec<Sample> {
    let mut samples: Vec<Sample> = raw.into_iter().filter_map(|s| config.correct(s)).collect();
    samples.sort_by_key(|s| s.timestamp);

    for (offset, sample) in samples.iter_mut().enumerate() {
        sample.sequence_index = init_idx + offset as u64;
        sample.is_carried_over =
            carried_over.contains(&(sample.timestamp, sample.stream_id.clone(), sample.sequence_index));
    }
    samples
}

pub struct QoePipeline<'a> {
    config: &'a GameConfig,
    max_iterations: usize,
}

impl<'a> QoePipeline<'a> {
    pub fn new(config: &'a GameConfig, max_iterations: usize) -> Self {
        Self {
            config,
            max_iterations,
        }
    }

    /// Run the unit to convergence.
    ///
    /// `Ok(None)` when no stable period exists in this run nor in the
    /// persisted history: the unit yields nothing.
    pub fn run(&self, input: &UnitInput) -> EngineResult<Option<UnitResult>> {
        let ctx = UnitContext {
            user_id: &input.user_id,
            game_id: &input.game_id,
            config: self.config,
            old_periods: &input.old_periods,
            alternatives: &input.alternatives,
            accumulator: &input.accumulator,
            initial_seq_idx: input.initial_seq_idx,
            max_iterations: self.max_iterations,
        };

        let mut samples = input.samples.clone();
        let mut glitches = GlitchLog::default();
        let mut iterations = 0usize;

        loop {
            iterations += 1;

            let (periods, diverted) = ctx.build_periods(samples, &SpikeWindows::new());
            if !periods.iter().any(|p| p.stable) && !ctx.has_old_stable() {
                debug!(user = %ctx.user_id, game = %ctx.game_id, "no stable period, skipping unit");
                return Ok(None);
            }

            let repaired = GlitchRepairer::new(&ctx).repair(periods, diverted)?;
            glitches.extend(repaired.glitches);
            let mut periods = repaired.periods;

            let spikes = SpikeDetector::new(&ctx).detect(&mut periods)?;

            let unstable = UnstableReconciler::new(&ctx);
            let should_reprocess = AlternativeReconciler::new(&ctx).reconcile(&mut periods)
                || unstable.repair_attempt(&mut periods);

            if should_reprocess {
                if iterations >= self.max_iterations {
                    return Err(EngineError::NonConvergence {
                        stage: Stage::Reprocess,
                        limit: self.max_iterations,
                    });
                }
                debug!(
                    user = %ctx.user_id,
                    game = %ctx.game_id,
                    iteration = iterations,
                    "samples rewritten, reprocessing unit"
                );

                samples = samples_of(&periods);
                for sample in samples.iter_mut() {
                    sample.is_spike = false;
                }
                continue;
            }

            let finished = unstable.reconcile(periods);
            glitches.extend(finished.glitches);

            let mut removed = repaired.removed;
            removed.extend(finished.removed);

            return Ok(Some(UnitResult {
                periods: finished.periods,
                removed,
                glitches: glitches.into_inner(),
                spikes,
                iterations,
            }));
        }
    }
}

/// Glitches collected over every iteration, first occurrence per key
#[derive(Debug, Default)]
struct GlitchLog {
    seen: HashSet<SampleKey>,
    glitches: Vec<Sample>,
}

impl GlitchLog {
    fn extend(&mut self, glitches: impl IntoIterator<Item = Sample>) {
        for glitch in glitches {
            if self.seen.insert(glitch.key()) {
                self.glitches.push(glitch);
            }
        }
    }

    fn into_inner(self) -> Vec<Sample> {
        self.glitches
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::config::{LatencyOffset, TimeWindow};
    use chrono::TimeZone;

    const LOW: [u32; 10] = [90, 95, 99, 92, 94, 96, 98, 91, 93, 97];
    const HIGH: [u32; 10] = [115, 120, 118, 116, 119, 117, 115, 120, 118, 116];

    fn input(samples: Vec<Sample>, fx: &Fixture) -> UnitInput {
        UnitInput {
            user_id: "u".into(),
            game_id: "g".into(),
            samples,
            old_periods: fx.old_periods.clone(),
            alternatives: fx.alternatives.clone(),
            accumulator: fx.accumulator.clone(),
            initial_seq_idx: fx.old_periods.len() as u32,
        }
    }

    fn spike_layout() -> Vec<Sample> {
        concat(vec![series(0, 5, &LOW), series(50, 1, &[140, 128, 126]), series(60, 5, &HIGH)])
    }

    #[test]
    fn test_unit_without_stable_period_yields_nothing() {
        let fx = Fixture::default();
        let unit = input(series(0, 1, &[40, 41, 42]), &fx);
        let result = QoePipeline::new(&fx.config, 64).run(&unit).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_old_stable_period_keeps_unit_alive() {
        let mut fx = Fixture::default();
        let old = Period::from_samples(0, "u", "g", series(-120, 10, &[40, 41, 42, 40]))
            .unwrap()
            .with_stable(true);
        fx.old_periods = vec![old.summary()];

        let unit = input(series(0, 1, &[40, 41, 42]), &fx);
        let result = QoePipeline::new(&fx.config, 64).run(&unit).unwrap().unwrap();
        assert_eq!(result.periods.len(), 1);
        assert_eq!(result.periods[0].seq_idx, 1);
    }

    #[test]
    fn test_low_run_evicted_end_to_end() {
        let fx = Fixture::default();
        let samples = concat(vec![plateau(0, 10, 100), series(50, 1, &[20, 18, 20]), plateau(60, 10, 105)]);
        let result = QoePipeline::new(&fx.config, 64).run(&input(samples, &fx)).unwrap().unwrap();

        assert_eq!(result.glitches.len(), 3);
        assert_eq!(result.periods.len(), 1);
        assert_eq!(result.removed.len(), 1);
        assert_eq!(result.removed[0].max, 20);
        assert!(result.spikes.is_empty());
        assert_eq!(result.iterations, 1);
    }

    #[test]
    fn test_spike_reported_and_kept() {
        let fx = Fixture::default();
        let result = QoePipeline::new(&fx.config, 64).run(&input(spike_layout(), &fx)).unwrap().unwrap();

        assert_eq!(result.periods.len(), 3);
        assert!(result.periods[1].is_spike);
        assert_eq!(result.spikes.len(), 3);
        assert!(result.glitches.is_empty());
    }

    #[test]
    fn test_spike_corrected_by_alternatives_is_reprocessed() {
        let mut fx = Fixture::default();
        fx.alternatives = crate::models::AlternativeIndex::new(vec![
            alternative(50, &[95]),
            alternative(51, &[96]),
            alternative(52, &[97]),
        ]);
        let result = QoePipeline::new(&fx.config, 64).run(&input(spike_layout(), &fx)).unwrap().unwrap();

        assert_eq!(result.iterations, 2);
        assert_eq!(result.periods.len(), 2);
        assert!(result.spikes.is_empty());
        let corrected: Vec<&Sample> = result.periods[0].samples.iter().filter(|s| s.was_spike).collect();
        assert_eq!(corrected.len(), 3);
        assert!(corrected.iter().all(|s| !s.is_spike));
    }

    #[test]
    fn test_reprocess_ceiling() {
        let mut fx = Fixture::default();
        fx.alternatives = crate::models::AlternativeIndex::new(vec![alternative(50, &[95])]);
        let err = QoePipeline::new(&fx.config, 1)
            .run(&input(spike_layout(), &fx))
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::NonConvergence {
                stage: Stage::Reprocess,
                limit: 1
            }
        );
    }

    #[test]
    fn test_rerun_on_converged_output_is_identical() {
        let fx = Fixture::default();
        let pipeline = QoePipeline::new(&fx.config, 64);

        let first = pipeline.run(&input(spike_layout(), &fx)).unwrap().unwrap();
        let again = pipeline.run(&input(spike_layout(), &fx)).unwrap().unwrap();
        assert_eq!(first, again);

        let rerun = pipeline
            .run(&input(samples_of(&first.periods), &fx))
            .unwrap()
            .unwrap();
        assert_eq!(rerun.periods, first.periods);
        assert_eq!(rerun.spikes, first.spikes);
        assert_eq!(rerun.glitches, first.glitches);
    }

    #[test]
    fn test_every_input_sample_accounted_for() {
        let fx = Fixture::default();
        let samples = concat(vec![
            plateau(0, 10, 100),
            series(50, 1, &[20, 0, 18]),
            series(53, 1, &[1500]),
            plateau(60, 10, 105),
        ]);
        let total = samples.len();
        let result = QoePipeline::new(&fx.config, 64).run(&input(samples, &fx)).unwrap().unwrap();

        let in_periods: usize = result.periods.iter().map(|p| p.len()).sum();
        assert_eq!(in_periods + result.glitches.len(), total);

        let all = samples_of(&result.periods);
        assert!(all.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn test_commit_plan() {
        let fx = Fixture::default();
        let samples = concat(vec![plateau(0, 10, 100), plateau(60, 10, 105)]);
        let mut result = QoePipeline::new(&fx.config, 64).run(&input(samples, &fx)).unwrap().unwrap();
        result.periods[0].samples[0].is_carried_over = true;

        let reference = at(-24 * 60);
        let plan = result.commit_plan(&Accumulator::default(), reference);
        assert_eq!(plan.points.len(), 19);
        assert_eq!(plan.accumulator.total_points, 19);
        assert_eq!(plan.accumulator.stable_bounds, Some((100, 105)));
        assert_eq!(plan.periods.len(), 1);
        assert_eq!(plan.active_days.into_iter().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_commit_plan_carries_glitches() {
        let fx = Fixture::default();
        let samples = concat(vec![plateau(0, 10, 100), series(50, 1, &[20, 18, 20]), plateau(60, 10, 105)]);
        let result = QoePipeline::new(&fx.config, 64).run(&input(samples, &fx)).unwrap().unwrap();

        let plan = result.commit_plan(&Accumulator::default(), at(0));
        assert_eq!(plan.glitches, result.glitches);
        assert_eq!(plan.points.len(), 20);
        assert!(plan.glitches.iter().all(|g| plan.points.iter().all(|p| p.key() != g.key())));
    }

    #[test]
    fn test_day_offset_rounds_down() {
        let reference = Utc.with_ymd_and_hms(2021, 5, 1, 0, 0, 0).unwrap();
        assert_eq!(day_offset(reference, reference), 0);
        assert_eq!(day_offset(reference, Utc.with_ymd_and_hms(2021, 5, 2, 23, 59, 0).unwrap()), 1);
        assert_eq!(day_offset(reference, Utc.with_ymd_and_hms(2021, 4, 30, 12, 0, 0).unwrap()), -1);
    }

    #[test]
    fn test_prepare_samples() {
        let config = GameConfig {
            latency_offset: Some(LatencyOffset {
                until: at(2),
                subtract: 7,
            }),
            blackouts: vec![TimeWindow {
                start: at(2),
                end: at(4),
            }],
            ..GameConfig::default()
        };
        // out of order on purpose
        let raw = vec![
            Sample::new("u", "g", "s", at(3), 50),
            Sample::new("u", "g", "s", at(1), 5),
            Sample::new("u", "g", "s", at(0), 40),
            Sample::new("u", "g", "s", at(4), 60),
        ];
        let mut carried = CarriedOverKeys::new();
        carried.insert((at(0), "s".to_string(), 10));

        let samples = prepare_samples(raw, &config, 10, &carried);
        let view: Vec<(u32, u64, bool)> = samples
            .iter()
            .map(|s| (s.latency, s.sequence_index, s.is_carried_over))
            .collect();
        assert_eq!(view, vec![(33, 10, true), (5, 11, false), (60, 12, false)]);
    }
}
