//! Spike Detector
//!
//! Marks points of unstable periods that peak above their stable neighbours.
//! A point is a spike when it peaks against every existing stable neighbour,
//! or when it peaks against one of them and is adjacent to an already marked
//! point (or to a spike period at the edge of its own period). Marks spread
//! until a full pass adds none. A period whose points are all marked becomes
//! a spike period and its points are emitted.

use tracing::debug;

use super::error::{EngineError, EngineResult, Stage};
use super::UnitContext;
use crate::models::{Period, Sample};

pub struct SpikeDetector<'c, 'a> {
    ctx: &'c UnitContext<'a>,
}

impl<'c, 'a> SpikeDetector<'c, 'a> {
    pub fn new(ctx: &'c UnitContext<'a>) -> Self {
        Self { ctx }
    }

    /// Mark spikes in place and return copies of the points of every period
    /// that became a spike period.
    pub fn detect(&self, periods: &mut [Period]) -> EngineResult<Vec<Sample>> {
        let ctx = self.ctx;
        let band = ctx.qoe_band();
        let mut spikes = Vec::new();

        // Every productive pass marks at least one point
        let total_points: usize = periods.iter().map(|p| p.len()).sum();
        let limit = ctx.max_iterations.max(total_points + 1);
        let mut passes = 0usize;

        loop {
            let mut marked_any = false;

            for idx in 0..periods.len() {
                if periods[idx].stable || periods[idx].is_spike {
                    continue;
                }

                let neighbours = ctx.neighbours(periods, idx);
                let previous_is_spike = if idx > 0 {
                    Some(periods[idx - 1].is_spike)
                } else {
                    ctx.previous_run_ends_in_spike()
                };
                let next_is_spike = periods.get(idx + 1).map(|p| p.is_spike);

                let period = &mut periods[idx];
                let last = period.samples.len().saturating_sub(1);

                for point_idx in 0..period.samples.len() {
                    if period.samples[point_idx].is_spike {
                        continue;
                    }
                    let latency = period.samples[point_idx].latency;

                    let mut peaks: Vec<bool> = Vec::with_capacity(2);
                    let mut propagation: Vec<bool> = Vec::with_capacity(2);

                    if let Some(previous) = neighbours.previous {
                        peaks.push(latency > previous.max && latency.abs_diff(previous.min) > band);
                    }
                    if point_idx == 0 {
                        let distant = neighbours
                            .previous
                            .map_or(true, |p| latency.abs_diff(p.min) > band);
                        if let Some(spike) = previous_is_spike {
                            propagation.push(spike && distant);
                        }
                    } else {
                        propagation.push(period.samples[point_idx - 1].is_spike);
                    }

                    if let Some(next) = neighbours.next {
                        peaks.push(latency > next.max && latency.abs_diff(next.min) > band);
                    }
                    if point_idx == last {
                        let distant = neighbours
                            .next
                            .map_or(true, |n| latency.abs_diff(n.min) > band);
                        if let Some(spike) = next_is_spike {
                            propagation.push(spike && distant);
                        }
                    } else {
                        propagation.push(period.samples[point_idx + 1].is_spike);
                    }

                    let all_peaks = peaks.iter().all(|&c| c);
                    let any_peak = peaks.iter().any(|&c| c);
                    let any_propagation = propagation.iter().any(|&c| c);

                    if all_peaks || (any_peak && any_propagation) {
                        period.samples[point_idx].is_spike = true;
                        marked_any = true;
                    }
                }

                if !period.samples.is_empty() && period.samples.iter().all(|s| s.is_spike) {
                    period.is_spike = true;
                    for sample in period.samples.iter_mut() {
                        sample.is_carried_over = false;
                        spikes.push(sample.clone());
                    }
                }
            }

            if !marked_any {
                break;
            }

            passes += 1;
            if passes >= limit {
                return Err(EngineError::NonConvergence {
                    stage: Stage::SpikeDetection,
                    limit,
                });
            }
        }

        debug!(
            user = %ctx.user_id,
            game = %ctx.game_id,
            passes,
            spikes = spikes.len(),
            "spike detection converged"
        );
        Ok(spikes)
    }
}
