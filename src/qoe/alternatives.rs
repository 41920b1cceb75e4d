//! Alternative Reconciler
//!
//! Gives confirmed spikes a second chance: a spike point whose alternative
//! reading falls inside a stable neighbour's range is rewritten, and the unit
//! is re-run from segmentation with the corrected samples.

use tracing::debug;

use super::neighbours::Bounds;
use super::segmenter::same_magnitude;
use super::UnitContext;
use crate::models::{digit_len, Period};

pub struct AlternativeReconciler<'c, 'a> {
    ctx: &'c UnitContext<'a>,
}

impl<'c, 'a> AlternativeReconciler<'c, 'a> {
    pub fn new(ctx: &'c UnitContext<'a>) -> Self {
        Self { ctx }
    }

    /// Rewrite spike points that an alternative reading places inside a
    /// stable neighbour. Returns whether the unit should be reprocessed.
    pub fn reconcile(&self, periods: &mut [Period]) -> bool {
        let ctx = self.ctx;
        let mut should_reprocess = false;

        for idx in 0..periods.len() {
            if !periods[idx].is_spike {
                continue;
            }

            let neighbours = ctx.neighbours(periods, idx);

            for sample in periods[idx].samples.iter_mut() {
                if sample.is_repaired() {
                    continue;
                }
                let Some(candidate) = ctx.alternatives.lookup(sample.timestamp, sample.latency) else {
                    continue;
                };

                let lands_in = |b: Bounds| b.contains(candidate) && same_magnitude(b.min, candidate);
                let inside = neighbours.previous.is_some_and(lands_in)
                    || neighbours.next.is_some_and(lands_in);

                // 2-digit -> 1-digit corrections are too easy to get wrong
                let narrowing = digit_len(sample.latency) == 2 && digit_len(candidate) == 1;

                if inside && !narrowing {
                    debug!(
                        user = %ctx.user_id,
                        game = %ctx.game_id,
                        at = %sample.timestamp,
                        from = sample.latency,
                        to = candidate,
                        "spike corrected by alternative reading"
                    );
                    sample.repair(candidate);
                    sample.was_spike = true;
                    should_reprocess = true;
                }
            }
        }

        should_reprocess
    }
}
