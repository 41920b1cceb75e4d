//! Sequence Segmenter
//!
//! Bands a chronological sample list into runs of mutually close latencies.
//! Zero and overflow readings never open or extend a run; they are set aside
//! for the repair pass.

use crate::models::{digit_len, Sample};

/// Magnitude guard: two short (1-2 digit) values only merge when they have the
/// same number of digits. Irrelevant once either side has 3+ digits.
#[inline]
pub fn same_magnitude(reference: u32, latency: u32) -> bool {
    let (a, b) = (digit_len(reference), digit_len(latency));
    a == b || a > 2 || b > 2
}

/// Output of one segmentation pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Segmentation {
    /// Chronological runs, each non-empty
    pub groups: Vec<Vec<Sample>>,
    /// Samples with latency 0
    pub zeroes: Vec<Sample>,
    /// Samples at or above the latency ceiling
    pub over_threshold: Vec<Sample>,
}

impl Segmentation {
    pub fn take_diverted(&mut self) -> Vec<Sample> {
        let mut out = std::mem::take(&mut self.zeroes);
        out.append(&mut self.over_threshold);
        out
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SequenceSegmenter {
    qoe_band: u32,
}

impl SequenceSegmenter {
    pub fn new(qoe_band: u32) -> Self {
        Self { qoe_band }
    }

    /// Band rule: `latency` may join a run currently spanning `[min, max]`.
    #[inline]
    pub fn fits(&self, min: u32, max: u32, latency: u32) -> bool {
        latency.abs_diff(min) <= self.qoe_band
            && latency.abs_diff(max) <= self.qoe_band
            && same_magnitude(min, latency)
    }

    /// Single greedy walk over `samples`, which must already be chronological.
    pub fn segment(&self, samples: Vec<Sample>) -> Segmentation {
        let mut out = Segmentation::default();
        let mut current: Vec<Sample> = Vec::new();
        let (mut min, mut max) = (0u32, 0u32);

        for sample in samples {
            if sample.is_out_of_range() {
                match sample.latency {
                    0 => out.zeroes.push(sample),
                    _ => out.over_threshold.push(sample),
                }
                continue;
            }

            if !current.is_empty() && self.fits(min, max, sample.latency) {
                min = min.min(sample.latency);
                max = max.max(sample.latency);
                current.push(sample);
                continue;
            }

            if !current.is_empty() {
                out.groups.push(std::mem::take(&mut current));
            }
            min = sample.latency;
            max = sample.latency;
            current.push(sample);
        }

        if !current.is_empty() {
            out.groups.push(current);
        }

        out
    }
}
