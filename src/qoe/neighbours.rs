//! Stable neighbour lookup across the previous run's periods and this run's.

use crate::models::{Period, PeriodSummary};

/// Latency bounds of a stable period
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    pub min: u32,
    pub max: u32,
}

impl Bounds {
    /// Both bounds within `band` of `other`'s.
    #[inline]
    pub fn close_to(&self, other: &Bounds, band: u32) -> bool {
        self.min.abs_diff(other.min) <= band && self.max.abs_diff(other.max) <= band
    }

    /// `latency` inside `[min, max]`.
    #[inline]
    pub fn contains(&self, latency: u32) -> bool {
        self.min <= latency && latency <= self.max
    }
}

impl From<&Period> for Bounds {
    fn from(p: &Period) -> Self {
        Self { min: p.min, max: p.max }
    }
}

impl From<&PeriodSummary> for Bounds {
    fn from(p: &PeriodSummary) -> Self {
        Self { min: p.min, max: p.max }
    }
}

/// Nearest stable period on each side of a period
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StableNeighbours {
    pub previous: Option<Bounds>,
    pub next: Option<Bounds>,
}

impl StableNeighbours {
    /// Neighbours of `current[idx]`. Earlier runs' periods precede this run's,
    /// so they only ever provide a previous neighbour.
    pub fn locate(old: &[PeriodSummary], current: &[Period], idx: usize) -> Self {
        let previous = current[..idx]
            .iter()
            .rev()
            .find(|p| p.stable)
            .map(Bounds::from)
            .or_else(|| old.iter().rev().find(|p| p.stable).map(Bounds::from));

        let next = current
            .get(idx + 1..)
            .and_then(|rest| rest.iter().find(|p| p.stable))
            .map(Bounds::from);

        Self { previous, next }
    }

    /// Existing neighbours, previous first
    pub fn iter(&self) -> impl Iterator<Item = Bounds> {
        self.previous.into_iter().chain(self.next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Sample;
    use chrono::{TimeZone, Utc};

    fn period(seq_idx: u32, latency: u32, stable: bool) -> Period {
        let t = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::minutes(seq_idx as i64);
        Period::from_samples(seq_idx, "u", "g", vec![Sample::new("u", "g", "s", t, latency)])
            .unwrap()
            .with_stable(stable)
    }

    #[test]
    fn test_nearest_on_both_sides() {
        let current = vec![
            period(0, 40, true),
            period(1, 45, true),
            period(2, 90, false),
            period(3, 20, false),
            period(4, 60, true),
            period(5, 65, true),
        ];
        let n = StableNeighbours::locate(&[], &current, 3);
        assert_eq!(n.previous, Some(Bounds { min: 45, max: 45 }));
        assert_eq!(n.next, Some(Bounds { min: 60, max: 60 }));
        assert_eq!(n.iter().count(), 2);
    }

    #[test]
    fn test_last_period_can_be_next_neighbour() {
        let current = vec![period(0, 20, false), period(1, 60, true)];
        let n = StableNeighbours::locate(&[], &current, 0);
        assert_eq!(n.previous, None);
        assert_eq!(n.next, Some(Bounds { min: 60, max: 60 }));
    }

    #[test]
    fn test_falls_back_to_previous_run() {
        let old = vec![period(0, 70, true).summary(), period(1, 10, false).summary()];
        let current = vec![period(2, 20, false)];
        let n = StableNeighbours::locate(&old, &current, 0);
        assert_eq!(n.previous, Some(Bounds { min: 70, max: 70 }));
        assert_eq!(n.next, None);
        assert_eq!(n.iter().count(), 1);
    }

    #[test]
    fn test_bounds_helpers() {
        let a = Bounds { min: 40, max: 50 };
        assert!(a.close_to(&Bounds { min: 30, max: 60 }, 10));
        assert!(!a.close_to(&Bounds { min: 29, max: 60 }, 10));
        assert!(a.contains(40) && a.contains(50) && !a.contains(51));
    }
}
