use std::iter::Sum;
use std::ops::{Add, AddAssign};

use serde::Serialize;

use crate::model::{Confidence, MatchDecision};

/// Per-kind decision counters for one run.
///
/// Built per partition and summed, so totals do not depend on the order
/// partitions finish in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    /// Matched pairs whose key fields were bit-identical.
    pub identical: usize,
    /// Matched pairs accepted within tolerance and merged.
    pub merged: usize,
    /// Source-A records with no counterpart in B (new data).
    pub added: usize,
    /// Source-B records left unmatched plus rows dropped by normalization.
    pub skipped: usize,
    /// Share of `skipped` that came from normalization drops.
    pub dropped: usize,
}

impl RunStats {
    pub fn record(&mut self, decision: &MatchDecision) {
        match decision {
            MatchDecision::MatchedPair {
                confidence: Confidence::Identical,
                ..
            } => self.identical += 1,
            MatchDecision::MatchedPair {
                confidence: Confidence::WithinTolerance,
                ..
            } => self.merged += 1,
            MatchDecision::UnmatchedA(_) => self.added += 1,
            MatchDecision::UnmatchedB(_) => self.skipped += 1,
        }
    }

    pub fn record_dropped(&mut self, rows: usize) {
        self.dropped += rows;
        self.skipped += rows;
    }

    pub fn from_decisions<'a>(decisions: impl IntoIterator<Item = &'a MatchDecision>) -> Self {
        let mut stats = Self::default();
        for d in decisions {
            stats.record(d);
        }
        stats
    }

    /// Every A record classified exactly once.
    pub fn a_records(&self) -> usize {
        self.identical + self.merged + self.added
    }

    pub fn matched(&self) -> usize {
        self.identical + self.merged
    }
}

impl Add for RunStats {
    type Output = RunStats;

    fn add(self, rhs: RunStats) -> RunStats {
        RunStats {
            identical: self.identical + rhs.identical,
            merged: self.merged + rhs.merged,
            added: self.added + rhs.added,
            skipped: self.skipped + rhs.skipped,
            dropped: self.dropped + rhs.dropped,
        }
    }
}

impl AddAssign for RunStats {
    fn add_assign(&mut self, rhs: RunStats) {
        *self = *self + rhs;
    }
}

impl Sum for RunStats {
    fn sum<I: Iterator<Item = RunStats>>(iter: I) -> RunStats {
        iter.fold(RunStats::default(), Add::add)
    }
}
