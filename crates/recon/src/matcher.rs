//! Bounded fuzzy join between two sources' records.
//!
//! Both sides are stably sorted by time key and walked with a two-pointer
//! window, so a pass costs O(|A| + |B| + candidates) instead of a full cross
//! product. Assignment is greedy and 1:1: identical pairs are claimed first,
//! then each remaining A record takes the first unclaimed B record (in B's
//! time order, ties in B's input order) that passes the kind's tolerance.
//! Results therefore depend on input order for equal timestamps.

use chrono::{DateTime, Duration, Utc};

use crate::config::ToleranceConfig;
use crate::error::ReconError;
use crate::geo;
use crate::model::{
    ChargeRecord, Confidence, DriveRecord, MatchDecision, NormalizedRecord, PositionRecord,
    RecordKind, StateRecord,
};

/// Per-kind comparison rules used by the windowed join.
pub trait Matchable {
    fn time_key(&self) -> DateTime<Utc>;
    fn car_id(&self) -> &str;
    /// Every key field bit-for-bit equal.
    fn is_identical(&self, other: &Self) -> bool;
    /// Secondary predicate, evaluated only inside the time window.
    fn within_tolerance(&self, other: &Self, tolerance: &ToleranceConfig) -> bool;
}

fn same_f64(a: Option<f64>, b: Option<f64>) -> bool {
    match (a, b) {
        (Some(x), Some(y)) => x.to_bits() == y.to_bits(),
        (None, None) => true,
        _ => false,
    }
}

impl Matchable for PositionRecord {
    fn time_key(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    fn car_id(&self) -> &str {
        &self.car_id
    }

    fn is_identical(&self, other: &Self) -> bool {
        self.car_id == other.car_id
            && self.occurred_at == other.occurred_at
            && same_f64(self.latitude, other.latitude)
            && same_f64(self.longitude, other.longitude)
    }

    fn within_tolerance(&self, other: &Self, tolerance: &ToleranceConfig) -> bool {
        geo::within_meters(
            self.latitude,
            self.longitude,
            other.latitude,
            other.longitude,
            tolerance.position_distance_threshold_meters,
        )
    }
}

impl Matchable for DriveRecord {
    fn time_key(&self) -> DateTime<Utc> {
        self.start_at
    }

    fn car_id(&self) -> &str {
        &self.car_id
    }

    fn is_identical(&self, other: &Self) -> bool {
        self.car_id == other.car_id
            && self.start_at == other.start_at
            && self.end_at == other.end_at
            && same_f64(self.distance_km, other.distance_km)
    }

    fn within_tolerance(&self, other: &Self, tolerance: &ToleranceConfig) -> bool {
        match (self.distance_km, other.distance_km) {
            (Some(x), Some(y)) => (x - y).abs() < tolerance.drive_distance_threshold_km,
            // Only checked when both sides report a distance.
            _ => true,
        }
    }
}

impl Matchable for ChargeRecord {
    fn time_key(&self) -> DateTime<Utc> {
        self.start_at
    }

    fn car_id(&self) -> &str {
        &self.car_id
    }

    fn is_identical(&self, other: &Self) -> bool {
        self.car_id == other.car_id
            && self.start_at == other.start_at
            && self.end_at == other.end_at
            && same_f64(self.charge_energy_added_kwh, other.charge_energy_added_kwh)
    }

    fn within_tolerance(&self, _other: &Self, _tolerance: &ToleranceConfig) -> bool {
        true
    }
}

impl Matchable for StateRecord {
    fn time_key(&self) -> DateTime<Utc> {
        self.start_at
    }

    fn car_id(&self) -> &str {
        &self.car_id
    }

    fn is_identical(&self, other: &Self) -> bool {
        self.car_id == other.car_id
            && self.start_at == other.start_at
            && self.end_at == other.end_at
            && self.state == other.state
    }

    fn within_tolerance(&self, other: &Self, _tolerance: &ToleranceConfig) -> bool {
        match (&self.state, &other.state) {
            (Some(x), Some(y)) => x.eq_ignore_ascii_case(y),
            _ => true,
        }
    }
}

impl Matchable for NormalizedRecord {
    fn time_key(&self) -> DateTime<Utc> {
        NormalizedRecord::time_key(self)
    }

    fn car_id(&self) -> &str {
        NormalizedRecord::car_id(self)
    }

    fn is_identical(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Position(a), Self::Position(b)) => a.is_identical(b),
            (Self::Drive(a), Self::Drive(b)) => a.is_identical(b),
            (Self::Charge(a), Self::Charge(b)) => a.is_identical(b),
            (Self::State(a), Self::State(b)) => a.is_identical(b),
            _ => false,
        }
    }

    fn within_tolerance(&self, other: &Self, tolerance: &ToleranceConfig) -> bool {
        match (self, other) {
            (Self::Position(a), Self::Position(b)) => a.within_tolerance(b, tolerance),
            (Self::Drive(a), Self::Drive(b)) => a.within_tolerance(b, tolerance),
            (Self::Charge(a), Self::Charge(b)) => a.within_tolerance(b, tolerance),
            (Self::State(a), Self::State(b)) => a.within_tolerance(b, tolerance),
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Index-level join
// ---------------------------------------------------------------------------

/// Join result as indices into the caller's slices.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Assignment {
    /// `(a_index, b_index, confidence)` in A time order.
    pub pairs: Vec<(usize, usize, Confidence)>,
    /// Unmatched A indices in A time order.
    pub unmatched_a: Vec<usize>,
    /// Unmatched B indices in B time order.
    pub unmatched_b: Vec<usize>,
}

fn time_order<T: Matchable>(records: &[T]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..records.len()).collect();
    // Stable: equal timestamps keep input order.
    order.sort_by_key(|&i| records[i].time_key());
    order
}

struct Join<'a, T> {
    a: &'a [T],
    b: &'a [T],
    order_a: Vec<usize>,
    order_b: Vec<usize>,
    window: Duration,
    matched_a: Vec<Option<(usize, Confidence)>>,
    used_b: Vec<bool>,
}

impl<'a, T: Matchable> Join<'a, T> {
    fn new(a: &'a [T], b: &'a [T], window: Duration) -> Self {
        Self {
            a,
            b,
            order_a: time_order(a),
            order_b: time_order(b),
            window,
            matched_a: vec![None; a.len()],
            used_b: vec![false; b.len()],
        }
    }

    /// One greedy pass: each unmatched A claims the first free B in its
    /// window that satisfies `accept`.
    fn pass(&mut self, confidence: Confidence, accept: impl Fn(&T, &T) -> bool) {
        let mut lo = 0;
        for &ai in &self.order_a {
            if self.matched_a[ai].is_some() {
                continue;
            }
            let record = &self.a[ai];
            let t = record.time_key();
            let lower = t.checked_sub_signed(self.window).unwrap_or(DateTime::<Utc>::MIN_UTC);
            let upper = t.checked_add_signed(self.window).unwrap_or(DateTime::<Utc>::MAX_UTC);

            // A is visited in time order, so the window's lower edge only moves forward.
            while lo < self.order_b.len() {
                let bi = self.order_b[lo];
                if self.used_b[bi] || self.b[bi].time_key() < lower {
                    lo += 1;
                } else {
                    break;
                }
            }

            for &bi in &self.order_b[lo..] {
                let candidate = &self.b[bi];
                if candidate.time_key() > upper {
                    break;
                }
                if self.used_b[bi] || candidate.car_id() != record.car_id() {
                    continue;
                }
                if accept(record, candidate) {
                    self.used_b[bi] = true;
                    self.matched_a[ai] = Some((bi, confidence));
                    break;
                }
            }
        }
    }

    fn finish(self) -> Assignment {
        let mut out = Assignment::default();
        for &ai in &self.order_a {
            match self.matched_a[ai] {
                Some((bi, confidence)) => out.pairs.push((ai, bi, confidence)),
                None => out.unmatched_a.push(ai),
            }
        }
        out.unmatched_b = self
            .order_b
            .iter()
            .copied()
            .filter(|&bi| !self.used_b[bi])
            .collect();
        out
    }
}

/// Windowed 1:1 join of `a` against `b`.
pub fn assign<T: Matchable>(
    a: &[T],
    b: &[T],
    window: Duration,
    tolerance: &ToleranceConfig,
) -> Assignment {
    let mut join = Join::new(a, b, window);
    join.pass(Confidence::Identical, |x, y| x.is_identical(y));
    join.pass(Confidence::WithinTolerance, |x, y| x.within_tolerance(y, tolerance));
    join.finish()
}

fn check_kind(records: &[NormalizedRecord], kind: RecordKind) -> Result<(), ReconError> {
    match records.iter().find(|r| r.kind() != kind) {
        Some(r) => Err(ReconError::KindMismatch {
            expected: kind,
            found: r.kind(),
        }),
        None => Ok(()),
    }
}

/// Match two collections of one kind into decisions.
///
/// Decisions come out as every A record in time order (matched or not),
/// followed by the unmatched B records in time order.
pub fn match_records(
    records_a: &[NormalizedRecord],
    records_b: &[NormalizedRecord],
    kind: RecordKind,
    tolerance: &ToleranceConfig,
) -> Result<Vec<MatchDecision>, ReconError> {
    check_kind(records_a, kind)?;
    check_kind(records_b, kind)?;

    let assignment = assign(records_a, records_b, tolerance.time_window(kind), tolerance);

    let mut partner: Vec<Option<(usize, Confidence)>> = vec![None; records_a.len()];
    for &(ai, bi, confidence) in &assignment.pairs {
        partner[ai] = Some((bi, confidence));
    }

    let mut decisions = Vec::with_capacity(records_a.len() + assignment.unmatched_b.len());
    for ai in time_order(records_a) {
        let a = records_a[ai].clone();
        decisions.push(match partner[ai] {
            Some((bi, confidence)) => MatchDecision::MatchedPair {
                a,
                b: records_b[bi].clone(),
                confidence,
            },
            None => MatchDecision::UnmatchedA(a),
        });
    }
    for &bi in &assignment.unmatched_b {
        decisions.push(MatchDecision::UnmatchedB(records_b[bi].clone()));
    }

    Ok(decisions)
}
