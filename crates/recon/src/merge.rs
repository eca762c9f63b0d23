//! Field-precedence reduction of a matched pair into one record.
//!
//! Every rule is pure. The merged record keeps A's origin and car id; each
//! populated field is attributed to the side that supplied it.

use chrono::{DateTime, Utc};

use crate::error::ReconError;
use crate::matcher::Matchable;
use crate::model::{
    ChargeRecord, Confidence, Contributor, DriveRecord, MergedRecord, NormalizedRecord,
    PositionRecord, Provenance, StateRecord,
};

type Picked<T> = (T, Option<Contributor>);

fn max_value(a: Option<f64>, b: Option<f64>) -> Picked<Option<f64>> {
    match (a, b) {
        (Some(x), Some(y)) if x.to_bits() == y.to_bits() => (Some(x), Some(Contributor::Both)),
        (Some(x), Some(y)) if x >= y => (Some(x), Some(Contributor::A)),
        (Some(_), Some(y)) => (Some(y), Some(Contributor::B)),
        (Some(x), None) => (Some(x), Some(Contributor::A)),
        (None, Some(y)) => (Some(y), Some(Contributor::B)),
        (None, None) => (None, None),
    }
}

fn earlier(a: DateTime<Utc>, b: DateTime<Utc>) -> Picked<DateTime<Utc>> {
    if a == b {
        (a, Some(Contributor::Both))
    } else if a < b {
        (a, Some(Contributor::A))
    } else {
        (b, Some(Contributor::B))
    }
}

fn later(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Picked<Option<DateTime<Utc>>> {
    match (a, b) {
        (Some(x), Some(y)) if x == y => (Some(x), Some(Contributor::Both)),
        (Some(x), Some(y)) if x > y => (Some(x), Some(Contributor::A)),
        (Some(_), Some(y)) => (Some(y), Some(Contributor::B)),
        (Some(x), None) => (Some(x), Some(Contributor::A)),
        (None, Some(y)) => (Some(y), Some(Contributor::B)),
        (None, None) => (None, None),
    }
}

fn prefer_a<T: Clone + PartialEq>(a: &Option<T>, b: &Option<T>) -> Picked<Option<T>> {
    match (a, b) {
        (Some(x), Some(y)) if x == y => (Some(x.clone()), Some(Contributor::Both)),
        (Some(x), _) => (Some(x.clone()), Some(Contributor::A)),
        (None, Some(y)) => (Some(y.clone()), Some(Contributor::B)),
        (None, None) => (None, None),
    }
}

type Coordinates = (Option<f64>, Option<f64>);

/// Latitude and longitude travel together: a complete pair wins over a
/// partial one, A over B.
fn coordinates(a: Coordinates, b: Coordinates) -> Picked<Coordinates> {
    let complete = |c: &Coordinates| c.0.is_some() && c.1.is_some();
    let any = |c: &Coordinates| c.0.is_some() || c.1.is_some();
    let same = |x: &Coordinates, y: &Coordinates| {
        x.0.map(f64::to_bits) == y.0.map(f64::to_bits) && x.1.map(f64::to_bits) == y.1.map(f64::to_bits)
    };

    let from_a = if complete(&a) {
        true
    } else if complete(&b) {
        false
    } else {
        any(&a) || !any(&b)
    };

    if !any(&a) && !any(&b) {
        return ((None, None), None);
    }
    if same(&a, &b) {
        return (a, Some(Contributor::Both));
    }
    if from_a {
        (a, Some(Contributor::A))
    } else {
        (b, Some(Contributor::B))
    }
}

fn car_id(a: &str, b: &str) -> Picked<String> {
    let contributor = if a == b { Contributor::Both } else { Contributor::A };
    (a.to_string(), Some(contributor))
}

/// Small helper so each per-kind merge reads as a list of field rules.
struct Fields {
    provenance: Provenance,
}

impl Fields {
    fn new() -> Self {
        Self {
            provenance: Provenance::default(),
        }
    }

    fn take<T>(&mut self, field: &'static str, picked: Picked<T>) -> T {
        self.provenance.record(field, picked.1);
        picked.0
    }

    fn pair(&mut self, picked: Picked<Coordinates>) -> Coordinates {
        self.provenance.record("latitude", picked.1.filter(|_| picked.0 .0.is_some()));
        self.provenance.record("longitude", picked.1.filter(|_| picked.0 .1.is_some()));
        picked.0
    }
}

pub fn merge_positions(a: &PositionRecord, b: &PositionRecord) -> (PositionRecord, Provenance) {
    let mut f = Fields::new();
    let (latitude, longitude) = f.pair(coordinates((a.latitude, a.longitude), (b.latitude, b.longitude)));
    let record = PositionRecord {
        origin: a.origin,
        car_id: f.take("car_id", car_id(&a.car_id, &b.car_id)),
        occurred_at: f.take("occurred_at", earlier(a.occurred_at, b.occurred_at)),
        latitude,
        longitude,
        speed_kmh: f.take("speed_kmh", max_value(a.speed_kmh, b.speed_kmh)),
        power_kw: f.take("power_kw", max_value(a.power_kw, b.power_kw)),
        odometer_km: f.take("odometer_km", max_value(a.odometer_km, b.odometer_km)),
        battery_level: f.take("battery_level", max_value(a.battery_level, b.battery_level)),
    };
    (record, f.provenance)
}

pub fn merge_drives(a: &DriveRecord, b: &DriveRecord) -> (DriveRecord, Provenance) {
    let mut f = Fields::new();
    let record = DriveRecord {
        origin: a.origin,
        car_id: f.take("car_id", car_id(&a.car_id, &b.car_id)),
        start_at: f.take("start_at", earlier(a.start_at, b.start_at)),
        end_at: f.take("end_at", later(a.end_at, b.end_at)),
        distance_km: f.take("distance_km", max_value(a.distance_km, b.distance_km)),
        speed_max_kmh: f.take("speed_max_kmh", max_value(a.speed_max_kmh, b.speed_max_kmh)),
        power_max_kw: f.take("power_max_kw", max_value(a.power_max_kw, b.power_max_kw)),
        start_battery_level: f.take(
            "start_battery_level",
            max_value(a.start_battery_level, b.start_battery_level),
        ),
        end_battery_level: f.take(
            "end_battery_level",
            max_value(a.end_battery_level, b.end_battery_level),
        ),
    };
    (record, f.provenance)
}

pub fn merge_charges(a: &ChargeRecord, b: &ChargeRecord) -> (ChargeRecord, Provenance) {
    let mut f = Fields::new();
    let (latitude, longitude) = f.pair(coordinates((a.latitude, a.longitude), (b.latitude, b.longitude)));
    let record = ChargeRecord {
        origin: a.origin,
        car_id: f.take("car_id", car_id(&a.car_id, &b.car_id)),
        start_at: f.take("start_at", earlier(a.start_at, b.start_at)),
        end_at: f.take("end_at", later(a.end_at, b.end_at)),
        charge_energy_added_kwh: f.take(
            "charge_energy_added_kwh",
            max_value(a.charge_energy_added_kwh, b.charge_energy_added_kwh),
        ),
        start_battery_level: f.take(
            "start_battery_level",
            max_value(a.start_battery_level, b.start_battery_level),
        ),
        end_battery_level: f.take(
            "end_battery_level",
            max_value(a.end_battery_level, b.end_battery_level),
        ),
        charger_power_kw: f.take("charger_power_kw", max_value(a.charger_power_kw, b.charger_power_kw)),
        // A present cost always beats an absent one; absent-absent stays absent.
        cost_total: f.take("cost_total", max_value(a.cost_total, b.cost_total)),
        fast_charger_brand: f.take(
            "fast_charger_brand",
            prefer_a(&a.fast_charger_brand, &b.fast_charger_brand),
        ),
        latitude,
        longitude,
    };
    (record, f.provenance)
}

pub fn merge_states(a: &StateRecord, b: &StateRecord) -> (StateRecord, Provenance) {
    let mut f = Fields::new();
    let record = StateRecord {
        origin: a.origin,
        car_id: f.take("car_id", car_id(&a.car_id, &b.car_id)),
        start_at: f.take("start_at", earlier(a.start_at, b.start_at)),
        end_at: f.take("end_at", later(a.end_at, b.end_at)),
        state: f.take("state", prefer_a(&a.state, &b.state)),
        climate_state: f.take("climate_state", prefer_a(&a.climate_state, &b.climate_state)),
        charge_state: f.take("charge_state", prefer_a(&a.charge_state, &b.charge_state)),
        battery_level: f.take("battery_level", max_value(a.battery_level, b.battery_level)),
        ideal_battery_range_km: f.take(
            "ideal_battery_range_km",
            max_value(a.ideal_battery_range_km, b.ideal_battery_range_km),
        ),
    };
    (record, f.provenance)
}

/// Merge a matched pair. Both records must be the same kind.
pub fn merge_with(
    a: &NormalizedRecord,
    b: &NormalizedRecord,
    confidence: Confidence,
) -> Result<MergedRecord, ReconError> {
    let (record, provenance) = match (a, b) {
        (NormalizedRecord::Position(x), NormalizedRecord::Position(y)) => {
            let (r, p) = merge_positions(x, y);
            (NormalizedRecord::Position(r), p)
        }
        (NormalizedRecord::Drive(x), NormalizedRecord::Drive(y)) => {
            let (r, p) = merge_drives(x, y);
            (NormalizedRecord::Drive(r), p)
        }
        (NormalizedRecord::Charge(x), NormalizedRecord::Charge(y)) => {
            let (r, p) = merge_charges(x, y);
            (NormalizedRecord::Charge(r), p)
        }
        (NormalizedRecord::State(x), NormalizedRecord::State(y)) => {
            let (r, p) = merge_states(x, y);
            (NormalizedRecord::State(r), p)
        }
        _ => {
            return Err(ReconError::KindMismatch {
                expected: a.kind(),
                found: b.kind(),
            })
        }
    };
    Ok(MergedRecord {
        record,
        confidence,
        provenance,
    })
}

/// Merge two records outside of a match run, grading confidence by the
/// same key-field comparison the matcher uses.
pub fn merge(a: &NormalizedRecord, b: &NormalizedRecord) -> Result<MergedRecord, ReconError> {
    let confidence = if a.is_identical(b) {
        Confidence::Identical
    } else {
        Confidence::WithinTolerance
    };
    merge_with(a, b, confidence)
}
