//! Split two normalized batches into independent units of work.

use std::collections::BTreeMap;

use crate::config::PartitionUnit;
use crate::error::ReconError;
use crate::model::{NormalizedBatch, NormalizedRecord, PartitionKey, RecordKind};

/// One side's normalized records, or why they could not be produced.
pub type SourceBatch = Result<NormalizedBatch, ReconError>;

/// Records of one kind for one key, from both sources.
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub key: PartitionKey,
    pub a: Result<Vec<NormalizedRecord>, ReconError>,
    pub b: Result<Vec<NormalizedRecord>, ReconError>,
}

impl Partition {
    pub fn is_available(&self) -> bool {
        self.a.is_ok() && self.b.is_ok()
    }

    /// Combined reason when either side is missing.
    pub fn unavailable_reason(&self) -> Option<String> {
        match (&self.a, &self.b) {
            (Ok(_), Ok(_)) => None,
            (Err(e), Ok(_)) | (Ok(_), Err(e)) => Some(e.to_string()),
            (Err(a), Err(b)) => Some(format!("{a}; {b}")),
        }
    }
}

/// Partitions in key order plus the normalization drops of both sides,
/// which have no key of their own.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Partitions {
    pub parts: Vec<Partition>,
    pub dropped: usize,
}

impl From<Vec<Partition>> for Partitions {
    fn from(parts: Vec<Partition>) -> Self {
        Self { parts, dropped: 0 }
    }
}

pub fn key_for(record: &NormalizedRecord, unit: PartitionUnit) -> PartitionKey {
    PartitionKey {
        car_id: Some(record.car_id().to_string()),
        day: match unit {
            PartitionUnit::Car => None,
            PartitionUnit::CarDay => Some(record.time_key().date_naive()),
        },
    }
}

fn group(
    records: Vec<NormalizedRecord>,
    unit: PartitionUnit,
) -> BTreeMap<PartitionKey, Vec<NormalizedRecord>> {
    let mut groups: BTreeMap<PartitionKey, Vec<NormalizedRecord>> = BTreeMap::new();
    for record in records {
        groups.entry(key_for(&record, unit)).or_default().push(record);
    }
    groups
}

const WHOLE_KIND: PartitionKey = PartitionKey {
    car_id: None,
    day: None,
};

/// Every partition built from the available side carries the other side's
/// failure, so the run can report exactly which units were skipped.
fn one_sided(
    available: NormalizedBatch,
    missing: ReconError,
    unit: PartitionUnit,
    available_is_a: bool,
) -> Vec<Partition> {
    let build = |key: PartitionKey, records: Vec<NormalizedRecord>| {
        if available_is_a {
            Partition { key, a: Ok(records), b: Err(missing.clone()) }
        } else {
            Partition { key, a: Err(missing.clone()), b: Ok(records) }
        }
    };

    let groups = group(available.records, unit);
    if groups.is_empty() {
        return vec![build(WHOLE_KIND, Vec::new())];
    }
    groups.into_iter().map(|(key, records)| build(key, records)).collect()
}

/// Group both sides by `(car, day?)`. Records near midnight fall into their
/// own day's partition and are not matched across the boundary.
pub fn partition(kind: RecordKind, a: SourceBatch, b: SourceBatch, unit: PartitionUnit) -> Partitions {
    let dropped = a.as_ref().map_or(0, |batch| batch.dropped) + b.as_ref().map_or(0, |batch| batch.dropped);

    let parts = match (a, b) {
        (Ok(a), Ok(b)) => {
            let mut joined: BTreeMap<PartitionKey, (Vec<NormalizedRecord>, Vec<NormalizedRecord>)> =
                BTreeMap::new();
            for (key, records) in group(a.records, unit) {
                joined.entry(key).or_default().0 = records;
            }
            for (key, records) in group(b.records, unit) {
                joined.entry(key).or_default().1 = records;
            }
            joined
                .into_iter()
                .map(|(key, (a, b))| Partition { key, a: Ok(a), b: Ok(b) })
                .collect()
        }
        (Ok(a), Err(e)) => one_sided(a, e, unit, true),
        (Err(e), Ok(b)) => one_sided(b, e, unit, false),
        (Err(ea), Err(eb)) => vec![Partition {
            key: WHOLE_KIND,
            a: Err(ea),
            b: Err(eb),
        }],
    };

    log::debug!("{kind}: {} partitions by {unit:?}", parts.len());
    Partitions { parts, dropped }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Origin, PositionRecord};
    use chrono::{NaiveDate, TimeZone, Utc};

    fn pos(origin: Origin, car: &str, day: u32, hour: u32) -> NormalizedRecord {
        NormalizedRecord::Position(PositionRecord {
            origin,
            car_id: car.into(),
            occurred_at: Utc.with_ymd_and_hms(2024, 5, day, hour, 0, 0).unwrap(),
            latitude: None,
            longitude: None,
            speed_kmh: None,
            power_kw: None,
            odometer_km: None,
            battery_level: None,
        })
    }

    fn unavailable(origin: Origin) -> ReconError {
        ReconError::source_unavailable(origin, RecordKind::Position, "connection refused")
    }

    #[test]
    fn groups_by_car_and_day_in_key_order() {
        let a = NormalizedBatch::new(vec![
            pos(Origin::A, "2", 1, 10),
            pos(Origin::A, "1", 2, 10),
            pos(Origin::A, "1", 1, 23),
        ]);
        let b = NormalizedBatch::new(vec![pos(Origin::B, "1", 1, 22), pos(Origin::B, "3", 1, 8)]);
        let out = partition(RecordKind::Position, Ok(a), Ok(b), PartitionUnit::CarDay);

        let keys: Vec<String> = out.parts.iter().map(|p| p.key.to_string()).collect();
        assert_eq!(
            keys,
            vec!["car 1 on 2024-05-01", "car 1 on 2024-05-02", "car 2 on 2024-05-01", "car 3 on 2024-05-01"]
        );
        let first = &out.parts[0];
        assert_eq!(first.a.as_ref().map(Vec::len), Ok(1));
        assert_eq!(first.b.as_ref().map(Vec::len), Ok(1));
        assert_eq!(out.parts[3].a.as_ref().map(Vec::len), Ok(0));
    }

    #[test]
    fn car_unit_ignores_day() {
        let a = NormalizedBatch::new(vec![pos(Origin::A, "1", 1, 10), pos(Origin::A, "1", 2, 10)]);
        let out = partition(RecordKind::Position, Ok(a), Ok(NormalizedBatch::default()), PartitionUnit::Car);
        assert_eq!(out.parts.len(), 1);
        assert_eq!(out.parts[0].key.day, None);
        assert_eq!(out.parts[0].a.as_ref().map(Vec::len), Ok(2));
    }

    #[test]
    fn missing_side_marks_every_partition() {
        let a = NormalizedBatch::new(vec![pos(Origin::A, "1", 1, 10), pos(Origin::A, "2", 1, 10)]);
        let out = partition(RecordKind::Position, Ok(a), Err(unavailable(Origin::B)), PartitionUnit::CarDay);
        assert_eq!(out.parts.len(), 2);
        assert!(out.parts.iter().all(|p| !p.is_available()));
        assert!(out.parts[0]
            .unavailable_reason()
            .is_some_and(|r| r.contains("source B unavailable")));
    }

    #[test]
    fn missing_side_with_empty_other_still_reports() {
        let out = partition(
            RecordKind::Position,
            Err(unavailable(Origin::A)),
            Ok(NormalizedBatch::default()),
            PartitionUnit::CarDay,
        );
        assert_eq!(out.parts.len(), 1);
        assert_eq!(out.parts[0].key, WHOLE_KIND);
        assert!(out.parts[0].a.is_err());
    }

    #[test]
    fn both_sides_missing() {
        let out = partition(
            RecordKind::Position,
            Err(unavailable(Origin::A)),
            Err(unavailable(Origin::B)),
            PartitionUnit::CarDay,
        );
        assert_eq!(out.parts.len(), 1);
        let reason = out.parts[0].unavailable_reason().unwrap();
        assert!(reason.contains("source A") && reason.contains("source B"));
    }

    #[test]
    fn carries_dropped_counts() {
        let mut a = NormalizedBatch::new(vec![pos(Origin::A, "1", 1, 10)]);
        a.dropped = 2;
        let mut b = NormalizedBatch::default();
        b.dropped = 1;
        let out = partition(RecordKind::Position, Ok(a), Ok(b), PartitionUnit::CarDay);
        assert_eq!(out.dropped, 3);
    }

    #[test]
    fn day_comes_from_utc_time_key() {
        let record = pos(Origin::A, "1", 1, 23);
        let key = key_for(&record, PartitionUnit::CarDay);
        assert_eq!(key.day, NaiveDate::from_ymd_opt(2024, 5, 1));
    }
}
