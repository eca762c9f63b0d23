use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stats::RunStats;

// ---------------------------------------------------------------------------
// Sources + kinds
// ---------------------------------------------------------------------------

/// Which telemetry source produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    A,
    B,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::B => write!(f, "B"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecordKind {
    #[serde(rename = "position")]
    Position,
    #[serde(rename = "drive")]
    Drive,
    #[serde(rename = "charging")]
    Charge,
    #[serde(rename = "state")]
    State,
}

impl RecordKind {
    /// Sync order used when several kinds are enabled.
    pub const ALL: [RecordKind; 4] = [Self::Position, Self::Drive, Self::Charge, Self::State];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Position => "position",
            Self::Drive => "drive",
            Self::Charge => "charging",
            Self::State => "state",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Normalized records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionRecord {
    pub origin: Origin,
    pub car_id: String,
    pub occurred_at: DateTime<Utc>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub speed_kmh: Option<f64>,
    pub power_kw: Option<f64>,
    pub odometer_km: Option<f64>,
    pub battery_level: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriveRecord {
    pub origin: Origin,
    pub car_id: String,
    pub start_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
    pub distance_km: Option<f64>,
    pub speed_max_kmh: Option<f64>,
    pub power_max_kw: Option<f64>,
    pub start_battery_level: Option<f64>,
    pub end_battery_level: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChargeRecord {
    pub origin: Origin,
    pub car_id: String,
    pub start_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
    pub charge_energy_added_kwh: Option<f64>,
    pub start_battery_level: Option<f64>,
    pub end_battery_level: Option<f64>,
    pub charger_power_kw: Option<f64>,
    pub cost_total: Option<f64>,
    pub fast_charger_brand: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateRecord {
    pub origin: Origin,
    pub car_id: String,
    pub start_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
    pub state: Option<String>,
    pub climate_state: Option<String>,
    pub charge_state: Option<String>,
    pub battery_level: Option<f64>,
    pub ideal_battery_range_km: Option<f64>,
}

/// A source row after normalization. Matching code never branches on origin.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind")]
pub enum NormalizedRecord {
    #[serde(rename = "position")]
    Position(PositionRecord),
    #[serde(rename = "drive")]
    Drive(DriveRecord),
    #[serde(rename = "charging")]
    Charge(ChargeRecord),
    #[serde(rename = "state")]
    State(StateRecord),
}

impl NormalizedRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Position(_) => RecordKind::Position,
            Self::Drive(_) => RecordKind::Drive,
            Self::Charge(_) => RecordKind::Charge,
            Self::State(_) => RecordKind::State,
        }
    }

    pub fn origin(&self) -> Origin {
        match self {
            Self::Position(r) => r.origin,
            Self::Drive(r) => r.origin,
            Self::Charge(r) => r.origin,
            Self::State(r) => r.origin,
        }
    }

    pub fn car_id(&self) -> &str {
        match self {
            Self::Position(r) => &r.car_id,
            Self::Drive(r) => &r.car_id,
            Self::Charge(r) => &r.car_id,
            Self::State(r) => &r.car_id,
        }
    }

    /// The timestamp matching windows are measured on: `occurred_at` for
    /// positions, `start_at` for interval kinds.
    pub fn time_key(&self) -> DateTime<Utc> {
        match self {
            Self::Position(r) => r.occurred_at,
            Self::Drive(r) => r.start_at,
            Self::Charge(r) => r.start_at,
            Self::State(r) => r.start_at,
        }
    }
}

/// Normalizer output for one source and kind.
#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub records: Vec<NormalizedRecord>,
    /// Rows dropped for a missing car id or required timestamp.
    pub dropped: usize,
    /// Fields that failed coercion and were set to unknown.
    pub unknown_fields: usize,
}

impl NormalizedBatch {
    pub fn new(records: Vec<NormalizedRecord>) -> Self {
        Self {
            records,
            dropped: 0,
            unknown_fields: 0,
        }
    }

    /// Keep the earliest `limit` records by time key. `0` means unlimited.
    pub fn truncate_to(&mut self, limit: usize) {
        if limit == 0 || self.records.len() <= limit {
            return;
        }
        self.records.sort_by_key(|r| r.time_key());
        self.records.truncate(limit);
    }
}

// ---------------------------------------------------------------------------
// Match decisions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// Every compared key field is bit-for-bit equal.
    Identical,
    /// Passed the kind's tolerance predicate but differs in at least one field.
    WithinTolerance,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchDecision {
    MatchedPair {
        a: NormalizedRecord,
        b: NormalizedRecord,
        confidence: Confidence,
    },
    UnmatchedA(NormalizedRecord),
    UnmatchedB(NormalizedRecord),
}

// ---------------------------------------------------------------------------
// Merge output
// ---------------------------------------------------------------------------

/// Which side supplied a merged field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Contributor {
    A,
    B,
    /// Both sides carried the same value.
    Both,
}

/// Field name -> contributor, for every populated field of a merged record.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Provenance(BTreeMap<&'static str, Contributor>);

impl Provenance {
    pub fn record(&mut self, field: &'static str, contributor: Option<Contributor>) {
        if let Some(c) = contributor {
            self.0.insert(field, c);
        }
    }

    pub fn get(&self, field: &str) -> Option<Contributor> {
        self.0.get(field).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedRecord {
    pub record: NormalizedRecord,
    pub confidence: Confidence,
    pub provenance: Provenance,
}

impl MergedRecord {
    pub fn kind(&self) -> RecordKind {
        self.record.kind()
    }
}

// ---------------------------------------------------------------------------
// Run output
// ---------------------------------------------------------------------------

/// Unit of work identity. `None` parts widen the partition (whole car, whole kind).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PartitionKey {
    pub car_id: Option<String>,
    pub day: Option<chrono::NaiveDate>,
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.car_id, &self.day) {
            (Some(car), Some(day)) => write!(f, "car {car} on {day}"),
            (Some(car), None) => write!(f, "car {car}"),
            (None, Some(day)) => write!(f, "all cars on {day}"),
            (None, None) => write!(f, "all records"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedPartition {
    pub key: PartitionKey,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutput {
    pub kind: RecordKind,
    pub dry_run: bool,
    pub stats: RunStats,
    pub merged: Vec<MergedRecord>,
    pub unmatched_a: Vec<NormalizedRecord>,
    pub unmatched_b: Vec<NormalizedRecord>,
    pub skipped_partitions: Vec<SkippedPartition>,
}

/// Result of syncing every enabled kind.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub meta: SyncMeta,
    pub runs: Vec<RunOutput>,
}

impl SyncReport {
    pub fn run(&self, kind: RecordKind) -> Option<&RunOutput> {
        self.runs.iter().find(|r| r.kind == kind)
    }

    pub fn skipped_partition_count(&self) -> usize {
        self.runs.iter().map(|r| r.skipped_partitions.len()).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncMeta {
    pub config_name: String,
    pub source_a: String,
    pub source_b: String,
    pub dry_run: bool,
    pub engine_version: String,
    pub run_at: String,
}
