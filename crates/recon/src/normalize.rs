//! Raw source rows -> `NormalizedRecord`.
//!
//! Each source dialect maps its own column names onto the canonical fields of
//! a kind. Coercion is defensive: a bad optional field becomes unknown and the
//! row survives; a missing car id or required timestamp drops the row.

use std::collections::HashMap;

use chrono::{DateTime, FixedOffset, NaiveDateTime, Offset, TimeZone, Utc};

use crate::config::{SourceConfig, SourceSchema};
use crate::error::ReconError;
use crate::model::{
    ChargeRecord, DriveRecord, NormalizedBatch, NormalizedRecord, Origin, PositionRecord,
    RecordKind, StateRecord,
};

/// A decoded source row: column name -> raw text.
pub type RawRow = HashMap<String, String>;

// ---------------------------------------------------------------------------
// Canonical fields + dialect column tables
// ---------------------------------------------------------------------------

const POSITION_FIELDS: &[&str] = &[
    "car_id", "occurred_at", "latitude", "longitude", "speed", "power", "odometer",
    "battery_level",
];

const DRIVE_FIELDS: &[&str] = &[
    "car_id", "start_at", "end_at", "distance", "speed_max", "power_max",
    "start_battery_level", "end_battery_level",
];

const CHARGE_FIELDS: &[&str] = &[
    "car_id", "start_at", "end_at", "charge_energy_added", "start_battery_level",
    "end_battery_level", "charger_power", "cost_total", "fast_charger_brand", "latitude",
    "longitude",
];

const STATE_FIELDS: &[&str] = &[
    "car_id", "start_at", "end_at", "state", "climate_state", "charge_state", "battery_level",
    "ideal_battery_range_km",
];

/// Canonical field names a kind's column overrides may target.
pub fn canonical_fields(kind: RecordKind) -> &'static [&'static str] {
    match kind {
        RecordKind::Position => POSITION_FIELDS,
        RecordKind::Drive => DRIVE_FIELDS,
        RecordKind::Charge => CHARGE_FIELDS,
        RecordKind::State => STATE_FIELDS,
    }
}

// Columns are listed in the same order as the canonical field tables above.
const TESLALOGGER_POSITION: &[&str] = &[
    "CarID", "Datum", "lat", "lng", "speed", "power", "odometer", "battery_level",
];
const TESLALOGGER_DRIVE: &[&str] = &[
    "CarID", "StartDate", "EndDate", "distance", "speed_max", "power_max",
    "start_battery_level", "end_battery_level",
];
const TESLALOGGER_CHARGE: &[&str] = &[
    "CarID", "Datum", "EndDate", "charge_energy_added", "battery_level", "end_battery_level",
    "charger_power", "cost_total", "fast_charger_brand", "lat", "lng",
];
const TESLALOGGER_STATE: &[&str] = &[
    "CarID", "StartDate", "EndDate", "state", "climate_state", "charge_state", "battery_level",
    "ideal_battery_range_km",
];

const TESLAMATE_POSITION: &[&str] = &[
    "car_id", "date", "latitude", "longitude", "speed", "power", "odometer", "battery_level",
];
const TESLAMATE_DRIVE: &[&str] = &[
    "car_id", "start_date", "end_date", "distance", "speed_max", "power_max",
    "start_battery_level", "end_battery_level",
];
const TESLAMATE_CHARGE: &[&str] = &[
    "car_id", "date", "end_date", "charge_energy_added", "start_battery_level",
    "end_battery_level", "charger_power", "cost", "fast_charger_brand", "latitude", "longitude",
];
const TESLAMATE_STATE: &[&str] = &[
    "car_id", "start_date", "end_date", "state", "climate_state", "charge_state",
    "battery_level", "ideal_battery_range_km",
];

fn default_columns(schema: SourceSchema, kind: RecordKind) -> &'static [&'static str] {
    match (schema, kind) {
        (SourceSchema::TeslaLogger, RecordKind::Position) => TESLALOGGER_POSITION,
        (SourceSchema::TeslaLogger, RecordKind::Drive) => TESLALOGGER_DRIVE,
        (SourceSchema::TeslaLogger, RecordKind::Charge) => TESLALOGGER_CHARGE,
        (SourceSchema::TeslaLogger, RecordKind::State) => TESLALOGGER_STATE,
        (SourceSchema::TeslaMate, RecordKind::Position) => TESLAMATE_POSITION,
        (SourceSchema::TeslaMate, RecordKind::Drive) => TESLAMATE_DRIVE,
        (SourceSchema::TeslaMate, RecordKind::Charge) => TESLAMATE_CHARGE,
        (SourceSchema::TeslaMate, RecordKind::State) => TESLAMATE_STATE,
    }
}

// ---------------------------------------------------------------------------
// Dialect
// ---------------------------------------------------------------------------

/// How one source names columns, numbers its cars, and keeps its clock.
#[derive(Debug, Clone)]
pub struct SourceDialect {
    pub schema: SourceSchema,
    offset: FixedOffset,
    car_ids: HashMap<String, String>,
    overrides: HashMap<RecordKind, HashMap<String, String>>,
}

impl SourceDialect {
    /// Default columns, UTC clock, car ids passed through.
    pub fn new(schema: SourceSchema) -> Self {
        Self {
            schema,
            offset: Utc.fix(),
            car_ids: HashMap::new(),
            overrides: HashMap::new(),
        }
    }

    pub fn from_config(config: &SourceConfig) -> Result<Self, ReconError> {
        let offset = FixedOffset::east_opt(config.utc_offset_minutes * 60).ok_or_else(|| {
            ReconError::Configuration(format!(
                "source '{}': invalid utc_offset_minutes {}",
                config.name, config.utc_offset_minutes
            ))
        })?;
        let mut overrides = HashMap::new();
        for kind in RecordKind::ALL {
            let cols = config.columns.for_kind(kind);
            if !cols.is_empty() {
                overrides.insert(kind, cols.clone());
            }
        }
        Ok(Self {
            schema: config.schema,
            offset,
            car_ids: config.car_ids.clone(),
            overrides,
        })
    }

    /// Source column holding `field` for `kind`.
    pub fn column(&self, kind: RecordKind, field: &str) -> Option<&str> {
        if let Some(col) = self.overrides.get(&kind).and_then(|o| o.get(field)) {
            return Some(col.as_str());
        }
        canonical_fields(kind)
            .iter()
            .position(|f| *f == field)
            .and_then(|i| default_columns(self.schema, kind).get(i))
            .copied()
    }

    fn canonical_car_id(&self, raw: &str) -> String {
        self.car_ids
            .get(raw)
            .cloned()
            .unwrap_or_else(|| raw.to_string())
    }
}

// ---------------------------------------------------------------------------
// Coercion helpers
// ---------------------------------------------------------------------------

fn is_absent(value: &str) -> bool {
    matches!(value, "" | "NULL" | "null" | "\\N" | "None")
}

/// Numeric text, accepting a decimal comma when no dot is present.
pub fn parse_number(value: &str) -> Option<f64> {
    let parsed = match value.parse::<f64>() {
        Ok(v) => v,
        Err(_) if value.contains(',') && !value.contains('.') => {
            value.replacen(',', ".", 1).parse::<f64>().ok()?
        }
        Err(_) => return None,
    };
    parsed.is_finite().then_some(parsed)
}

/// Parse a source timestamp. Text without a zone is read in `offset`.
pub fn parse_timestamp(value: &str, offset: FixedOffset) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"] {
        if let Ok(dt) = DateTime::parse_from_str(value, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for fmt in [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%d.%m.%Y %H:%M:%S",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, fmt) {
            return offset
                .from_local_datetime(&naive)
                .single()
                .map(|dt| dt.with_timezone(&Utc));
        }
    }
    None
}

struct RowReader<'a> {
    row: &'a RawRow,
    dialect: &'a SourceDialect,
    origin: Origin,
    kind: RecordKind,
    unknown: usize,
}

impl<'a> RowReader<'a> {
    fn text(&self, field: &str) -> Option<&'a str> {
        let col = self.dialect.column(self.kind, field)?;
        let value = self.row.get(col)?.trim();
        (!is_absent(value)).then_some(value)
    }

    fn label(&self, field: &str) -> Option<String> {
        self.text(field).map(str::to_string)
    }

    fn number(&mut self, field: &str) -> Option<f64> {
        let raw = self.text(field)?;
        let parsed = parse_number(raw);
        if parsed.is_none() {
            log::debug!(
                "source {} {}: field '{field}' value {raw:?} is not numeric, treating as unknown",
                self.origin,
                self.kind
            );
            self.unknown += 1;
        }
        parsed
    }

    fn bounded(&mut self, field: &str, min: f64, max: f64) -> Option<f64> {
        let value = self.number(field)?;
        if (min..=max).contains(&value) {
            Some(value)
        } else {
            self.unknown += 1;
            None
        }
    }

    fn coordinates(&mut self) -> (Option<f64>, Option<f64>) {
        (
            self.bounded("latitude", -90.0, 90.0),
            self.bounded("longitude", -180.0, 180.0),
        )
    }

    fn optional_time(&mut self, field: &str) -> Option<DateTime<Utc>> {
        let raw = self.text(field)?;
        let parsed = parse_timestamp(raw, self.dialect.offset);
        if parsed.is_none() {
            self.unknown += 1;
        }
        parsed
    }

    fn required_time(&self, field: &str) -> Result<DateTime<Utc>, ReconError> {
        let raw = self
            .text(field)
            .ok_or_else(|| ReconError::malformed(self.origin, self.kind, format!("missing {field}")))?;
        parse_timestamp(raw, self.dialect.offset).ok_or_else(|| {
            ReconError::malformed(
                self.origin,
                self.kind,
                format!("cannot parse {field} {raw:?}"),
            )
        })
    }

    fn car_id(&self) -> Result<String, ReconError> {
        let raw = self
            .text("car_id")
            .ok_or_else(|| ReconError::malformed(self.origin, self.kind, "missing car_id"))?;
        Ok(self.dialect.canonical_car_id(raw))
    }
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Normalize one raw row. `Err(MalformedRecord)` means the row is dropped.
pub fn normalize(
    raw: &RawRow,
    origin: Origin,
    kind: RecordKind,
    dialect: &SourceDialect,
) -> Result<NormalizedRecord, ReconError> {
    normalize_row(raw, origin, kind, dialect).map(|(record, _)| record)
}

fn normalize_row(
    raw: &RawRow,
    origin: Origin,
    kind: RecordKind,
    dialect: &SourceDialect,
) -> Result<(NormalizedRecord, usize), ReconError> {
    let mut r = RowReader {
        row: raw,
        dialect,
        origin,
        kind,
        unknown: 0,
    };
    let car_id = r.car_id()?;

    let record = match kind {
        RecordKind::Position => {
            let occurred_at = r.required_time("occurred_at")?;
            let (latitude, longitude) = r.coordinates();
            NormalizedRecord::Position(PositionRecord {
                origin,
                car_id,
                occurred_at,
                latitude,
                longitude,
                speed_kmh: r.number("speed"),
                power_kw: r.number("power"),
                odometer_km: r.number("odometer"),
                battery_level: r.number("battery_level"),
            })
        }
        RecordKind::Drive => NormalizedRecord::Drive(DriveRecord {
            origin,
            car_id,
            start_at: r.required_time("start_at")?,
            end_at: r.optional_time("end_at"),
            distance_km: r.number("distance"),
            speed_max_kmh: r.number("speed_max"),
            power_max_kw: r.number("power_max"),
            start_battery_level: r.number("start_battery_level"),
            end_battery_level: r.number("end_battery_level"),
        }),
        RecordKind::Charge => {
            let start_at = r.required_time("start_at")?;
            let (latitude, longitude) = r.coordinates();
            NormalizedRecord::Charge(ChargeRecord {
                origin,
                car_id,
                start_at,
                end_at: r.optional_time("end_at"),
                charge_energy_added_kwh: r.number("charge_energy_added"),
                start_battery_level: r.number("start_battery_level"),
                end_battery_level: r.number("end_battery_level"),
                charger_power_kw: r.number("charger_power"),
                cost_total: r.number("cost_total"),
                fast_charger_brand: r.label("fast_charger_brand"),
                latitude,
                longitude,
            })
        }
        RecordKind::State => NormalizedRecord::State(StateRecord {
            origin,
            car_id,
            start_at: r.required_time("start_at")?,
            end_at: r.optional_time("end_at"),
            state: r.label("state"),
            climate_state: r.label("climate_state"),
            charge_state: r.label("charge_state"),
            battery_level: r.number("battery_level"),
            ideal_battery_range_km: r.number("ideal_battery_range_km"),
        }),
    };

    Ok((record, r.unknown))
}

/// Normalize a batch. Never fails: dropped rows are counted and logged.
pub fn normalize_batch(
    rows: &[RawRow],
    origin: Origin,
    kind: RecordKind,
    dialect: &SourceDialect,
) -> NormalizedBatch {
    let mut batch = NormalizedBatch::default();
    for (i, row) in rows.iter().enumerate() {
        match normalize_row(row, origin, kind, dialect) {
            Ok((record, unknown)) => {
                batch.unknown_fields += unknown;
                batch.records.push(record);
            }
            Err(e) => {
                log::debug!("row {}: {e}", i + 1);
                batch.dropped += 1;
            }
        }
    }

    if batch.dropped > 0 {
        log::warn!(
            "source {origin} {kind}: dropped {} of {} rows (missing car id or timestamp)",
            batch.dropped,
            rows.len()
        );
    }
    log::info!(
        "source {origin} {kind}: normalized {} rows ({} unknown fields)",
        batch.records.len(),
        batch.unknown_fields
    );
    batch
}

/// Parse a headered CSV export into raw rows.
pub fn read_csv_rows(csv_data: &str) -> Result<Vec<RawRow>, ReconError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(csv_data.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| ReconError::Io(e.to_string()))?
        .iter()
        .map(|h| h.to_string())
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| ReconError::Io(e.to_string()))?;
        let row: RawRow = headers
            .iter()
            .zip(record.iter())
            .map(|(h, v)| (h.clone(), v.to_string()))
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

/// Decode and normalize one source export. A CSV that cannot be decoded
/// makes the whole side unavailable rather than failing the sync.
pub fn normalize_csv(
    csv_data: &str,
    origin: Origin,
    kind: RecordKind,
    dialect: &SourceDialect,
) -> Result<NormalizedBatch, ReconError> {
    let rows = read_csv_rows(csv_data)
        .map_err(|e| ReconError::source_unavailable(origin, kind, e.to_string()))?;
    Ok(normalize_batch(&rows, origin, kind, dialect))
}
