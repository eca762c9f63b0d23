use std::collections::HashMap;

use chrono::Duration;
use serde::Deserialize;

use crate::error::ReconError;
use crate::model::{Origin, RecordKind};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    pub name: String,
    /// Report potential merges only. Defaults to on.
    #[serde(default = "default_dry_run")]
    pub dry_run: bool,
    /// Max position records per side (0 = unlimited).
    #[serde(default)]
    pub position_limit: usize,
    /// Partition worker threads per kind (0 or 1 = sequential).
    #[serde(default)]
    pub workers: usize,
    #[serde(default)]
    pub tolerance: ToleranceConfig,
    pub sources: SourcesConfig,
    #[serde(default)]
    pub kinds: KindsConfig,
}

fn default_dry_run() -> bool {
    true
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SourcesConfig {
    pub a: SourceConfig,
    pub b: SourceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub schema: SourceSchema,
    /// Offset applied to timestamps that carry no zone of their own.
    #[serde(default)]
    pub utc_offset_minutes: i32,
    /// Source car id -> canonical car id.
    #[serde(default)]
    pub car_ids: HashMap<String, String>,
    #[serde(default)]
    pub columns: ColumnOverrides,
}

/// Column naming dialect of a telemetry source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum SourceSchema {
    #[serde(rename = "teslalogger")]
    TeslaLogger,
    #[serde(rename = "teslamate")]
    TeslaMate,
}

impl std::fmt::Display for SourceSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TeslaLogger => write!(f, "teslalogger"),
            Self::TeslaMate => write!(f, "teslamate"),
        }
    }
}

/// Per-kind `canonical field -> source column` overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ColumnOverrides {
    #[serde(default)]
    pub position: HashMap<String, String>,
    #[serde(default)]
    pub drive: HashMap<String, String>,
    #[serde(default)]
    pub charging: HashMap<String, String>,
    #[serde(default)]
    pub state: HashMap<String, String>,
}

impl ColumnOverrides {
    pub fn for_kind(&self, kind: RecordKind) -> &HashMap<String, String> {
        match kind {
            RecordKind::Position => &self.position,
            RecordKind::Drive => &self.drive,
            RecordKind::Charge => &self.charging,
            RecordKind::State => &self.state,
        }
    }
}

// ---------------------------------------------------------------------------
// Kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KindsConfig {
    #[serde(default)]
    pub position: Option<KindConfig>,
    #[serde(default)]
    pub drive: Option<KindConfig>,
    #[serde(default)]
    pub charging: Option<KindConfig>,
    #[serde(default)]
    pub state: Option<KindConfig>,
}

impl KindsConfig {
    pub fn get(&self, kind: RecordKind) -> Option<&KindConfig> {
        self.slot(kind).as_ref()
    }

    fn slot(&self, kind: RecordKind) -> &Option<KindConfig> {
        match kind {
            RecordKind::Position => &self.position,
            RecordKind::Drive => &self.drive,
            RecordKind::Charge => &self.charging,
            RecordKind::State => &self.state,
        }
    }

    fn slot_mut(&mut self, kind: RecordKind) -> &mut Option<KindConfig> {
        match kind {
            RecordKind::Position => &mut self.position,
            RecordKind::Drive => &mut self.drive,
            RecordKind::Charge => &mut self.charging,
            RecordKind::State => &mut self.state,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct KindConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Source A export, relative to the config file.
    pub a: String,
    /// Source B export, relative to the config file.
    pub b: String,
    #[serde(default)]
    pub partition: Option<PartitionUnit>,
}

impl KindConfig {
    pub fn file(&self, origin: Origin) -> &str {
        match origin {
            Origin::A => &self.a,
            Origin::B => &self.b,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionUnit {
    Car,
    CarDay,
}

impl PartitionUnit {
    /// Positions are dense enough to need day slices; interval kinds are not.
    pub fn default_for(kind: RecordKind) -> Self {
        match kind {
            RecordKind::Position => Self::CarDay,
            _ => Self::Car,
        }
    }
}

// ---------------------------------------------------------------------------
// Tolerance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToleranceConfig {
    #[serde(default = "default_position_window")]
    pub position_time_window_seconds: i64,
    #[serde(default = "default_position_distance")]
    pub position_distance_threshold_meters: f64,
    #[serde(default = "default_interval_window")]
    pub drive_time_window_seconds: i64,
    /// Drives match only when reported distances differ by less than this.
    #[serde(default = "default_drive_distance")]
    pub drive_distance_threshold_km: f64,
    #[serde(default = "default_interval_window")]
    pub charging_time_window_seconds: i64,
    #[serde(default = "default_interval_window")]
    pub state_time_window_seconds: i64,
}

fn default_position_window() -> i64 {
    30
}

fn default_position_distance() -> f64 {
    10.0
}

fn default_interval_window() -> i64 {
    300
}

fn default_drive_distance() -> f64 {
    1.0
}

impl Default for ToleranceConfig {
    fn default() -> Self {
        Self {
            position_time_window_seconds: default_position_window(),
            position_distance_threshold_meters: default_position_distance(),
            drive_time_window_seconds: default_interval_window(),
            drive_distance_threshold_km: default_drive_distance(),
            charging_time_window_seconds: default_interval_window(),
            state_time_window_seconds: default_interval_window(),
        }
    }
}

impl ToleranceConfig {
    pub fn time_window_seconds(&self, kind: RecordKind) -> i64 {
        match kind {
            RecordKind::Position => self.position_time_window_seconds,
            RecordKind::Drive => self.drive_time_window_seconds,
            RecordKind::Charge => self.charging_time_window_seconds,
            RecordKind::State => self.state_time_window_seconds,
        }
    }

    /// Windows past chrono's range saturate; `validate` rejects them first.
    pub fn time_window(&self, kind: RecordKind) -> Duration {
        Duration::try_seconds(self.time_window_seconds(kind)).unwrap_or(Duration::MAX)
    }

    pub fn validate(&self) -> Result<(), ReconError> {
        for kind in RecordKind::ALL {
            let secs = self.time_window_seconds(kind);
            if secs < 0 {
                return Err(ReconError::Configuration(format!(
                    "{kind} time window must be >= 0 seconds, got {secs}"
                )));
            }
            if Duration::try_seconds(secs).is_none() {
                return Err(ReconError::Configuration(format!(
                    "{kind} time window of {secs} seconds is out of range"
                )));
            }
        }
        let thresholds = [
            ("position_distance_threshold_meters", self.position_distance_threshold_meters),
            ("drive_distance_threshold_km", self.drive_distance_threshold_km),
        ];
        for (name, value) in thresholds {
            if !value.is_finite() || value < 0.0 {
                return Err(ReconError::Configuration(format!(
                    "{name} must be a finite value >= 0, got {value}"
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Overrides (environment / command line)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub dry_run: Option<bool>,
    pub position_time_window_seconds: Option<i64>,
    pub position_distance_threshold_meters: Option<f64>,
    pub position_limit: Option<usize>,
    pub workers: Option<usize>,
    pub sync_positions: Option<bool>,
    pub sync_drives: Option<bool>,
    pub sync_charging: Option<bool>,
    pub sync_states: Option<bool>,
}

impl ConfigOverrides {
    fn sync_toggle(&self, kind: RecordKind) -> Option<bool> {
        match kind {
            RecordKind::Position => self.sync_positions,
            RecordKind::Drive => self.sync_drives,
            RecordKind::Charge => self.sync_charging,
            RecordKind::State => self.sync_states,
        }
    }
}

// ---------------------------------------------------------------------------
// Parse + Validate
// ---------------------------------------------------------------------------

impl SyncConfig {
    pub fn from_toml(input: &str) -> Result<Self, ReconError> {
        let config: SyncConfig =
            toml::from_str(input).map_err(|e| ReconError::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides, then re-validate.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) -> Result<(), ReconError> {
        if let Some(dry_run) = overrides.dry_run {
            self.dry_run = dry_run;
        }
        if let Some(secs) = overrides.position_time_window_seconds {
            self.tolerance.position_time_window_seconds = secs;
        }
        if let Some(meters) = overrides.position_distance_threshold_meters {
            self.tolerance.position_distance_threshold_meters = meters;
        }
        if let Some(limit) = overrides.position_limit {
            self.position_limit = limit;
        }
        if let Some(workers) = overrides.workers {
            self.workers = workers;
        }

        for kind in RecordKind::ALL {
            let Some(enabled) = overrides.sync_toggle(kind) else {
                continue;
            };
            match self.kinds.slot_mut(kind) {
                Some(kind_config) => kind_config.enabled = enabled,
                None if enabled => {
                    return Err(ReconError::Configuration(format!(
                        "{kind} sync requested but config has no [kinds.{kind}] section"
                    )));
                }
                None => {}
            }
        }

        self.validate()
    }

    pub fn validate(&self) -> Result<(), ReconError> {
        self.tolerance.validate()?;

        if self.sources.a.name == self.sources.b.name {
            return Err(ReconError::Configuration(format!(
                "sources a and b must have distinct names, both are '{}'",
                self.sources.a.name
            )));
        }

        for (label, source) in [("a", &self.sources.a), ("b", &self.sources.b)] {
            if source.utc_offset_minutes.abs() >= 24 * 60 {
                return Err(ReconError::Configuration(format!(
                    "source {label}: utc_offset_minutes must be within +/-1439, got {}",
                    source.utc_offset_minutes
                )));
            }
            for kind in RecordKind::ALL {
                let known = crate::normalize::canonical_fields(kind);
                for field in source.columns.for_kind(kind).keys() {
                    if !known.contains(&field.as_str()) {
                        return Err(ReconError::Configuration(format!(
                            "source {label}: unknown {kind} field '{field}' in column overrides"
                        )));
                    }
                }
            }
        }

        for kind in RecordKind::ALL {
            if let Some(kind_config) = self.kinds.get(kind) {
                if kind_config.a.trim().is_empty() || kind_config.b.trim().is_empty() {
                    return Err(ReconError::Configuration(format!(
                        "[kinds.{kind}] needs both 'a' and 'b' files"
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn source(&self, origin: Origin) -> &SourceConfig {
        match origin {
            Origin::A => &self.sources.a,
            Origin::B => &self.sources.b,
        }
    }

    /// Enabled kinds in sync order.
    pub fn enabled_kinds(&self) -> Vec<RecordKind> {
        RecordKind::ALL
            .into_iter()
            .filter(|k| self.kinds.get(*k).is_some_and(|c| c.enabled))
            .collect()
    }

    pub fn partition_unit(&self, kind: RecordKind) -> PartitionUnit {
        self.kinds
            .get(kind)
            .and_then(|c| c.partition)
            .unwrap_or_else(|| PartitionUnit::default_for(kind))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
name = "TeslaLogger vs TeslaMate"

[sources.a]
name = "teslalogger"
schema = "teslalogger"
utc_offset_minutes = 120

[sources.a.car_ids]
"1" = "model3"

[sources.b]
name = "teslamate"
schema = "teslamate"

[sources.b.car_ids]
"3" = "model3"

[kinds.position]
a = "tl_pos.csv"
b = "tm_pos.csv"

[kinds.drive]
enabled = false
a = "tl_trip.csv"
b = "tm_drives.csv"
partition = "car_day"
"#;

    #[test]
    fn parse_valid_with_defaults() {
        let config = SyncConfig::from_toml(VALID).unwrap();
        assert_eq!(config.name, "TeslaLogger vs TeslaMate");
        assert!(config.dry_run);
        assert_eq!(config.position_limit, 0);
        assert_eq!(config.tolerance, ToleranceConfig::default());
        assert_eq!(config.tolerance.position_time_window_seconds, 30);
        assert_eq!(config.tolerance.position_distance_threshold_meters, 10.0);
        assert_eq!(config.tolerance.drive_time_window_seconds, 300);
        assert_eq!(config.sources.a.schema, SourceSchema::TeslaLogger);
        assert_eq!(config.sources.a.utc_offset_minutes, 120);
        assert_eq!(config.sources.b.car_ids["3"], "model3");
        assert_eq!(config.enabled_kinds(), vec![RecordKind::Position]);
        assert_eq!(config.partition_unit(RecordKind::Position), PartitionUnit::CarDay);
        assert_eq!(config.partition_unit(RecordKind::Drive), PartitionUnit::CarDay);
        assert_eq!(config.partition_unit(RecordKind::State), PartitionUnit::Car);
    }

    #[test]
    fn reject_negative_distance_threshold() {
        let input = format!(
            "{VALID}\n[tolerance]\nposition_distance_threshold_meters = -1.0\n"
        );
        let err = SyncConfig::from_toml(&input).unwrap_err();
        assert!(matches!(err, ReconError::Configuration(_)));
        assert!(err.to_string().contains("position_distance_threshold_meters"));
    }

    #[test]
    fn reject_negative_window() {
        let input = format!("{VALID}\n[tolerance]\nstate_time_window_seconds = -5\n");
        let err = SyncConfig::from_toml(&input).unwrap_err();
        assert!(err.to_string().contains("state time window"));
    }

    #[test]
    fn reject_oversized_window() {
        let input = format!(
            "{VALID}\n[tolerance]\nposition_time_window_seconds = 9223372036854775807\n"
        );
        let err = SyncConfig::from_toml(&input).unwrap_err();
        assert!(matches!(err, ReconError::Configuration(_)));
        assert!(err.to_string().contains("out of range"));

        let mut config = SyncConfig::from_toml(VALID).unwrap();
        let overrides = ConfigOverrides {
            position_time_window_seconds: Some(i64::MAX),
            ..Default::default()
        };
        assert!(matches!(
            config.apply_overrides(&overrides),
            Err(ReconError::Configuration(_))
        ));
    }

    #[test]
    fn time_window_saturates_instead_of_panicking() {
        let tolerance = ToleranceConfig {
            state_time_window_seconds: i64::MAX,
            ..Default::default()
        };
        assert_eq!(tolerance.time_window(RecordKind::State), Duration::MAX);
        assert_eq!(tolerance.time_window(RecordKind::Position), Duration::seconds(30));
    }

    #[test]
    fn reject_unknown_schema() {
        let input = VALID.replace("schema = \"teslamate\"", "schema = \"tesla-mate\"");
        let err = SyncConfig::from_toml(&input).unwrap_err();
        assert!(matches!(err, ReconError::ConfigParse(_)));
    }

    #[test]
    fn reject_unknown_column_override() {
        let input = format!("{VALID}\n[sources.b.columns.position]\nlatitud = \"lat\"\n");
        let err = SyncConfig::from_toml(&input).unwrap_err();
        assert!(err.to_string().contains("'latitud'"));
    }

    #[test]
    fn reject_same_source_names() {
        let input = VALID.replace("name = \"teslamate\"", "name = \"teslalogger\"");
        let err = SyncConfig::from_toml(&input).unwrap_err();
        assert!(err.to_string().contains("distinct names"));
    }

    #[test]
    fn overrides_apply_and_revalidate() {
        let mut config = SyncConfig::from_toml(VALID).unwrap();
        let overrides = ConfigOverrides {
            dry_run: Some(false),
            position_time_window_seconds: Some(45),
            position_limit: Some(500),
            sync_drives: Some(true),
            sync_positions: Some(false),
            ..Default::default()
        };
        config.apply_overrides(&overrides).unwrap();
        assert!(!config.dry_run);
        assert_eq!(config.tolerance.position_time_window_seconds, 45);
        assert_eq!(config.position_limit, 500);
        assert_eq!(config.enabled_kinds(), vec![RecordKind::Drive]);

        let bad = ConfigOverrides {
            position_distance_threshold_meters: Some(f64::NAN),
            ..Default::default()
        };
        assert!(config.apply_overrides(&bad).is_err());
    }

    #[test]
    fn enabling_unconfigured_kind_fails() {
        let mut config = SyncConfig::from_toml(VALID).unwrap();
        let overrides = ConfigOverrides {
            sync_states: Some(true),
            ..Default::default()
        };
        let err = config.apply_overrides(&overrides).unwrap_err();
        assert!(err.to_string().contains("[kinds.state]"));

        // Disabling an absent kind is a no-op.
        let overrides = ConfigOverrides {
            sync_charging: Some(false),
            ..Default::default()
        };
        assert!(config.apply_overrides(&overrides).is_ok());
    }
}
