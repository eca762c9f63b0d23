//! `telesync run` / `telesync validate` — config-driven telemetry sync.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Args, Subcommand};
use telesync_recon::engine::{commit, sync, KindInput};
use telesync_recon::model::{Origin, RecordKind, SyncReport};
use telesync_recon::normalize::{normalize_csv, SourceDialect};
use telesync_recon::{ConfigOverrides, ReconError, SyncConfig};

use crate::exit_codes::{exit_code_for, EXIT_INVALID_CONFIG, EXIT_RUNTIME, EXIT_SKIPPED_PARTITIONS};
use crate::sink::JsonDirSink;
use crate::CliError;

#[derive(Subcommand)]
pub enum SyncCommands {
    /// Reconcile every enabled kind from a TOML config file
    #[command(after_help = "\
Examples:
  telesync run sync.toml
  telesync run sync.toml --json
  telesync run sync.toml --output report.json
  DRYRUN=0 telesync run sync.toml --commit-dir out/
  telesync run sync.toml --sync-states false --position-limit 5000")]
    Run {
        /// Path to the sync .toml config file
        config: PathBuf,

        /// Print the JSON report to stdout
        #[arg(long)]
        json: bool,

        /// Write the JSON report to a file
        #[arg(long)]
        output: Option<PathBuf>,

        /// Write merged and new records per kind here when dry run is off
        #[arg(long)]
        commit_dir: Option<PathBuf>,

        #[command(flatten)]
        overrides: OverrideArgs,
    },

    /// Validate a sync config without reading any exports
    #[command(after_help = "\
Examples:
  telesync validate sync.toml")]
    Validate {
        /// Path to the sync .toml config file
        config: PathBuf,

        #[command(flatten)]
        overrides: OverrideArgs,
    },
}

/// Settings that override the config file. Each flag also reads an
/// environment variable, so `.env`-style deployments keep working.
#[derive(Args, Debug, Default)]
pub struct OverrideArgs {
    /// Report potential merges without committing
    #[arg(long, env = "DRYRUN", action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    dry_run: Option<bool>,

    /// Position time window in seconds
    #[arg(long = "position-time-window", env = "POSITION_TIME_WINDOW", allow_hyphen_values = true)]
    position_time_window: Option<i64>,

    /// Position distance threshold in meters
    #[arg(long = "position-distance-threshold", env = "POSITION_DISTANCE_THRESHOLD", allow_hyphen_values = true)]
    position_distance_threshold: Option<f64>,

    /// Max position records per source (0 = unlimited)
    #[arg(long, env = "POSITION_LIMIT")]
    position_limit: Option<usize>,

    /// Partition worker threads per kind
    #[arg(long)]
    workers: Option<usize>,

    /// Enable or disable position sync
    #[arg(long, env = "SYNC_POSITIONS", action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    sync_positions: Option<bool>,

    /// Enable or disable drive sync
    #[arg(long, env = "SYNC_DRIVES", action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    sync_drives: Option<bool>,

    /// Enable or disable charging sync
    #[arg(long, env = "SYNC_CHARGING", action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    sync_charging: Option<bool>,

    /// Enable or disable state sync
    #[arg(long, env = "SYNC_STATES", action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    sync_states: Option<bool>,
}

impl OverrideArgs {
    fn to_overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            dry_run: self.dry_run,
            position_time_window_seconds: self.position_time_window,
            position_distance_threshold_meters: self.position_distance_threshold,
            position_limit: self.position_limit,
            workers: self.workers,
            sync_positions: self.sync_positions,
            sync_drives: self.sync_drives,
            sync_charging: self.sync_charging,
            sync_states: self.sync_states,
        }
    }
}

pub fn cmd_sync(cmd: SyncCommands) -> Result<(), CliError> {
    match cmd {
        SyncCommands::Run {
            config,
            json,
            output,
            commit_dir,
            overrides,
        } => cmd_run(config, json, output, commit_dir, &overrides),
        SyncCommands::Validate { config, overrides } => cmd_validate(config, &overrides),
    }
}

fn sync_err(code: u8, msg: impl Into<String>) -> CliError {
    CliError {
        code,
        message: msg.into(),
        hint: None,
    }
}

fn engine_err(err: ReconError) -> CliError {
    sync_err(exit_code_for(&err), err.to_string())
}

fn load_config(path: &Path, overrides: &OverrideArgs) -> Result<SyncConfig, CliError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| sync_err(EXIT_RUNTIME, format!("cannot read config {}: {e}", path.display())))?;
    let mut config = SyncConfig::from_toml(&text).map_err(engine_err)?;
    config
        .apply_overrides(&overrides.to_overrides())
        .map_err(engine_err)?;
    Ok(config)
}

/// Read and normalize both exports of every enabled kind. A file that cannot
/// be read makes that side unavailable; the engine reports it per partition.
fn load_inputs(config: &SyncConfig, base_dir: &Path) -> Result<HashMap<RecordKind, KindInput>, CliError> {
    let dialects = [
        SourceDialect::from_config(config.source(Origin::A)).map_err(engine_err)?,
        SourceDialect::from_config(config.source(Origin::B)).map_err(engine_err)?,
    ];

    let mut inputs = HashMap::new();
    for kind in config.enabled_kinds() {
        let Some(kind_config) = config.kinds.get(kind) else {
            continue;
        };
        let load = |origin: Origin, dialect: &SourceDialect| {
            let path = base_dir.join(kind_config.file(origin));
            log::debug!("{kind}: reading source {origin} from {}", path.display());
            std::fs::read_to_string(&path)
                .map_err(|e| {
                    ReconError::source_unavailable(
                        origin,
                        kind,
                        format!("cannot read {}: {e}", path.display()),
                    )
                })
                .and_then(|csv| normalize_csv(&csv, origin, kind, dialect))
        };
        let input = KindInput::new(load(Origin::A, &dialects[0]), load(Origin::B, &dialects[1]));
        inputs.insert(kind, input);
    }
    Ok(inputs)
}

fn print_summary(report: &SyncReport) {
    let meta = &report.meta;
    eprintln!(
        "sync {} vs {}{}",
        meta.source_a,
        meta.source_b,
        if meta.dry_run { " (dry run)" } else { "" }
    );
    for run in &report.runs {
        let s = &run.stats;
        eprintln!(
            "{:>9}: {} identical, {} merged, {} new, {} skipped ({} dropped)",
            run.kind.as_str(),
            s.identical,
            s.merged,
            s.added,
            s.skipped,
            s.dropped,
        );
        for skipped in &run.skipped_partitions {
            eprintln!("           skipped {}: {}", skipped.key, skipped.reason);
        }
    }
}

fn cmd_run(
    config_path: PathBuf,
    json_output: bool,
    output_file: Option<PathBuf>,
    commit_dir: Option<PathBuf>,
    overrides: &OverrideArgs,
) -> Result<(), CliError> {
    let config = load_config(&config_path, overrides)?;

    // Resolve export paths relative to the config file's directory
    let base_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    let inputs = load_inputs(&config, base_dir)?;

    let report = sync(&config, inputs).map_err(engine_err)?;

    if !config.dry_run {
        match commit_dir {
            Some(dir) => {
                let mut sink = JsonDirSink::new(dir);
                for run in &report.runs {
                    commit(run, &mut sink).map_err(engine_err)?;
                }
            }
            None => log::warn!("dry run is off but no --commit-dir was given; nothing written"),
        }
    }

    let json_str = serde_json::to_string_pretty(&report)
        .map_err(|e| sync_err(EXIT_RUNTIME, format!("JSON serialization error: {e}")))?;

    if let Some(ref path) = output_file {
        std::fs::write(path, &json_str)
            .map_err(|e| sync_err(EXIT_RUNTIME, format!("cannot write output: {e}")))?;
        eprintln!("wrote {}", path.display());
    }

    if json_output {
        println!("{json_str}");
    }

    print_summary(&report);

    let skipped = report.skipped_partition_count();
    if skipped > 0 {
        return Err(sync_err(
            EXIT_SKIPPED_PARTITIONS,
            format!("{skipped} partition(s) skipped; see report"),
        ));
    }
    Ok(())
}

fn cmd_validate(config_path: PathBuf, overrides: &OverrideArgs) -> Result<(), CliError> {
    let config = load_config(&config_path, overrides)?;
    SourceDialect::from_config(config.source(Origin::A)).map_err(engine_err)?;
    SourceDialect::from_config(config.source(Origin::B)).map_err(engine_err)?;

    let kinds: Vec<&str> = config.enabled_kinds().iter().map(|k| k.as_str()).collect();
    if kinds.is_empty() {
        return Err(sync_err(EXIT_INVALID_CONFIG, "no kinds enabled").with_hint(
            "add a [kinds.position] (or drive/charging/state) section, or re-enable one",
        ));
    }
    eprintln!(
        "config OK: {} ({} vs {}), kinds: {}",
        config.name,
        config.sources.a.name,
        config.sources.b.name,
        kinds.join(", ")
    );
    Ok(())
}
