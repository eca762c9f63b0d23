use std::collections::HashMap;

use crate::config::{SyncConfig, ToleranceConfig};
use crate::error::ReconError;
use crate::matcher::match_records;
use crate::merge::merge_with;
use crate::model::{
    MatchDecision, MergedRecord, NormalizedRecord, Origin, PartitionKey, RecordKind, RunOutput,
    SkippedPartition, SyncMeta, SyncReport,
};
use crate::partition::{partition, Partition, Partitions, SourceBatch};
use crate::stats::RunStats;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub dry_run: bool,
    /// Worker threads for partitions. 0 or 1 runs sequentially.
    pub workers: usize,
}

enum Outcome {
    Done {
        key: PartitionKey,
        stats: RunStats,
        merged: Vec<MergedRecord>,
        unmatched_a: Vec<NormalizedRecord>,
        unmatched_b: Vec<NormalizedRecord>,
    },
    Skipped(SkippedPartition),
}

impl Outcome {
    fn key(&self) -> &PartitionKey {
        match self {
            Self::Done { key, .. } => key,
            Self::Skipped(s) => &s.key,
        }
    }
}

fn run_partition(
    kind: RecordKind,
    partition: &Partition,
    tolerance: &ToleranceConfig,
) -> Result<Outcome, ReconError> {
    let (a, b) = match (&partition.a, &partition.b) {
        (Ok(a), Ok(b)) => (a, b),
        _ => {
            let reason = partition.unavailable_reason().unwrap_or_default();
            return Ok(Outcome::Skipped(SkippedPartition {
                key: partition.key.clone(),
                reason,
            }));
        }
    };

    let decisions = match_records(a, b, kind, tolerance)?;
    let stats = RunStats::from_decisions(&decisions);

    let mut merged = Vec::with_capacity(stats.matched());
    let mut unmatched_a = Vec::with_capacity(stats.added);
    let mut unmatched_b = Vec::new();
    for decision in decisions {
        match decision {
            MatchDecision::MatchedPair { a, b, confidence } => {
                merged.push(merge_with(&a, &b, confidence)?);
            }
            MatchDecision::UnmatchedA(record) => unmatched_a.push(record),
            MatchDecision::UnmatchedB(record) => unmatched_b.push(record),
        }
    }

    log::debug!(
        "{kind} {}: identical={} merged={} added={} skipped={}",
        partition.key,
        stats.identical,
        stats.merged,
        stats.added,
        stats.skipped
    );

    Ok(Outcome::Done {
        key: partition.key.clone(),
        stats,
        merged,
        unmatched_a,
        unmatched_b,
    })
}

/// A partition-local error skips that partition; fatal ones stop the run.
fn settle(partition: &Partition, result: Result<Outcome, ReconError>) -> Result<Outcome, ReconError> {
    match result {
        Err(err) if !err.is_fatal() => Ok(Outcome::Skipped(SkippedPartition {
            key: partition.key.clone(),
            reason: err.to_string(),
        })),
        other => other,
    }
}

fn run_one(kind: RecordKind, partition: &Partition, tolerance: &ToleranceConfig) -> Result<Outcome, ReconError> {
    settle(partition, run_partition(kind, partition, tolerance))
}

fn run_all(
    kind: RecordKind,
    parts: &[Partition],
    tolerance: &ToleranceConfig,
    workers: usize,
) -> Vec<Result<Outcome, ReconError>> {
    if workers <= 1 || parts.len() <= 1 {
        return parts.iter().map(|p| run_one(kind, p, tolerance)).collect();
    }

    let chunk_size = parts.len().div_ceil(workers);
    std::thread::scope(|scope| {
        let handles: Vec<_> = parts
            .chunks(chunk_size)
            .map(|chunk| {
                scope.spawn(move || {
                    chunk
                        .iter()
                        .map(|p| run_one(kind, p, tolerance))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        // Chunks are joined in spawn order, so outcomes keep partition order.
        handles
            .into_iter()
            .flat_map(|handle| match handle.join() {
                Ok(outcomes) => outcomes,
                Err(panic) => std::panic::resume_unwind(panic),
            })
            .collect()
    })
}

/// Match and merge every partition of one kind.
///
/// Partitions with a missing side are reported in `skipped_partitions` and
/// contribute no decisions. Output is assembled in partition key order, so
/// the result does not depend on `options.workers`.
pub fn run(
    kind: RecordKind,
    partitions: &Partitions,
    tolerance: &ToleranceConfig,
    options: RunOptions,
) -> Result<RunOutput, ReconError> {
    tolerance.validate()?;

    let mut outcomes = run_all(kind, &partitions.parts, tolerance, options.workers)
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;
    outcomes.sort_by(|x, y| x.key().cmp(y.key()));

    let mut output = RunOutput {
        kind,
        dry_run: options.dry_run,
        stats: RunStats::default(),
        merged: Vec::new(),
        unmatched_a: Vec::new(),
        unmatched_b: Vec::new(),
        skipped_partitions: Vec::new(),
    };
    output.stats.record_dropped(partitions.dropped);

    for outcome in outcomes {
        match outcome {
            Outcome::Done {
                stats,
                merged,
                unmatched_a,
                unmatched_b,
                ..
            } => {
                output.stats += stats;
                output.merged.extend(merged);
                output.unmatched_a.extend(unmatched_a);
                output.unmatched_b.extend(unmatched_b);
            }
            Outcome::Skipped(skipped) => {
                log::warn!("{kind} {}: skipped, {}", skipped.key, skipped.reason);
                output.skipped_partitions.push(skipped);
            }
        }
    }

    let s = &output.stats;
    log::info!(
        "{kind}: identical={} merged={} added={} skipped={} (dropped={}), {} partitions skipped",
        s.identical,
        s.merged,
        s.added,
        s.skipped,
        s.dropped,
        output.skipped_partitions.len()
    );
    Ok(output)
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Destination for reconciled records. Implementations own their storage.
pub trait MergeSink {
    /// Persist merged pairs and A-only records of one kind. Returns the
    /// number of records written.
    fn commit(
        &mut self,
        kind: RecordKind,
        merged: &[MergedRecord],
        new_records: &[NormalizedRecord],
    ) -> Result<usize, ReconError>;
}

/// Hand a run's results to `sink`, unless the run was a dry run.
pub fn commit(output: &RunOutput, sink: &mut dyn MergeSink) -> Result<usize, ReconError> {
    if output.dry_run {
        log::info!(
            "{}: dry run, not committing {} merged and {} new records",
            output.kind,
            output.merged.len(),
            output.unmatched_a.len()
        );
        return Ok(0);
    }
    let written = sink.commit(output.kind, &output.merged, &output.unmatched_a)?;
    log::info!("{}: committed {written} records", output.kind);
    Ok(written)
}

/// Log what a commit would have written.
pub fn log_potential_merges(output: &RunOutput) {
    log::info!(
        "{}: {} potential merges, {} new records",
        output.kind,
        output.merged.len(),
        output.unmatched_a.len()
    );
    for merged in &output.merged {
        log::debug!(
            "{} merge ({:?}) car {} at {}",
            output.kind,
            merged.confidence,
            merged.record.car_id(),
            merged.record.time_key().to_rfc3339()
        );
    }
    if output.dry_run {
        log::warn!("DRY RUN active: nothing was written. Set DRYRUN=0 or pass --dry-run false to commit.");
    }
}

// ---------------------------------------------------------------------------
// Multi-kind sync
// ---------------------------------------------------------------------------

/// Both sides of one kind, as loaded by the caller.
#[derive(Debug, Clone)]
pub struct KindInput {
    pub a: SourceBatch,
    pub b: SourceBatch,
}

impl KindInput {
    pub fn new(a: SourceBatch, b: SourceBatch) -> Self {
        Self { a, b }
    }

    fn missing(kind: RecordKind) -> Self {
        Self {
            a: Err(ReconError::source_unavailable(Origin::A, kind, "no input supplied")),
            b: Err(ReconError::source_unavailable(Origin::B, kind, "no input supplied")),
        }
    }
}

fn limit(batch: SourceBatch, limit: usize) -> SourceBatch {
    batch.map(|mut b| {
        b.truncate_to(limit);
        b
    })
}

/// Run every enabled kind in sync order (position, drive, charging, state).
///
/// The config is validated first; a fatal error in any kind stops the sync.
pub fn sync(
    config: &SyncConfig,
    mut inputs: HashMap<RecordKind, KindInput>,
) -> Result<SyncReport, ReconError> {
    config.validate()?;

    let options = RunOptions {
        dry_run: config.dry_run,
        workers: config.workers,
    };

    let mut runs = Vec::new();
    for kind in config.enabled_kinds() {
        let input = inputs.remove(&kind).unwrap_or_else(|| KindInput::missing(kind));
        let (a, b) = if kind == RecordKind::Position {
            (limit(input.a, config.position_limit), limit(input.b, config.position_limit))
        } else {
            (input.a, input.b)
        };

        let partitions = partition(kind, a, b, config.partition_unit(kind));
        let output = run(kind, &partitions, &config.tolerance, options)?;
        if output.dry_run {
            log_potential_merges(&output);
        }
        runs.push(output);
    }

    Ok(SyncReport {
        meta: SyncMeta {
            config_name: config.name.clone(),
            source_a: config.sources.a.name.clone(),
            source_b: config.sources.b.name.clone(),
            dry_run: config.dry_run,
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
            run_at: chrono::Utc::now().to_rfc3339(),
        },
        runs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PartitionUnit;
    use crate::model::{ChargeRecord, Confidence, NormalizedBatch, PositionRecord};
    use chrono::{DateTime, TimeZone, Utc};

    fn at(day: u32, h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, day, h, m, s).unwrap()
    }

    fn pos(origin: Origin, car: &str, t: DateTime<Utc>, lat: f64) -> NormalizedRecord {
        NormalizedRecord::Position(PositionRecord {
            origin,
            car_id: car.into(),
            occurred_at: t,
            latitude: Some(lat),
            longitude: Some(14.0),
            speed_kmh: None,
            power_kw: None,
            odometer_km: None,
            battery_level: None,
        })
    }

    fn charge(origin: Origin, t: DateTime<Utc>, kwh: f64) -> NormalizedRecord {
        NormalizedRecord::Charge(ChargeRecord {
            origin,
            car_id: "3".into(),
            start_at: t,
            end_at: None,
            charge_energy_added_kwh: Some(kwh),
            start_battery_level: None,
            end_battery_level: None,
            charger_power_kw: None,
            cost_total: None,
            fast_charger_brand: None,
            latitude: None,
            longitude: None,
        })
    }

    fn fleet() -> (NormalizedBatch, NormalizedBatch) {
        let mut a = Vec::new();
        let mut b = Vec::new();
        for car in ["1", "2", "3"] {
            for day in 1..=3 {
                for i in 0..5 {
                    let t = at(day, 12, i * 5, 0);
                    a.push(pos(Origin::A, car, t, 50.0));
                    if i % 2 == 0 {
                        b.push(pos(Origin::B, car, t + chrono::Duration::seconds(10), 50.00003));
                    }
                }
                b.push(pos(Origin::B, car, at(day, 18, 0, 0), 51.0));
            }
        }
        (NormalizedBatch::new(a), NormalizedBatch::new(b))
    }

    #[test]
    fn charge_scenario() {
        let parts = partition(
            RecordKind::Charge,
            Ok(NormalizedBatch::new(vec![charge(Origin::A, at(1, 18, 0, 0), 10.2)])),
            Ok(NormalizedBatch::new(vec![charge(Origin::B, at(1, 18, 1, 0), 10.2)])),
            PartitionUnit::Car,
        );
        let out = run(RecordKind::Charge, &parts, &ToleranceConfig::default(), RunOptions::default()).unwrap();
        assert_eq!(out.stats.merged, 1);
        assert_eq!(out.merged.len(), 1);
        let NormalizedRecord::Charge(c) = &out.merged[0].record else {
            panic!("expected charge");
        };
        assert_eq!(c.charge_energy_added_kwh, Some(10.2));
        assert_eq!(c.cost_total, None);
        assert_eq!(out.merged[0].confidence, Confidence::WithinTolerance);
    }

    #[test]
    fn conservation_per_partition() {
        let (a, b) = fleet();
        let a_len = a.records.len();
        let b_len = b.records.len();
        let parts = partition(RecordKind::Position, Ok(a), Ok(b), PartitionUnit::CarDay);
        let out = run(RecordKind::Position, &parts, &ToleranceConfig::default(), RunOptions::default()).unwrap();
        assert_eq!(out.stats.a_records(), a_len);
        assert_eq!(out.stats.matched() + out.stats.skipped, b_len);
        assert_eq!(out.merged.len(), out.stats.matched());
        assert_eq!(out.unmatched_a.len(), out.stats.added);
        assert_eq!(out.unmatched_b.len(), out.stats.skipped);
    }

    #[test]
    fn worker_count_does_not_change_results() {
        let (a, b) = fleet();
        let parts = partition(RecordKind::Position, Ok(a), Ok(b), PartitionUnit::CarDay);
        let tol = ToleranceConfig::default();
        let sequential = run(RecordKind::Position, &parts, &tol, RunOptions::default()).unwrap();
        for workers in [2, 3, 8, 64] {
            let parallel = run(
                RecordKind::Position,
                &parts,
                &tol,
                RunOptions { dry_run: false, workers },
            )
            .unwrap();
            assert_eq!(parallel.stats, sequential.stats);
            assert_eq!(parallel.merged, sequential.merged);
            assert_eq!(parallel.unmatched_a, sequential.unmatched_a);
            assert_eq!(parallel.unmatched_b, sequential.unmatched_b);
        }
    }

    #[test]
    fn unavailable_partition_is_skipped_not_fatal() {
        let parts = Partitions::from(vec![
            Partition {
                key: PartitionKey { car_id: Some("1".into()), day: None },
                a: Ok(vec![charge(Origin::A, at(1, 18, 0, 0), 10.0)]),
                b: Err(ReconError::source_unavailable(Origin::B, RecordKind::Charge, "timeout")),
            },
            Partition {
                key: PartitionKey { car_id: Some("3".into()), day: None },
                a: Ok(vec![charge(Origin::A, at(1, 18, 0, 0), 10.0)]),
                b: Ok(vec![]),
            },
        ]);
        let out = run(RecordKind::Charge, &parts, &ToleranceConfig::default(), RunOptions::default()).unwrap();
        assert_eq!(out.skipped_partitions.len(), 1);
        assert!(out.skipped_partitions[0].reason.contains("timeout"));
        assert_eq!(out.stats.added, 1);
    }

    #[test]
    fn contract_violation_is_fatal() {
        let parts = Partitions::from(vec![Partition {
            key: PartitionKey { car_id: None, day: None },
            a: Ok(vec![pos(Origin::A, "1", at(1, 12, 0, 0), 50.0)]),
            b: Ok(vec![]),
        }]);
        let err = run(RecordKind::Charge, &parts, &ToleranceConfig::default(), RunOptions::default()).unwrap_err();
        assert!(matches!(err, ReconError::KindMismatch { .. }));
    }

    #[test]
    fn partition_local_error_becomes_skip() {
        let part = Partition {
            key: PartitionKey { car_id: Some("7".into()), day: None },
            a: Ok(vec![]),
            b: Ok(vec![]),
        };
        let local = ReconError::malformed(Origin::B, RecordKind::Drive, "bad start_at");
        match settle(&part, Err(local)) {
            Ok(Outcome::Skipped(skipped)) => {
                assert_eq!(skipped.key, part.key);
                assert!(skipped.reason.contains("bad start_at"));
            }
            _ => panic!("expected a skipped partition"),
        }

        let fatal = ReconError::KindMismatch {
            expected: RecordKind::Drive,
            found: RecordKind::State,
        };
        assert!(matches!(settle(&part, Err(fatal)), Err(ReconError::KindMismatch { .. })));
    }

    #[test]
    fn dropped_rows_fold_into_skipped() {
        let mut a = NormalizedBatch::new(vec![charge(Origin::A, at(1, 18, 0, 0), 10.0)]);
        a.dropped = 2;
        let parts = partition(RecordKind::Charge, Ok(a), Ok(NormalizedBatch::default()), PartitionUnit::Car);
        let out = run(RecordKind::Charge, &parts, &ToleranceConfig::default(), RunOptions::default()).unwrap();
        assert_eq!(out.stats.dropped, 2);
        assert_eq!(out.stats.skipped, 2);
        assert_eq!(out.stats.added, 1);
    }

    #[derive(Default)]
    struct RecordingSink {
        calls: Vec<(RecordKind, usize, usize)>,
    }

    impl MergeSink for RecordingSink {
        fn commit(
            &mut self,
            kind: RecordKind,
            merged: &[MergedRecord],
            new_records: &[NormalizedRecord],
        ) -> Result<usize, ReconError> {
            self.calls.push((kind, merged.len(), new_records.len()));
            Ok(merged.len() + new_records.len())
        }
    }

    #[test]
    fn commit_respects_dry_run() {
        let parts = partition(
            RecordKind::Charge,
            Ok(NormalizedBatch::new(vec![
                charge(Origin::A, at(1, 18, 0, 0), 10.2),
                charge(Origin::A, at(2, 18, 0, 0), 7.0),
            ])),
            Ok(NormalizedBatch::new(vec![charge(Origin::B, at(1, 18, 1, 0), 10.2)])),
            PartitionUnit::Car,
        );
        let tol = ToleranceConfig::default();

        let mut sink = RecordingSink::default();
        let dry = run(RecordKind::Charge, &parts, &tol, RunOptions { dry_run: true, workers: 0 }).unwrap();
        assert_eq!(commit(&dry, &mut sink).unwrap(), 0);
        assert!(sink.calls.is_empty());

        let live = run(RecordKind::Charge, &parts, &tol, RunOptions { dry_run: false, workers: 0 }).unwrap();
        assert_eq!(commit(&live, &mut sink).unwrap(), 2);
        assert_eq!(sink.calls, vec![(RecordKind::Charge, 1, 1)]);

        // Same core results either way.
        assert_eq!(dry.stats, live.stats);
        assert_eq!(dry.merged, live.merged);
    }

    fn config(extra: &str) -> SyncConfig {
        let toml = format!(
            r#"
name = "unit"
{extra}

[sources.a]
name = "teslalogger"
schema = "teslalogger"

[sources.b]
name = "teslamate"
schema = "teslamate"

[kinds.position]
a = "a.csv"
b = "b.csv"

[kinds.charging]
a = "a.csv"
b = "b.csv"
"#
        );
        SyncConfig::from_toml(&toml).unwrap()
    }

    #[test]
    fn sync_runs_kinds_in_order_and_limits_positions() {
        let config = config("position_limit = 2");
        let mut inputs = HashMap::new();
        inputs.insert(
            RecordKind::Charge,
            KindInput::new(
                Ok(NormalizedBatch::new(vec![charge(Origin::A, at(1, 18, 0, 0), 10.2)])),
                Ok(NormalizedBatch::new(vec![charge(Origin::B, at(1, 18, 1, 0), 10.2)])),
            ),
        );
        inputs.insert(
            RecordKind::Position,
            KindInput::new(
                Ok(NormalizedBatch::new(vec![
                    pos(Origin::A, "1", at(1, 12, 2, 0), 50.0),
                    pos(Origin::A, "1", at(1, 12, 0, 0), 50.0),
                    pos(Origin::A, "1", at(1, 12, 1, 0), 50.0),
                ])),
                Ok(NormalizedBatch::default()),
            ),
        );

        let report = sync(&config, inputs).unwrap();
        let kinds: Vec<_> = report.runs.iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![RecordKind::Position, RecordKind::Charge]);
        assert!(report.meta.dry_run);
        assert_eq!(report.meta.source_a, "teslalogger");

        let positions = report.run(RecordKind::Position).unwrap();
        assert_eq!(positions.stats.added, 2);
        assert_eq!(positions.unmatched_a[0].time_key(), at(1, 12, 0, 0));
        assert_eq!(report.run(RecordKind::Charge).unwrap().stats.merged, 1);
    }

    #[test]
    fn sync_reports_missing_inputs_as_skipped() {
        let report = sync(&config(""), HashMap::new()).unwrap();
        assert_eq!(report.runs.len(), 2);
        assert_eq!(report.skipped_partition_count(), 2);
    }
}
