//! `telesync-recon` — reconciliation engine for two vehicle telemetry sources.
//!
//! Pure engine crate: receives normalized records per kind, matches them
//! within per-kind tolerances, merges matched pairs and reports what each
//! side would gain. Reading exports and writing results belong to callers.

pub mod config;
pub mod engine;
pub mod error;
pub mod geo;
pub mod matcher;
pub mod merge;
pub mod model;
pub mod normalize;
pub mod partition;
pub mod stats;

pub use config::{ConfigOverrides, PartitionUnit, SyncConfig, ToleranceConfig};
pub use engine::{commit, log_potential_merges, run, sync, KindInput, MergeSink, RunOptions};
pub use error::ReconError;
pub use matcher::match_records;
pub use merge::merge;
pub use model::{
    Confidence, MatchDecision, MergedRecord, NormalizedBatch, NormalizedRecord, Origin, RecordKind,
    RunOutput, SyncReport,
};
pub use normalize::{normalize, normalize_batch, normalize_csv, SourceDialect};
pub use partition::{partition, Partition, Partitions, SourceBatch};
pub use stats::RunStats;
