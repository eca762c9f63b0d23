//! `--commit-dir` target: one pretty JSON file per kind.

use std::path::PathBuf;

use serde::Serialize;
use telesync_recon::model::{MergedRecord, NormalizedRecord, RecordKind};
use telesync_recon::{MergeSink, ReconError};

pub struct JsonDirSink {
    dir: PathBuf,
}

#[derive(Serialize)]
struct CommitFile<'a> {
    kind: RecordKind,
    merged: &'a [MergedRecord],
    new_records: &'a [NormalizedRecord],
}

impl JsonDirSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, kind: RecordKind) -> PathBuf {
        self.dir.join(format!("{kind}.json"))
    }

    fn ensure_dir(&self) -> Result<(), ReconError> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| ReconError::Sink(format!("cannot create {}: {e}", self.dir.display())))
    }
}

impl MergeSink for JsonDirSink {
    fn commit(
        &mut self,
        kind: RecordKind,
        merged: &[MergedRecord],
        new_records: &[NormalizedRecord],
    ) -> Result<usize, ReconError> {
        self.ensure_dir()?;
        let path = self.path_for(kind);
        let body = serde_json::to_string_pretty(&CommitFile {
            kind,
            merged,
            new_records,
        })
        .map_err(|e| ReconError::Sink(format!("JSON serialization error: {e}")))?;
        std::fs::write(&path, body)
            .map_err(|e| ReconError::Sink(format!("cannot write {}: {e}", path.display())))?;
        Ok(merged.len() + new_records.len())
    }
}
