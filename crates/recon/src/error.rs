use std::fmt;

use crate::model::{Origin, RecordKind};

#[derive(Debug, Clone, PartialEq)]
pub enum ReconError {
    /// TOML parse / deserialization error.
    ConfigParse(String),
    /// Invalid tolerance or settings value. Fails the whole sync before matching.
    Configuration(String),
    /// One side's record collection could not be produced.
    SourceUnavailable {
        origin: Origin,
        kind: RecordKind,
        reason: String,
    },
    /// A raw row failed normalization and was dropped.
    MalformedRecord {
        origin: Origin,
        kind: RecordKind,
        reason: String,
    },
    /// A record of the wrong kind reached a kind-specific operation.
    KindMismatch { expected: RecordKind, found: RecordKind },
    /// CSV decode / IO error at the boundary.
    Io(String),
    /// Persistence collaborator rejected a commit.
    Sink(String),
}

impl ReconError {
    pub fn source_unavailable(origin: Origin, kind: RecordKind, reason: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            origin,
            kind,
            reason: reason.into(),
        }
    }

    pub fn malformed(origin: Origin, kind: RecordKind, reason: impl Into<String>) -> Self {
        Self::MalformedRecord {
            origin,
            kind,
            reason: reason.into(),
        }
    }

    /// Errors that stop the sync for every kind, not just one partition or row.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::SourceUnavailable { .. } | Self::MalformedRecord { .. })
    }
}

impl fmt::Display for ReconError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigParse(msg) => write!(f, "config parse error: {msg}"),
            Self::Configuration(msg) => write!(f, "configuration error: {msg}"),
            Self::SourceUnavailable { origin, kind, reason } => {
                write!(f, "source {origin} unavailable for {kind}: {reason}")
            }
            Self::MalformedRecord { origin, kind, reason } => {
                write!(f, "malformed {kind} row from source {origin}: {reason}")
            }
            Self::KindMismatch { expected, found } => {
                write!(f, "record kind mismatch: expected {expected}, found {found}")
            }
            Self::Io(msg) => write!(f, "IO error: {msg}"),
            Self::Sink(msg) => write!(f, "commit failed: {msg}"),
        }
    }
}

impl std::error::Error for ReconError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_side_and_kind() {
        let err = ReconError::source_unavailable(Origin::B, RecordKind::Drive, "connection refused");
        assert_eq!(err.to_string(), "source B unavailable for drive: connection refused");
        assert!(!err.is_fatal());
    }

    #[test]
    fn contract_violations_are_fatal() {
        let err = ReconError::KindMismatch {
            expected: RecordKind::Position,
            found: RecordKind::Charge,
        };
        assert!(err.is_fatal());
        assert!(err.to_string().contains("expected position, found charging"));
        assert!(ReconError::Configuration("negative window".into()).is_fatal());
    }
}
