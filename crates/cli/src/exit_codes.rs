//! CLI Exit Code Registry
//!
//! Single source of truth for `telesync` exit codes. Cron jobs and wrapper
//! scripts branch on these, so treat them as a contract.
//!
//! | Code | Meaning                                                       |
//! |------|---------------------------------------------------------------|
//! | 0    | Success                                                       |
//! | 2    | CLI usage error (bad args; emitted by clap)                   |
//! | 3    | Invalid config (parse or validation failure)                  |
//! | 4    | Runtime failure (unreadable config, contract violation, sink) |
//! | 5    | Sync completed but some partitions were skipped               |

use telesync_recon::ReconError;

/// Success - every enabled kind was reconciled.
pub const EXIT_SUCCESS: u8 = 0;

/// Usage error - bad arguments. clap exits with this code on its own.
#[allow(dead_code)]
pub const EXIT_USAGE: u8 = 2;

/// Config file failed to parse or validate. Nothing was matched.
pub const EXIT_INVALID_CONFIG: u8 = 3;

/// Sync stopped: I/O on the config, a contract violation, or a failed commit.
pub const EXIT_RUNTIME: u8 = 4;

/// Sync finished, but at least one partition had a source unavailable.
/// The report covers every other partition.
pub const EXIT_SKIPPED_PARTITIONS: u8 = 5;

/// Map a fatal engine error onto the registry.
pub fn exit_code_for(err: &ReconError) -> u8 {
    match err {
        ReconError::ConfigParse(_) | ReconError::Configuration(_) => EXIT_INVALID_CONFIG,
        _ => EXIT_RUNTIME,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telesync_recon::model::RecordKind;

    #[test]
    fn config_errors_map_to_invalid_config() {
        assert_eq!(exit_code_for(&ReconError::ConfigParse("x".into())), EXIT_INVALID_CONFIG);
        assert_eq!(exit_code_for(&ReconError::Configuration("x".into())), EXIT_INVALID_CONFIG);
    }

    #[test]
    fn everything_else_is_runtime() {
        let err = ReconError::KindMismatch {
            expected: RecordKind::Drive,
            found: RecordKind::State,
        };
        assert_eq!(exit_code_for(&err), EXIT_RUNTIME);
        assert_eq!(exit_code_for(&ReconError::Sink("disk full".into())), EXIT_RUNTIME);
    }

    #[test]
    fn codes_are_distinct() {
        let codes = [EXIT_SUCCESS, EXIT_USAGE, EXIT_INVALID_CONFIG, EXIT_RUNTIME, EXIT_SKIPPED_PARTITIONS];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
