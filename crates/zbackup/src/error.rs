//! Error types for the backup subsystem.

use thiserror::Error;

/// Result type alias for backup operations.
pub type BackupResult<T> = Result<T, BackupError>;

/// Errors that can occur while snapshotting, planning or transferring.
#[derive(Debug, Error)]
pub enum BackupError {
    /// The source dataset cannot be queried.
    #[error("source dataset unreachable: {dataset}")]
    SourceUnreachable {
        /// The dataset that could not be listed.
        dataset: String,
    },

    /// A dataset the operation needs does not exist.
    #[error("dataset not found: {dataset}")]
    DatasetNotFound {
        /// The missing dataset.
        dataset: String,
    },

    /// A marker with the requested label already exists.
    #[error("marker already exists: {dataset}@{label}")]
    AlreadyExists {
        /// Dataset holding the marker.
        dataset: String,
        /// The colliding label.
        label: String,
    },

    /// The named marker or reference does not exist.
    #[error("marker not found: {name}")]
    MarkerNotFound {
        /// Full `dataset@label` or `dataset#label` name.
        name: String,
    },

    /// A marker exists without a matching durable reference.
    #[error("inconsistent marker/reference pair for {dataset}@{label}: {msg}")]
    InconsistentReference {
        /// Dataset holding the marker.
        dataset: String,
        /// Label shared by the marker and its reference.
        label: String,
        /// What went wrong.
        msg: String,
    },

    /// An incremental stream names a base the receiver does not have.
    #[error("incremental base guid {guid} not present on {dataset}")]
    IncrementalBaseMissing {
        /// Receiving dataset.
        dataset: String,
        /// Base guid carried by the stream.
        guid: String,
    },

    /// Renaming a remote marker would overwrite an existing one.
    #[error("rename collision on {dataset}: {from} -> {to} (target label exists)")]
    RenameCollision {
        /// Dataset holding the marker.
        dataset: String,
        /// Current label.
        from: String,
        /// Requested label.
        to: String,
    },

    /// A full stream would overwrite remote markers that share no history
    /// with the source.
    #[error("refusing full transfer into {dataset}: {markers} unrelated marker(s) present")]
    ForeignHistory {
        /// Receiving dataset.
        dataset: String,
        /// Number of remote markers in the way.
        markers: usize,
    },

    /// An external command exited unsuccessfully.
    #[error("{location}: `{command}` failed ({status}): {stderr}")]
    CommandFailed {
        /// Where the command ran (`local` or `user@host`).
        location: String,
        /// The rendered command line.
        command: String,
        /// Exit status description.
        status: String,
        /// Captured standard error.
        stderr: String,
    },

    /// The streaming transfer pipeline failed.
    #[error("transfer failed: {msg}")]
    Transfer {
        /// Error message describing the failure.
        msg: String,
    },

    /// Command output could not be parsed.
    #[error("parse error: {msg}")]
    Parse {
        /// Error message describing the malformed input.
        msg: String,
    },

    /// Configuration is invalid.
    #[error("invalid configuration: {msg}")]
    Config {
        /// Error message describing the problem.
        msg: String,
    },

    /// Memory stream payload could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The run was cancelled by a signal.
    #[error("run cancelled")]
    Cancelled,
}

impl BackupError {
    /// Whether this error came from a command run on a remote host.
    pub fn is_remote(&self) -> bool {
        matches!(self, BackupError::CommandFailed { location, .. } if location != "local")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_failed_remote_detection() {
        let local = BackupError::CommandFailed {
            location: "local".into(),
            command: "zfs list".into(),
            status: "exit status: 1".into(),
            stderr: "no such dataset".into(),
        };
        let remote = BackupError::CommandFailed {
            location: "root@backup".into(),
            command: "zfs list".into(),
            status: "exit status: 255".into(),
            stderr: "connection refused".into(),
        };
        assert!(!local.is_remote());
        assert!(remote.is_remote());
        assert!(!BackupError::Cancelled.is_remote());
    }

    #[test]
    fn test_display_messages() {
        let err = BackupError::RenameCollision {
            dataset: "archive/data".into(),
            from: "2026-10-01_00.00.00.000".into(),
            to: "2026-10".into(),
        };
        assert_eq!(
            err.to_string(),
            "rename collision on archive/data: 2026-10-01_00.00.00.000 -> 2026-10 (target label exists)"
        );
    }
}
