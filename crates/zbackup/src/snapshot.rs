//! Marker creation and local retention.
//!
//! Every marker is paired with a durable reference of the same label right
//! after creation. Rotation destroys old markers only; references are kept
//! forever, so an incremental base survives local retention.

use std::fmt::Write;
use std::sync::Arc;

use chrono::NaiveDateTime;
use tracing::{debug, error, info, warn};

use crate::backend::{Mutation, StorageBackend};
use crate::error::{BackupError, BackupResult};
use crate::marker::{Guid, Marker};
use crate::mode::RunOptions;

/// Format a marker label from a local timestamp (`chrono` strftime syntax).
pub fn format_label(format: &str, now: &NaiveDateTime) -> BackupResult<String> {
    let mut label = String::new();
    write!(label, "{}", now.format(format)).map_err(|_| BackupError::Config {
        msg: format!("invalid label format: {}", format),
    })?;
    if label.is_empty() || label.contains(['@', '#', '/']) || label.contains(char::is_whitespace) {
        return Err(BackupError::Config {
            msg: format!("label format {:?} produces unusable label {:?}", format, label),
        });
    }
    Ok(label)
}

/// Outcome of a rotation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RotationReport {
    /// Labels destroyed, oldest first.
    pub destroyed: Vec<String>,
    /// Labels that could not be destroyed.
    pub failed: Vec<String>,
    /// Markers remaining after rotation.
    pub kept: usize,
}

/// Creates markers with their durable references and enforces retention.
pub struct SnapshotManager {
    backend: Arc<dyn StorageBackend>,
    options: RunOptions,
}

impl SnapshotManager {
    /// Manager operating on `backend`.
    pub fn new(backend: Arc<dyn StorageBackend>, options: RunOptions) -> Self {
        Self { backend, options }
    }

    /// Create `dataset@label` and `dataset#label`.
    ///
    /// A label collision fails with [`BackupError::AlreadyExists`]. If the
    /// reference cannot be created, or does not carry the marker's guid,
    /// the pair is inconsistent and the error is fatal. In a dry run the
    /// commands are printed and a marker with guid 0 is returned.
    pub async fn create_marker(&self, dataset: &str, label: &str) -> BackupResult<Marker> {
        let existing = self.backend.list_markers(dataset).await?;
        if existing.iter().any(|m| m.label == label) {
            return Err(BackupError::AlreadyExists {
                dataset: dataset.to_string(),
                label: label.to_string(),
            });
        }

        if self.options.is_dry_run() {
            self.options
                .trace(&self.backend.preview(&Mutation::CreateMarker { dataset, label }));
            self.options
                .trace(&self.backend.preview(&Mutation::CreateReference { dataset, label }));
            let creation = existing.iter().map(|m| m.creation).max().unwrap_or(0) + 1;
            return Ok(Marker {
                dataset: dataset.to_string(),
                label: label.to_string(),
                guid: Guid(0),
                creation,
            });
        }

        let marker = self.backend.create_marker(dataset, label).await?;
        info!(guid = %marker.guid, "created marker {}", marker.name());

        match self.backend.create_reference(&marker).await {
            Ok(reference) if reference.guid == marker.guid => {
                info!("created reference {}", reference.name());
                Ok(marker)
            }
            Ok(reference) => {
                error!(
                    marker_guid = %marker.guid,
                    reference_guid = %reference.guid,
                    "reference guid does not match marker"
                );
                Err(BackupError::InconsistentReference {
                    dataset: dataset.to_string(),
                    label: label.to_string(),
                    msg: format!(
                        "reference guid {} != marker guid {}",
                        reference.guid, marker.guid
                    ),
                })
            }
            Err(e) => {
                error!("reference creation failed after marker {}: {}", marker.name(), e);
                Err(BackupError::InconsistentReference {
                    dataset: dataset.to_string(),
                    label: label.to_string(),
                    msg: e.to_string(),
                })
            }
        }
    }

    /// Destroy the oldest markers so at most `keep` remain.
    ///
    /// `keep` is clamped to 1: the newest marker is never destroyed.
    /// References are untouched. A failed destroy is logged and reported;
    /// rerunning converges.
    pub async fn rotate(&self, dataset: &str, keep: usize) -> BackupResult<RotationReport> {
        let keep = keep.max(1);
        let mut markers = self.backend.list_markers(dataset).await?;
        markers.sort_by_key(|m| m.creation);

        let mut report = RotationReport {
            kept: markers.len(),
            ..Default::default()
        };
        if markers.len() <= keep {
            debug!(count = markers.len(), keep, "nothing to rotate on {}", dataset);
            return Ok(report);
        }

        let excess = markers.len() - keep;
        for marker in &markers[..excess] {
            let op = Mutation::DestroyMarker {
                dataset,
                label: &marker.label,
                recursive: false,
            };
            if self.options.is_dry_run() {
                self.options.trace(&self.backend.preview(&op));
                report.destroyed.push(marker.label.clone());
                continue;
            }
            match self.backend.destroy_marker(dataset, &marker.label, false).await {
                Ok(()) => {
                    info!("rotated out {}", marker.name());
                    report.destroyed.push(marker.label.clone());
                }
                Err(e) => {
                    warn!("failed to destroy {}: {}", marker.name(), e);
                    report.failed.push(marker.label.clone());
                }
            }
        }
        report.kept = markers.len() - report.destroyed.len();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Fault, MemoryBackend};
    use crate::mode::ExecMode;
    use chrono::NaiveDate;

    fn manager(mem: &MemoryBackend) -> SnapshotManager {
        SnapshotManager::new(Arc::new(mem.clone()), RunOptions::execute())
    }

    #[test]
    fn test_format_label() {
        let now = NaiveDate::from_ymd_opt(2026, 10, 1)
            .unwrap()
            .and_hms_milli_opt(3, 4, 5, 67)
            .unwrap();
        assert_eq!(
            format_label("%Y-%m-%d_%H.%M.%S%.3f", &now).unwrap(),
            "2026-10-01_03.04.05.067"
        );
        assert_eq!(format_label("%Y-%m", &now).unwrap(), "2026-10");
        assert!(format_label("%Q", &now).is_err());
        assert!(format_label("%Y/%m", &now).is_err());
        assert!(format_label("%Y %m", &now).is_err());
    }

    #[tokio::test]
    async fn test_create_marker_pairs_reference() {
        let mem = MemoryBackend::new("local");
        mem.add_dataset("tank/data");
        let marker = manager(&mem).create_marker("tank/data", "a").await.unwrap();
        let refs = mem.list_references("tank/data").await.unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].guid, marker.guid);
        assert_eq!(refs[0].label, "a");
    }

    #[tokio::test]
    async fn test_create_marker_collision() {
        let mem = MemoryBackend::new("local");
        mem.add_dataset("tank/data");
        let mgr = manager(&mem);
        mgr.create_marker("tank/data", "a").await.unwrap();
        let err = mgr.create_marker("tank/data", "a").await.unwrap_err();
        assert!(matches!(err, BackupError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_reference_failure_is_inconsistent() {
        let mem = MemoryBackend::new("local");
        mem.add_dataset("tank/data");
        mem.inject(Fault::CreateReference);
        let err = manager(&mem).create_marker("tank/data", "a").await.unwrap_err();
        assert!(matches!(err, BackupError::InconsistentReference { .. }));
        assert_eq!(mem.marker_labels("tank/data"), vec!["a"]);
        assert!(mem.reference_labels("tank/data").is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_creates_nothing() {
        let mem = MemoryBackend::new("local");
        mem.add_dataset("tank/data");
        let options = RunOptions {
            mode: ExecMode::DryRun,
            ..Default::default()
        };
        let mgr = SnapshotManager::new(Arc::new(mem.clone()), options);
        let marker = mgr.create_marker("tank/data", "a").await.unwrap();
        assert_eq!(marker.guid, Guid(0));
        assert!(mem.marker_labels("tank/data").is_empty());
    }

    #[tokio::test]
    async fn test_rotate_keeps_newest_and_references() {
        let mem = MemoryBackend::new("local");
        mem.add_dataset("tank/data");
        let mgr = manager(&mem);
        for label in ["a", "b", "c", "d", "e"] {
            mgr.create_marker("tank/data", label).await.unwrap();
        }
        let report = mgr.rotate("tank/data", 2).await.unwrap();
        assert_eq!(report.destroyed, vec!["a", "b", "c"]);
        assert_eq!(report.kept, 2);
        assert_eq!(mem.marker_labels("tank/data"), vec!["d", "e"]);
        assert_eq!(mem.reference_labels("tank/data").len(), 5);

        let again = mgr.rotate("tank/data", 2).await.unwrap();
        assert!(again.destroyed.is_empty());
        assert_eq!(mem.marker_labels("tank/data"), vec!["d", "e"]);
    }

    #[tokio::test]
    async fn test_rotate_zero_keeps_newest() {
        let mem = MemoryBackend::new("local");
        mem.add_dataset("tank/data");
        let mgr = manager(&mem);
        mgr.create_marker("tank/data", "a").await.unwrap();
        mgr.create_marker("tank/data", "b").await.unwrap();
        mgr.rotate("tank/data", 0).await.unwrap();
        assert_eq!(mem.marker_labels("tank/data"), vec!["b"]);
    }

    #[tokio::test]
    async fn test_rotate_failure_is_reported() {
        let mem = MemoryBackend::new("local");
        mem.add_dataset("tank/data");
        let mgr = manager(&mem);
        for label in ["a", "b", "c"] {
            mgr.create_marker("tank/data", label).await.unwrap();
        }
        mem.inject(Fault::Destroy("a".into()));
        let report = mgr.rotate("tank/data", 1).await.unwrap();
        assert_eq!(report.destroyed, vec!["b"]);
        assert_eq!(report.failed, vec!["a"]);
        assert_eq!(report.kept, 2);
    }
}
