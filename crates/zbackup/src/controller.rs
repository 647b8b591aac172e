//! One backup run, end to end.
//!
//! Source check, manifest copy, marker creation and rotation, then the
//! nearline target and, when due, the archive target. The archive run reuses
//! the marker created for the nearline run and is skipped entirely if the
//! nearline run fails.

use std::sync::Arc;

use chrono::{Datelike, NaiveDateTime};
use tracing::{error, info, warn};

use crate::backend::StorageBackend;
use crate::config::BackupConfig;
use crate::error::{BackupError, BackupResult};
use crate::manifest::ManifestSync;
use crate::marker::{Marker, Target};
use crate::mode::RunOptions;
use crate::planner::ReplicationPlanner;
use crate::snapshot::{format_label, RotationReport, SnapshotManager};
use crate::transfer::{RunStage, TransferExecutor, TransferReport, TransferSpec};

/// Whether the archive target runs on `day` of the month.
pub fn archive_due(day: u32, archive_day: u32, force: bool) -> bool {
    force || day == archive_day
}

/// Parameters of a single invocation.
#[derive(Debug, Clone, Copy)]
pub struct RunRequest {
    /// Local wall-clock time the labels are derived from.
    pub now: NaiveDateTime,
    /// Run the archive target regardless of the day of month.
    pub force_archive: bool,
}

/// What a run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Marker created for this run.
    pub marker: Marker,
    /// Local retention outcome.
    pub rotation: RotationReport,
    /// Manifest copy outcome; `None` when not configured.
    pub manifests_copied: Option<bool>,
    /// Nearline target outcome.
    pub nearline: TransferReport,
    /// Archive target outcome, when it ran.
    pub archive: Option<TransferReport>,
}

/// Sequences the stages of a run over the three backends.
pub struct RunController {
    config: BackupConfig,
    options: RunOptions,
    local: Arc<dyn StorageBackend>,
    nearline: Arc<dyn StorageBackend>,
    archive: Arc<dyn StorageBackend>,
    manifests: Option<ManifestSync>,
}

impl RunController {
    /// Controller for `config`, with one backend per location.
    pub fn new(
        config: BackupConfig,
        options: RunOptions,
        local: Arc<dyn StorageBackend>,
        nearline: Arc<dyn StorageBackend>,
        archive: Arc<dyn StorageBackend>,
    ) -> Self {
        let manifests = config.manifests.clone().map(|manifests| {
            ManifestSync::new(manifests, config.nearline.target(), config.ssh.clone())
        });
        Self {
            config,
            options,
            local,
            nearline,
            archive,
            manifests,
        }
    }

    /// Replace the manifest copier (tests use a stand-in rsync).
    pub fn with_manifests(mut self, manifests: Option<ManifestSync>) -> Self {
        self.manifests = manifests;
        self
    }

    /// Execute every stage. The first fatal error aborts the run.
    pub async fn run(&self, request: RunRequest) -> BackupResult<RunReport> {
        let dataset = self.config.dataset.as_str();
        self.ensure_source(dataset).await?;

        let manifests_copied = match &self.manifests {
            Some(sync) => match sync.sync(&self.options).await {
                Ok(()) => Some(true),
                Err(e) => {
                    warn!("manifest copy failed: {}", e);
                    Some(false)
                }
            },
            None => None,
        };

        let label = format_label(&self.config.marker_label_format, &request.now)?;
        let snapshots = SnapshotManager::new(Arc::clone(&self.local), self.options);
        let marker = snapshots.create_marker(dataset, &label).await?;
        info!(stage = %RunStage::SnapshotCreated, "marker {}", marker.name());
        let rotation = snapshots.rotate(dataset, self.config.keep_markers).await?;

        let nearline = self
            .replicate(
                &marker,
                Arc::clone(&self.nearline),
                &self.config.nearline.target(),
                None,
            )
            .await
            .map_err(|e| {
                error!(remote = e.is_remote(), "nearline run failed: {}", e);
                e
            })?;

        let archive = if archive_due(request.now.day(), self.config.archive_day, request.force_archive) {
            let rename = format_label(&self.config.archive_label_format, &request.now)?;
            let report = self
                .replicate(
                    &marker,
                    Arc::clone(&self.archive),
                    &self.config.archive.target(),
                    Some(rename),
                )
                .await
                .map_err(|e| {
                    error!(remote = e.is_remote(), "archive run failed: {}", e);
                    e
                })?;
            Some(report)
        } else {
            info!(
                day = request.now.day(),
                archive_day = self.config.archive_day,
                "archive run not due"
            );
            None
        };

        Ok(RunReport {
            marker,
            rotation,
            manifests_copied,
            nearline,
            archive,
        })
    }

    async fn ensure_source(&self, dataset: &str) -> BackupResult<()> {
        match self.local.dataset_exists(dataset).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                error!("source dataset {} does not exist", dataset);
                Err(BackupError::SourceUnreachable {
                    dataset: dataset.to_string(),
                })
            }
            Err(e) => {
                error!("cannot query source dataset {}: {}", dataset, e);
                Err(BackupError::SourceUnreachable {
                    dataset: dataset.to_string(),
                })
            }
        }
    }

    async fn replicate(
        &self,
        marker: &Marker,
        remote: Arc<dyn StorageBackend>,
        target: &Target,
        rename_to: Option<String>,
    ) -> BackupResult<TransferReport> {
        info!(replica = %target, "replicating {}", marker.name());
        let planner = ReplicationPlanner::new(
            Arc::clone(&self.local),
            Arc::clone(&remote),
            self.options.verbose,
        );
        let plan = planner.plan(&marker.dataset, &target.dataset).await?;
        let spec = TransferSpec::plan(&marker.dataset, &marker.label, &plan, target, rename_to);
        let executor = TransferExecutor::new(
            Arc::clone(&self.local),
            remote,
            self.config.transfer.clone(),
            self.options,
        );
        let report = executor.execute(&spec).await?;
        info!(
            replica = %target,
            stage = %report.stage,
            bytes = report.bytes,
            discarded = report.discarded.len(),
            "target up to date"
        );
        Ok(report)
    }
}
