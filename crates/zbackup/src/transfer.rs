//! Transfer execution: remote cleanup, the streaming pipeline and the
//! optional archival rename.
//!
//! The pipeline is `send -> [progress] -> bounded buffer + rate limit ->
//! receive`. The buffer is a bounded channel of chunks, so a slow receiver
//! blocks the sender instead of dropping data. A transfer is not resumable
//! mid-stream; the next run's reconciliation decides where to restart.

use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::backend::{Mutation, ReceiveSink, SendSpec, SendStream, StorageBackend};
use crate::config::TransferConfig;
use crate::error::{BackupError, BackupResult};
use crate::marker::Target;
use crate::mode::RunOptions;
use crate::planner::ReplicationPlan;
use crate::progress::{format_bytes, ProgressMeter};
use crate::throttle::RateLimiter;

/// Stage a target run has reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunStage {
    /// Nothing done yet.
    Idle,
    /// The local marker exists.
    SnapshotCreated,
    /// Reconciliation finished.
    PlanComputed,
    /// Remote markers ahead of the base were discarded.
    RemoteCleaned,
    /// The stream was applied on the remote.
    Transferred,
    /// The applied marker was renamed to its archival label.
    Renamed,
    /// All stages completed.
    Done,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStage::Idle => "idle",
            RunStage::SnapshotCreated => "snapshot-created",
            RunStage::PlanComputed => "plan-computed",
            RunStage::RemoteCleaned => "remote-cleaned",
            RunStage::Transferred => "transferred",
            RunStage::Renamed => "renamed",
            RunStage::Done => "done",
        };
        f.write_str(name)
    }
}

/// Everything needed to bring one target up to date with a new marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSpec {
    /// What to send.
    pub send: SendSpec,
    /// Where to apply it.
    pub target: Target,
    /// Create the target's parent datasets first (full transfers).
    pub ensure_parent: bool,
    /// Remote labels to destroy before the transfer, newest first.
    pub discard: Vec<String>,
    /// Archival label for the applied marker.
    pub rename_to: Option<String>,
}

impl TransferSpec {
    /// Incremental from `plan.base` when present, otherwise a full transfer.
    pub fn plan(
        source_dataset: &str,
        marker_label: &str,
        plan: &ReplicationPlan,
        target: &Target,
        rename_to: Option<String>,
    ) -> Self {
        let base = plan.base.as_ref().map(|b| b.label.clone());
        Self {
            ensure_parent: base.is_none(),
            send: SendSpec {
                dataset: source_dataset.to_string(),
                label: marker_label.to_string(),
                base,
            },
            target: target.clone(),
            discard: plan.discard.clone(),
            rename_to,
        }
    }

    /// Whether only the delta since the base is sent.
    pub fn is_incremental(&self) -> bool {
        self.send.base.is_some()
    }
}

/// Outcome of one target run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    /// Last stage reached.
    pub stage: RunStage,
    /// Whether the transfer was incremental.
    pub incremental: bool,
    /// Stream bytes delivered to the receiver.
    pub bytes: u64,
    /// Remote labels destroyed before the transfer.
    pub discarded: Vec<String>,
    /// Remote labels that could not be destroyed.
    pub discard_failures: Vec<String>,
    /// Archival label applied, if any.
    pub renamed_to: Option<String>,
}

/// Runs a [`TransferSpec`] from `source` to `target`.
pub struct TransferExecutor {
    source: Arc<dyn StorageBackend>,
    target: Arc<dyn StorageBackend>,
    config: TransferConfig,
    options: RunOptions,
}

impl TransferExecutor {
    /// Executor for `source` → `target`.
    pub fn new(
        source: Arc<dyn StorageBackend>,
        target: Arc<dyn StorageBackend>,
        config: TransferConfig,
        options: RunOptions,
    ) -> Self {
        Self {
            source,
            target,
            config,
            options,
        }
    }

    /// Discard, transfer and rename. Only discard failures are tolerated.
    pub async fn execute(&self, spec: &TransferSpec) -> BackupResult<TransferReport> {
        let mut report = TransferReport {
            stage: RunStage::PlanComputed,
            incremental: spec.is_incremental(),
            bytes: 0,
            discarded: Vec::new(),
            discard_failures: Vec::new(),
            renamed_to: None,
        };
        let dataset = spec.target.dataset.as_str();

        if !spec.discard.is_empty() {
            self.discard(spec, &mut report).await;
            report.stage = RunStage::RemoteCleaned;
            debug!(stage = %report.stage, replica = %spec.target);
        }

        if !spec.is_incremental() {
            self.refuse_foreign_history(dataset, &report).await?;
        }

        if spec.ensure_parent {
            if self.options.is_dry_run() {
                self.options
                    .trace(&self.target.preview(&Mutation::EnsureParent { dataset }));
            } else {
                self.target.ensure_parent(dataset).await?;
            }
        }

        info!(
            replica = %spec.target,
            incremental = spec.is_incremental(),
            base = spec.send.base.as_deref().unwrap_or("-"),
            "transferring {}@{}",
            spec.send.dataset,
            spec.send.label
        );
        if self.options.is_dry_run() {
            self.options.trace(&format!(
                "{} | buffer({}) | {}",
                self.source.preview(&Mutation::Send(&spec.send)),
                self.describe_buffer(),
                self.target.preview(&Mutation::Receive { dataset })
            ));
        } else {
            report.bytes = self.transfer(spec).await?;
            info!(bytes = report.bytes, "applied on {}", spec.target);
        }
        report.stage = RunStage::Transferred;

        if let Some(archive_label) = &spec.rename_to {
            let op = Mutation::RenameMarker {
                dataset,
                from: &spec.send.label,
                to: archive_label,
            };
            if self.options.is_dry_run() {
                self.options.trace(&self.target.preview(&op));
            } else {
                self.target
                    .rename_marker(dataset, &spec.send.label, archive_label)
                    .await?;
                info!("renamed {}@{} to {}", dataset, spec.send.label, archive_label);
            }
            report.renamed_to = Some(archive_label.clone());
            report.stage = RunStage::Renamed;
        }

        report.stage = RunStage::Done;
        Ok(report)
    }

    async fn discard(&self, spec: &TransferSpec, report: &mut TransferReport) {
        let dataset = spec.target.dataset.as_str();
        for label in &spec.discard {
            if self.options.is_dry_run() {
                self.options.trace(&self.target.preview(&Mutation::DestroyMarker {
                    dataset,
                    label,
                    recursive: true,
                }));
                report.discarded.push(label.clone());
                continue;
            }
            match self.target.destroy_marker(dataset, label, true).await {
                Ok(()) => {
                    info!("discarded remote {}@{}", dataset, label);
                    report.discarded.push(label.clone());
                }
                Err(e) => {
                    warn!("could not discard remote {}@{}: {}", dataset, label, e);
                    report.discard_failures.push(label.clone());
                }
            }
        }
    }

    /// A full stream may only land on a missing or marker-free dataset.
    /// Labels already discarded (or, in a dry run, about to be) don't count.
    async fn refuse_foreign_history(&self, dataset: &str, report: &TransferReport) -> BackupResult<()> {
        if !self.target.dataset_exists(dataset).await? {
            return Ok(());
        }
        let markers = self
            .target
            .list_markers(dataset)
            .await?
            .into_iter()
            .filter(|m| !report.discarded.contains(&m.label))
            .count();
        if markers > 0 {
            error!(
                replica = %self.target.location(),
                markers,
                "{} holds history unrelated to the source, not overwriting it",
                dataset
            );
            return Err(BackupError::ForeignHistory {
                dataset: dataset.to_string(),
                markers,
            });
        }
        Ok(())
    }

    fn describe_buffer(&self) -> String {
        let limit = match self.config.max_bytes_per_sec {
            0 => "unlimited".to_string(),
            n => format!("{}/s", format_bytes(n)),
        };
        format!("{}, {}", format_bytes(self.config.buffer_bytes as u64), limit)
    }

    async fn transfer(&self, spec: &TransferSpec) -> BackupResult<u64> {
        let progress = if self.options.interactive {
            let total = match self.source.estimate_send_size(&spec.send).await {
                Ok(size) => {
                    info!("estimated stream size {}", format_bytes(size));
                    Some(size)
                }
                Err(e) => {
                    warn!("size estimate failed: {}", e);
                    None
                }
            };
            Some(ProgressMeter::new(total))
        } else {
            None
        };

        let send = self.source.send_stream(&spec.send).await?;
        let sink = self.target.receive_stream(&spec.target.dataset).await?;
        run_pipeline(send, sink, &self.config, progress).await
    }
}

/// Stream `send` into `sink` through the bounded, rate-limited buffer.
/// Returns the number of bytes delivered.
pub async fn run_pipeline(
    send: SendStream,
    sink: ReceiveSink,
    config: &TransferConfig,
    mut progress: Option<ProgressMeter>,
) -> BackupResult<u64> {
    let chunk_bytes = config.chunk_bytes.max(1);
    let slots = (config.buffer_bytes / chunk_bytes).max(1);
    let (tx, mut rx) = mpsc::channel::<Bytes>(slots);
    let mut limiter = RateLimiter::new(&config.throttle());

    let SendStream {
        mut reader,
        completion: send_done,
    } = send;
    let ReceiveSink {
        mut writer,
        completion: receive_done,
    } = sink;

    let producer = async move {
        let mut total = 0u64;
        loop {
            let mut buf = BytesMut::with_capacity(chunk_bytes);
            let n = reader.read_buf(&mut buf).await?;
            if n == 0 {
                break;
            }
            total += n as u64;
            if let Some(meter) = progress.as_mut() {
                meter.advance(n as u64);
            }
            if tx.send(buf.freeze()).await.is_err() {
                return Err(BackupError::Transfer {
                    msg: "receiver stopped accepting data".to_string(),
                });
            }
        }
        if let Some(meter) = progress.as_mut() {
            meter.finish();
        }
        Ok::<u64, BackupError>(total)
    };

    let consumer = async move {
        let mut written = 0u64;
        while let Some(chunk) = rx.recv().await {
            limiter.acquire(chunk.len() as u64).await;
            writer.write_all(&chunk).await?;
            written += chunk.len() as u64;
            trace!(written, "chunk delivered");
        }
        writer.shutdown().await?;
        drop(writer);
        if limiter.is_limited() {
            debug!(stalls = limiter.stalls(), "rate limit stalls");
        }
        Ok::<u64, BackupError>(written)
    };

    let (produced, consumed, sent, received) =
        tokio::join!(producer, consumer, send_done, receive_done);

    // The receiver's verdict explains most failures. When the sender failed
    // too, its stderr is usually the real cause (a missing base, say).
    match (received, sent) {
        (Err(received), Err(sent)) => {
            return Err(BackupError::Transfer {
                msg: format!("{}; sender: {}", received, sent),
            })
        }
        (Err(received), Ok(())) => return Err(received),
        (Ok(()), sent) => sent?,
    }
    let written = consumed?;
    let read = produced?;
    if read != written {
        return Err(BackupError::Transfer {
            msg: format!("read {} bytes but delivered {}", read, written),
        });
    }
    Ok(written)
}
