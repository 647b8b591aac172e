//! Reconciliation of local durable references against a remote history.
//!
//! The common ancestor is found by guid, never by label or time, so the
//! result holds across renames (archive labels), reinstalls and clock drift.
//! Remote markers are only discarded when they are provably newer than a
//! shared guid; a remote with no shared guid is left untouched.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::backend::StorageBackend;
use crate::error::{BackupError, BackupResult};
use crate::marker::{DurableReference, Guid, RemoteHistory};

/// Local durable references grouped by guid.
///
/// Labels per guid are ordered newest-created first; among references with
/// equal creation order the listing order is kept. `order` holds each
/// distinct guid once, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalReferenceIndex {
    by_guid: BTreeMap<Guid, Vec<String>>,
    order: Vec<Guid>,
}

impl LocalReferenceIndex {
    /// Build from a reference listing in any order.
    pub fn build(references: &[DurableReference]) -> Self {
        let mut sorted: Vec<&DurableReference> = references.iter().collect();
        sorted.sort_by(|a, b| b.creation.cmp(&a.creation));

        let mut index = Self::default();
        for reference in sorted {
            let labels = index.by_guid.entry(reference.guid).or_default();
            if labels.is_empty() {
                index.order.push(reference.guid);
            }
            labels.push(reference.label.clone());
        }
        index
    }

    /// Newest local reference label for `guid`.
    pub fn newest_label(&self, guid: Guid) -> Option<&str> {
        self.by_guid
            .get(&guid)
            .and_then(|labels| labels.first())
            .map(String::as_str)
    }

    /// All labels for `guid`, newest first.
    pub fn labels(&self, guid: Guid) -> &[String] {
        self.by_guid.get(&guid).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether any local reference carries `guid`.
    pub fn contains(&self, guid: Guid) -> bool {
        self.by_guid.contains_key(&guid)
    }

    /// Distinct guids, newest first.
    pub fn guid_order(&self) -> &[Guid] {
        &self.order
    }

    /// Number of distinct guids.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether there are no local references.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// The incremental base chosen by reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanBase {
    /// Local durable reference label.
    pub label: String,
    /// Guid shared with the remote.
    pub guid: Guid,
    /// Label of the matching marker on the remote.
    pub remote_label: String,
}

/// Result of reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationPlan {
    /// Incremental base; `None` means a full transfer.
    pub base: Option<PlanBase>,
    /// Remote labels newer than the base, newest first.
    pub discard: Vec<String>,
}

impl ReplicationPlan {
    /// Whether the plan calls for a full transfer.
    pub fn is_full(&self) -> bool {
        self.base.is_none()
    }
}

/// Find the incremental base and the remote markers ahead of it.
pub fn reconcile(remote: &RemoteHistory, local: &LocalReferenceIndex) -> ReplicationPlan {
    if remote.is_empty() {
        return ReplicationPlan::default();
    }

    let mut discard = Vec::new();
    for entry in remote.entries() {
        if let Some(label) = local.newest_label(entry.guid) {
            return ReplicationPlan {
                base: Some(PlanBase {
                    label: label.to_string(),
                    guid: entry.guid,
                    remote_label: entry.label.clone(),
                }),
                discard,
            };
        }
        discard.push(entry.label.clone());
    }

    ReplicationPlan::default()
}

/// Gathers the local and remote views for one target and reconciles them.
pub struct ReplicationPlanner {
    local: Arc<dyn StorageBackend>,
    remote: Arc<dyn StorageBackend>,
    verbose: bool,
}

impl ReplicationPlanner {
    /// Planner for `local` → `remote`.
    pub fn new(local: Arc<dyn StorageBackend>, remote: Arc<dyn StorageBackend>, verbose: bool) -> Self {
        Self {
            local,
            remote,
            verbose,
        }
    }

    /// Remote history of `dataset`, empty when the dataset does not exist.
    pub async fn remote_history(&self, dataset: &str) -> BackupResult<RemoteHistory> {
        if !self.remote.dataset_exists(dataset).await? {
            info!(remote = %self.remote.location(), "remote dataset {} does not exist", dataset);
            return Ok(RemoteHistory::default());
        }
        Ok(RemoteHistory::from_markers(self.remote.list_markers(dataset).await?))
    }

    /// Reconcile `source` against `target_dataset` on the remote.
    pub async fn plan(&self, source: &str, target_dataset: &str) -> BackupResult<ReplicationPlan> {
        let history = self.remote_history(target_dataset).await?;
        if history.is_empty() {
            info!("remote history empty, full transfer required");
            return Ok(ReplicationPlan::default());
        }

        let references = self
            .local
            .list_references(source)
            .await
            .map_err(|e| match e {
                BackupError::DatasetNotFound { .. } => BackupError::SourceUnreachable {
                    dataset: source.to_string(),
                },
                other => other,
            })?;
        let index = LocalReferenceIndex::build(&references);

        if self.verbose {
            for entry in history.entries() {
                debug!(label = %entry.label, guid = %entry.guid, "remote (newest first)");
            }
            for guid in index.guid_order() {
                debug!(guid = %guid, labels = ?index.labels(*guid), "local (newest first)");
            }
        }

        let plan = reconcile(&history, &index);
        match &plan.base {
            Some(base) => info!(
                base = %base.label,
                guid = %base.guid,
                discard = plan.discard.len(),
                "incremental base found"
            ),
            None => info!(
                remote_markers = history.len(),
                "no common guid with remote, full transfer without discards"
            ),
        }
        Ok(plan)
    }
}
