//! In-process storage backend.
//!
//! Models datasets with snapshots and bookmarks, random 64-bit guids, a
//! monotonically increasing transaction group as creation order, and the
//! forced-receive semantics the transfer relies on. Streams carry a JSON
//! header line followed by filler bytes so size probes, buffering and rate
//! limiting see real data. Faults can be injected for failure-path tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::backend::{Mutation, ReceiveSink, SendSpec, SendStream, StorageBackend};
use crate::error::{BackupError, BackupResult};
use crate::marker::{marker_name, parent_dataset, reference_name, DurableReference, Guid, Marker};

const DUPLEX_CAPACITY: usize = 64 * 1024;

/// Failure to inject into a [`MemoryBackend`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Fault {
    /// Every operation fails as if the host were unreachable.
    Unreachable,
    /// Bookmark creation fails.
    CreateReference,
    /// Destroying the marker with this label fails.
    Destroy(String),
    /// Applying a received stream fails.
    Receive,
    /// The send size probe fails.
    Estimate,
}

#[derive(Debug, Default, Clone)]
struct MemDataset {
    markers: Vec<Marker>,
    references: Vec<DurableReference>,
}

#[derive(Debug, Default)]
struct MemState {
    datasets: BTreeMap<String, MemDataset>,
    guids: BTreeSet<Guid>,
    next_txg: u64,
    faults: BTreeSet<Fault>,
}

impl MemState {
    fn txg(&mut self) -> u64 {
        self.next_txg += 1;
        self.next_txg
    }

    fn fresh_guid(&mut self) -> Guid {
        loop {
            let guid = Guid(rand::random::<u64>());
            if guid.0 != 0 && self.guids.insert(guid) {
                return guid;
            }
        }
    }

    fn dataset(&self, name: &str) -> BackupResult<&MemDataset> {
        self.datasets.get(name).ok_or_else(|| BackupError::DatasetNotFound {
            dataset: name.to_string(),
        })
    }

    fn dataset_mut(&mut self, name: &str) -> BackupResult<&mut MemDataset> {
        self.datasets
            .get_mut(name)
            .ok_or_else(|| BackupError::DatasetNotFound {
                dataset: name.to_string(),
            })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StreamHeader {
    base: Option<Guid>,
    label: String,
    guid: Guid,
    payload_len: usize,
}

/// Storage backend held entirely in memory.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    name: String,
    payload_len: usize,
    state: Arc<Mutex<MemState>>,
}

impl MemoryBackend {
    /// Empty backend identified as `name` in logs and previews.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload_len: 4096,
            state: Arc::new(Mutex::new(MemState::default())),
        }
    }

    /// Number of filler bytes following each stream header.
    pub fn with_payload_len(mut self, payload_len: usize) -> Self {
        self.payload_len = payload_len;
        self
    }

    /// Create `dataset` (and its parents).
    pub fn add_dataset(&self, dataset: &str) {
        let mut state = self.state.lock();
        let mut current = Some(dataset);
        while let Some(name) = current {
            state.datasets.entry(name.to_string()).or_default();
            current = parent_dataset(name);
        }
    }

    /// Seed a marker with a chosen guid.
    pub fn insert_marker(&self, dataset: &str, label: &str, guid: Guid) -> Marker {
        self.add_dataset(dataset);
        let mut state = self.state.lock();
        state.guids.insert(guid);
        let creation = state.txg();
        let marker = Marker {
            dataset: dataset.to_string(),
            label: label.to_string(),
            guid,
            creation,
        };
        if let Some(ds) = state.datasets.get_mut(dataset) {
            ds.markers.push(marker.clone());
        }
        marker
    }

    /// Seed a durable reference with a chosen guid.
    pub fn insert_reference(&self, dataset: &str, label: &str, guid: Guid) -> DurableReference {
        self.add_dataset(dataset);
        let mut state = self.state.lock();
        let creation = state.txg();
        let reference = DurableReference {
            dataset: dataset.to_string(),
            label: label.to_string(),
            guid,
            creation,
        };
        if let Some(ds) = state.datasets.get_mut(dataset) {
            ds.references.push(reference.clone());
        }
        reference
    }

    /// Make subsequent operations hit `fault`.
    pub fn inject(&self, fault: Fault) {
        self.state.lock().faults.insert(fault);
    }

    /// Remove a previously injected fault.
    pub fn clear(&self, fault: &Fault) {
        self.state.lock().faults.remove(fault);
    }

    /// Labels of markers on `dataset`, oldest first. Empty if missing.
    pub fn marker_labels(&self, dataset: &str) -> Vec<String> {
        let state = self.state.lock();
        state
            .datasets
            .get(dataset)
            .map(|ds| ds.markers.iter().map(|m| m.label.clone()).collect())
            .unwrap_or_default()
    }

    /// Labels of references on `dataset`, oldest first. Empty if missing.
    pub fn reference_labels(&self, dataset: &str) -> Vec<String> {
        let state = self.state.lock();
        state
            .datasets
            .get(dataset)
            .map(|ds| ds.references.iter().map(|r| r.label.clone()).collect())
            .unwrap_or_default()
    }

    /// Whether `dataset` exists.
    pub fn has_dataset(&self, dataset: &str) -> bool {
        self.state.lock().datasets.contains_key(dataset)
    }

    fn check(&self, state: &MemState, fault: &Fault) -> BackupResult<()> {
        if state.faults.contains(&Fault::Unreachable) || state.faults.contains(fault) {
            return Err(BackupError::CommandFailed {
                location: self.name.clone(),
                command: format!("{:?}", fault),
                status: "injected".to_string(),
                stderr: "injected fault".to_string(),
            });
        }
        Ok(())
    }

    fn reachable(&self, state: &MemState) -> BackupResult<()> {
        self.check(state, &Fault::Unreachable)
    }

    fn encode(&self, spec: &SendSpec) -> BackupResult<Vec<u8>> {
        let state = self.state.lock();
        self.reachable(&state)?;
        let ds = state.dataset(&spec.dataset)?;
        let marker = ds
            .markers
            .iter()
            .find(|m| m.label == spec.label)
            .ok_or_else(|| BackupError::MarkerNotFound {
                name: marker_name(&spec.dataset, &spec.label),
            })?;
        let base = match &spec.base {
            Some(base) => Some(
                ds.references
                    .iter()
                    .find(|r| &r.label == base)
                    .map(|r| r.guid)
                    .ok_or_else(|| BackupError::MarkerNotFound {
                        name: reference_name(&spec.dataset, base),
                    })?,
            ),
            None => None,
        };
        let header = StreamHeader {
            base,
            label: marker.label.clone(),
            guid: marker.guid,
            payload_len: self.payload_len,
        };
        let mut bytes = serde_json::to_vec(&header)?;
        bytes.push(b'\n');
        bytes.resize(bytes.len() + self.payload_len, 0xA5);
        Ok(bytes)
    }

    fn apply(state: &Mutex<MemState>, name: &str, dataset: &str, bytes: &[u8]) -> BackupResult<()> {
        let newline = bytes
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| BackupError::Transfer {
                msg: "stream header missing".to_string(),
            })?;
        let header: StreamHeader = serde_json::from_slice(&bytes[..newline])?;
        let received = bytes.len() - newline - 1;
        if received != header.payload_len {
            return Err(BackupError::Transfer {
                msg: format!("truncated stream: {} of {} bytes", received, header.payload_len),
            });
        }

        let mut state = state.lock();
        if state.faults.contains(&Fault::Receive) || state.faults.contains(&Fault::Unreachable) {
            return Err(BackupError::CommandFailed {
                location: name.to_string(),
                command: format!("receive {}", dataset),
                status: "injected".to_string(),
                stderr: "injected fault".to_string(),
            });
        }
        if !state.datasets.contains_key(dataset) {
            if let Some(guid) = header.base {
                return Err(BackupError::IncrementalBaseMissing {
                    dataset: dataset.to_string(),
                    guid: guid.to_string(),
                });
            }
            if let Some(parent) = parent_dataset(dataset) {
                if !state.datasets.contains_key(parent) {
                    return Err(BackupError::DatasetNotFound {
                        dataset: parent.to_string(),
                    });
                }
            }
            state.datasets.insert(dataset.to_string(), MemDataset::default());
        }

        let creation = state.txg();
        state.guids.insert(header.guid);
        let ds = state.dataset_mut(dataset)?;
        match header.base {
            Some(base) => {
                let pos = ds
                    .markers
                    .iter()
                    .position(|m| m.guid == base)
                    .ok_or_else(|| BackupError::IncrementalBaseMissing {
                        dataset: dataset.to_string(),
                        guid: base.to_string(),
                    })?;
                // Forced receive rolls back everything newer than the base.
                ds.markers.truncate(pos + 1);
            }
            // Like `zfs receive -F`, a full stream never overwrites existing
            // snapshots.
            None if !ds.markers.is_empty() => {
                return Err(BackupError::ForeignHistory {
                    dataset: dataset.to_string(),
                    markers: ds.markers.len(),
                });
            }
            None => {}
        }
        if ds.markers.iter().any(|m| m.label == header.label) {
            return Err(BackupError::AlreadyExists {
                dataset: dataset.to_string(),
                label: header.label,
            });
        }
        ds.markers.push(Marker {
            dataset: dataset.to_string(),
            label: header.label,
            guid: header.guid,
            creation,
        });
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn location(&self) -> String {
        self.name.clone()
    }

    fn preview(&self, op: &Mutation<'_>) -> String {
        let what = match op {
            Mutation::CreateMarker { dataset, label } => {
                format!("snapshot {}", marker_name(dataset, label))
            }
            Mutation::CreateReference { dataset, label } => format!(
                "bookmark {} {}",
                marker_name(dataset, label),
                reference_name(dataset, label)
            ),
            Mutation::DestroyMarker {
                dataset,
                label,
                recursive,
            } => format!(
                "destroy{} {}",
                if *recursive { " -r" } else { "" },
                marker_name(dataset, label)
            ),
            Mutation::RenameMarker { dataset, from, to } => format!(
                "rename {} {}",
                marker_name(dataset, from),
                marker_name(dataset, to)
            ),
            Mutation::EnsureParent { dataset } => format!("create -p parent of {}", dataset),
            Mutation::Send(spec) => match &spec.base {
                Some(base) => format!(
                    "send -i {} {}",
                    reference_name(&spec.dataset, base),
                    marker_name(&spec.dataset, &spec.label)
                ),
                None => format!("send {}", marker_name(&spec.dataset, &spec.label)),
            },
            Mutation::Receive { dataset } => format!("receive -F {}", dataset),
        };
        format!("[{}] {}", self.name, what)
    }

    async fn dataset_exists(&self, dataset: &str) -> BackupResult<bool> {
        let state = self.state.lock();
        self.reachable(&state)?;
        Ok(state.datasets.contains_key(dataset))
    }

    async fn ensure_parent(&self, dataset: &str) -> BackupResult<()> {
        {
            let state = self.state.lock();
            self.reachable(&state)?;
        }
        if let Some(parent) = parent_dataset(dataset) {
            self.add_dataset(parent);
        }
        Ok(())
    }

    async fn list_markers(&self, dataset: &str) -> BackupResult<Vec<Marker>> {
        let state = self.state.lock();
        self.reachable(&state)?;
        Ok(state.dataset(dataset)?.markers.clone())
    }

    async fn list_references(&self, dataset: &str) -> BackupResult<Vec<DurableReference>> {
        let state = self.state.lock();
        self.reachable(&state)?;
        Ok(state.dataset(dataset)?.references.clone())
    }

    async fn create_marker(&self, dataset: &str, label: &str) -> BackupResult<Marker> {
        let mut state = self.state.lock();
        self.reachable(&state)?;
        if state.dataset(dataset)?.markers.iter().any(|m| m.label == label) {
            return Err(BackupError::AlreadyExists {
                dataset: dataset.to_string(),
                label: label.to_string(),
            });
        }
        let guid = state.fresh_guid();
        let creation = state.txg();
        let marker = Marker {
            dataset: dataset.to_string(),
            label: label.to_string(),
            guid,
            creation,
        };
        state.dataset_mut(dataset)?.markers.push(marker.clone());
        debug!(backend = %self.name, "created {}", marker.name());
        Ok(marker)
    }

    async fn create_reference(&self, marker: &Marker) -> BackupResult<DurableReference> {
        let mut state = self.state.lock();
        self.check(&state, &Fault::CreateReference)?;
        let ds = state.dataset_mut(&marker.dataset)?;
        let source = ds
            .markers
            .iter()
            .find(|m| m.label == marker.label)
            .cloned()
            .ok_or_else(|| BackupError::MarkerNotFound {
                name: marker.name(),
            })?;
        if ds.references.iter().any(|r| r.label == marker.label) {
            return Err(BackupError::AlreadyExists {
                dataset: marker.dataset.clone(),
                label: marker.label.clone(),
            });
        }
        let reference = DurableReference {
            dataset: source.dataset,
            label: source.label,
            guid: source.guid,
            creation: source.creation,
        };
        ds.references.push(reference.clone());
        Ok(reference)
    }

    async fn destroy_marker(
        &self,
        dataset: &str,
        label: &str,
        recursive: bool,
    ) -> BackupResult<()> {
        let mut state = self.state.lock();
        self.check(&state, &Fault::Destroy(label.to_string()))?;
        let ds = state.dataset_mut(dataset)?;
        let before = ds.markers.len();
        ds.markers.retain(|m| m.label != label);
        if ds.markers.len() == before {
            return Err(BackupError::MarkerNotFound {
                name: marker_name(dataset, label),
            });
        }
        if recursive {
            let prefix = format!("{}/", dataset);
            for (name, child) in state.datasets.iter_mut() {
                if name.starts_with(&prefix) {
                    child.markers.retain(|m| m.label != label);
                }
            }
        }
        Ok(())
    }

    async fn rename_marker(&self, dataset: &str, from: &str, to: &str) -> BackupResult<()> {
        let mut state = self.state.lock();
        self.reachable(&state)?;
        let ds = state.dataset_mut(dataset)?;
        if ds.markers.iter().any(|m| m.label == to) {
            return Err(BackupError::RenameCollision {
                dataset: dataset.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        let marker = ds
            .markers
            .iter_mut()
            .find(|m| m.label == from)
            .ok_or_else(|| BackupError::MarkerNotFound {
                name: marker_name(dataset, from),
            })?;
        marker.label = to.to_string();
        Ok(())
    }

    async fn estimate_send_size(&self, spec: &SendSpec) -> BackupResult<u64> {
        self.check(&self.state.lock(), &Fault::Estimate)?;
        Ok(self.encode(spec)?.len() as u64)
    }

    async fn send_stream(&self, spec: &SendSpec) -> BackupResult<SendStream> {
        let bytes = self.encode(spec)?;
        Ok(SendStream {
            reader: Box::new(std::io::Cursor::new(bytes)),
            completion: Box::pin(async { Ok(()) }),
        })
    }

    async fn receive_stream(&self, dataset: &str) -> BackupResult<ReceiveSink> {
        {
            let state = self.state.lock();
            self.reachable(&state)?;
        }
        let (writer, mut reader) = tokio::io::duplex(DUPLEX_CAPACITY);
        let state = Arc::clone(&self.state);
        let name = self.name.clone();
        let dataset = dataset.to_string();
        let task = tokio::spawn(async move {
            let mut bytes = Vec::new();
            match reader.read_to_end(&mut bytes).await {
                Ok(_) => Self::apply(&state, &name, &dataset, &bytes),
                Err(e) => Err(BackupError::from(e)),
            }
        });
        Ok(ReceiveSink {
            writer: Box::new(writer),
            completion: Box::pin(async move {
                task.await.map_err(|e| BackupError::Transfer {
                    msg: format!("receive task failed: {}", e),
                })?
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn pipe(src: &MemoryBackend, spec: &SendSpec, dst: &MemoryBackend, dataset: &str) -> BackupResult<()> {
        let mut send = src.send_stream(spec).await?;
        let mut sink = dst.receive_stream(dataset).await?;
        tokio::io::copy(&mut send.reader, &mut sink.writer).await?;
        sink.writer.shutdown().await?;
        drop(sink.writer);
        send.completion.await?;
        sink.completion.await
    }

    #[tokio::test]
    async fn test_create_marker_assigns_unique_guids() {
        let mem = MemoryBackend::new("local");
        mem.add_dataset("tank/data");
        let a = mem.create_marker("tank/data", "a").await.unwrap();
        let b = mem.create_marker("tank/data", "b").await.unwrap();
        assert_ne!(a.guid, b.guid);
        assert!(b.creation > a.creation);
        assert!(matches!(
            mem.create_marker("tank/data", "a").await,
            Err(BackupError::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_reference_survives_marker() {
        let mem = MemoryBackend::new("local");
        mem.add_dataset("tank/data");
        let m = mem.create_marker("tank/data", "a").await.unwrap();
        let r = mem.create_reference(&m).await.unwrap();
        mem.destroy_marker("tank/data", "a", false).await.unwrap();
        let refs = mem.list_references("tank/data").await.unwrap();
        assert_eq!(refs, vec![r.clone()]);
        assert_eq!(r.guid, m.guid);
        assert!(mem.list_markers("tank/data").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_full_then_incremental_receive() {
        let src = MemoryBackend::new("local");
        let dst = MemoryBackend::new("remote");
        src.add_dataset("tank/data");
        dst.add_dataset("backup");
        let a = src.create_marker("tank/data", "a").await.unwrap();
        src.create_reference(&a).await.unwrap();

        let full = SendSpec {
            dataset: "tank/data".into(),
            label: "a".into(),
            base: None,
        };
        pipe(&src, &full, &dst, "backup/data").await.unwrap();
        let remote = dst.list_markers("backup/data").await.unwrap();
        assert_eq!(remote.len(), 1);
        assert_eq!(remote[0].guid, a.guid);

        src.destroy_marker("tank/data", "a", false).await.unwrap();
        src.create_marker("tank/data", "b").await.unwrap();
        let incr = SendSpec {
            dataset: "tank/data".into(),
            label: "b".into(),
            base: Some("a".into()),
        };
        pipe(&src, &incr, &dst, "backup/data").await.unwrap();
        assert_eq!(dst.marker_labels("backup/data"), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_receive_without_parent_fails() {
        let src = MemoryBackend::new("local");
        let dst = MemoryBackend::new("remote");
        src.add_dataset("tank/data");
        src.create_marker("tank/data", "a").await.unwrap();
        let spec = SendSpec {
            dataset: "tank/data".into(),
            label: "a".into(),
            base: None,
        };
        let err = pipe(&src, &spec, &dst, "backup/data").await.unwrap_err();
        assert!(matches!(err, BackupError::DatasetNotFound { .. }));
        dst.ensure_parent("backup/data").await.unwrap();
        pipe(&src, &spec, &dst, "backup/data").await.unwrap();
    }

    #[tokio::test]
    async fn test_incremental_missing_base_fails() {
        let src = MemoryBackend::new("local");
        let dst = MemoryBackend::new("remote");
        src.insert_reference("tank/data", "old", Guid(7));
        src.insert_marker("tank/data", "new", Guid(8));
        dst.insert_marker("backup/data", "other", Guid(9));
        let spec = SendSpec {
            dataset: "tank/data".into(),
            label: "new".into(),
            base: Some("old".into()),
        };
        let err = pipe(&src, &spec, &dst, "backup/data").await.unwrap_err();
        assert!(matches!(err, BackupError::IncrementalBaseMissing { .. }));
    }

    #[tokio::test]
    async fn test_rename_collision() {
        let mem = MemoryBackend::new("remote");
        mem.insert_marker("archive/data", "2026-10", Guid(1));
        mem.insert_marker("archive/data", "s2", Guid(2));
        let err = mem.rename_marker("archive/data", "s2", "2026-10").await.unwrap_err();
        assert!(matches!(err, BackupError::RenameCollision { .. }));
        mem.rename_marker("archive/data", "s2", "2026-11").await.unwrap();
        assert_eq!(mem.marker_labels("archive/data"), vec!["2026-10", "2026-11"]);
    }

    #[tokio::test]
    async fn test_recursive_destroy_and_faults() {
        let mem = MemoryBackend::new("remote");
        mem.insert_marker("backup/data", "s1", Guid(1));
        mem.insert_marker("backup/data/child", "s1", Guid(2));
        mem.destroy_marker("backup/data", "s1", true).await.unwrap();
        assert!(mem.marker_labels("backup/data/child").is_empty());

        mem.insert_marker("backup/data", "s2", Guid(3));
        mem.inject(Fault::Destroy("s2".into()));
        assert!(mem.destroy_marker("backup/data", "s2", true).await.is_err());
        mem.clear(&Fault::Destroy("s2".into()));
        mem.destroy_marker("backup/data", "s2", true).await.unwrap();

        mem.inject(Fault::Unreachable);
        assert!(mem.dataset_exists("backup/data").await.is_err());
    }

    #[tokio::test]
    async fn test_plain_destroy_keeps_child_markers() {
        let mem = MemoryBackend::new("remote");
        mem.insert_marker("backup/data", "s1", Guid(1));
        mem.insert_marker("backup/data/child", "s1", Guid(2));
        mem.destroy_marker("backup/data", "s1", false).await.unwrap();
        assert_eq!(mem.marker_labels("backup/data/child"), vec!["s1"]);
        assert_eq!(
            mem.preview(&Mutation::DestroyMarker {
                dataset: "backup/data",
                label: "s1",
                recursive: true,
            }),
            "[remote] destroy -r backup/data@s1"
        );
    }

    #[tokio::test]
    async fn test_full_receive_refuses_existing_markers() {
        let src = MemoryBackend::new("local");
        let dst = MemoryBackend::new("remote");
        src.insert_marker("tank/data", "a", Guid(1));
        dst.insert_marker("backup/data", "foreign-1", Guid(1001));
        dst.insert_marker("backup/data", "foreign-2", Guid(1002));
        let spec = SendSpec {
            dataset: "tank/data".into(),
            label: "a".into(),
            base: None,
        };
        let err = pipe(&src, &spec, &dst, "backup/data").await.unwrap_err();
        assert!(matches!(err, BackupError::ForeignHistory { markers: 2, .. }));
        assert_eq!(dst.marker_labels("backup/data"), vec!["foreign-1", "foreign-2"]);

        // An existing dataset without markers accepts the full stream.
        dst.add_dataset("backup/empty");
        pipe(&src, &spec, &dst, "backup/empty").await.unwrap();
        assert_eq!(dst.marker_labels("backup/empty"), vec!["a"]);
    }

    #[tokio::test]
    async fn test_estimate_fault() {
        let src = MemoryBackend::new("local");
        src.insert_marker("tank/data", "a", Guid(1));
        let spec = SendSpec {
            dataset: "tank/data".into(),
            label: "a".into(),
            base: None,
        };
        src.inject(Fault::Estimate);
        assert!(src.estimate_send_size(&spec).await.is_err());
        assert!(src.send_stream(&spec).await.is_ok());
    }
}
