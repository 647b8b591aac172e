//! Storage backend capability: the narrow set of snapshot/bookmark
//! operations planning and transfer depend on.
//!
//! Reconciliation never talks to a concrete transport; it sees only
//! [`StorageBackend`]. [`crate::zfs::ZfsBackend`] implements it by shelling
//! out locally or over ssh, [`crate::memory::MemoryBackend`] in process.

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::BackupResult;
use crate::marker::{DurableReference, Marker};

/// What to send: the marker `dataset@label`, optionally incremental from
/// the durable reference `dataset#base`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendSpec {
    /// Source dataset.
    pub dataset: String,
    /// Label of the marker to send.
    pub label: String,
    /// Label of the durable reference used as incremental base.
    pub base: Option<String>,
}

/// Outbound side of a transfer. `completion` resolves once the producer
/// has exited and reports its status.
pub struct SendStream {
    /// Stream bytes.
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Producer exit status.
    pub completion: BoxFuture<'static, BackupResult<()>>,
}

/// Inbound side of a transfer. `completion` resolves once the stream has
/// been applied (or rejected) by the receiver.
pub struct ReceiveSink {
    /// Destination for stream bytes; shut down to signal end of stream.
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    /// Apply status.
    pub completion: BoxFuture<'static, BackupResult<()>>,
}

/// A state-changing operation, used to print what a dry run would do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation<'a> {
    /// Create `dataset@label`.
    CreateMarker {
        /// Dataset.
        dataset: &'a str,
        /// Label.
        label: &'a str,
    },
    /// Create `dataset#label` from `dataset@label`.
    CreateReference {
        /// Dataset.
        dataset: &'a str,
        /// Label.
        label: &'a str,
    },
    /// Destroy `dataset@label`.
    DestroyMarker {
        /// Dataset.
        dataset: &'a str,
        /// Label.
        label: &'a str,
        /// Also destroy it in descendant datasets.
        recursive: bool,
    },
    /// Rename `dataset@from` to `dataset@to`.
    RenameMarker {
        /// Dataset.
        dataset: &'a str,
        /// Current label.
        from: &'a str,
        /// New label.
        to: &'a str,
    },
    /// Create the parents of `dataset`.
    EnsureParent {
        /// Dataset whose parents must exist.
        dataset: &'a str,
    },
    /// Produce a stream.
    Send(&'a SendSpec),
    /// Apply a stream to `dataset`, forced.
    Receive {
        /// Receiving dataset.
        dataset: &'a str,
    },
}

/// Snapshot and bookmark operations on one host.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Human-readable location (`local`, `user@host`, ...).
    fn location(&self) -> String;

    /// The exact command (or description) `op` would execute.
    fn preview(&self, op: &Mutation<'_>) -> String;

    /// Whether `dataset` exists. Transport failures are errors, not `false`.
    async fn dataset_exists(&self, dataset: &str) -> BackupResult<bool>;

    /// Create every missing parent of `dataset` (not `dataset` itself).
    async fn ensure_parent(&self, dataset: &str) -> BackupResult<()>;

    /// Markers directly on `dataset`, ascending by creation order.
    async fn list_markers(&self, dataset: &str) -> BackupResult<Vec<Marker>>;

    /// Durable references on `dataset`, ascending by creation order.
    async fn list_references(&self, dataset: &str) -> BackupResult<Vec<DurableReference>>;

    /// Create `dataset@label`.
    async fn create_marker(&self, dataset: &str, label: &str) -> BackupResult<Marker>;

    /// Create `dataset#label` bound to the guid of `marker`.
    async fn create_reference(&self, marker: &Marker) -> BackupResult<DurableReference>;

    /// Destroy `dataset@label`; `recursive` also destroys the same-named
    /// marker in every descendant dataset.
    async fn destroy_marker(&self, dataset: &str, label: &str, recursive: bool)
        -> BackupResult<()>;

    /// Rename `dataset@from` to `dataset@to`.
    async fn rename_marker(&self, dataset: &str, from: &str, to: &str) -> BackupResult<()>;

    /// Estimated stream size in bytes.
    async fn estimate_send_size(&self, spec: &SendSpec) -> BackupResult<u64>;

    /// Start producing the stream described by `spec`.
    async fn send_stream(&self, spec: &SendSpec) -> BackupResult<SendStream>;

    /// Start a forced apply into `dataset`. Divergent state on the
    /// receiver is rolled back so re-applying the same stream converges.
    async fn receive_stream(&self, dataset: &str) -> BackupResult<ReceiveSink>;
}
