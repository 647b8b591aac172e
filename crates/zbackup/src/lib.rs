#![warn(missing_docs)]

//! zbackup: snapshot/bookmark replication of a copy-on-write dataset to a
//! nearline and an archive replica, reconciled by snapshot guid.

pub mod backend;
pub mod cli;
pub mod command;
pub mod config;
pub mod controller;
pub mod error;
pub mod lock;
pub mod manifest;
pub mod marker;
pub mod memory;
pub mod mode;
pub mod planner;
pub mod progress;
pub mod snapshot;
pub mod throttle;
pub mod transfer;
pub mod zfs;

pub use backend::{Mutation, ReceiveSink, SendSpec, SendStream, StorageBackend};
pub use config::BackupConfig;
pub use controller::{RunController, RunReport, RunRequest};
pub use error::{BackupError, BackupResult};
pub use marker::{DurableReference, Guid, Marker, RemoteHistory, Target};
pub use memory::MemoryBackend;
pub use mode::{ExecMode, RunOptions};
pub use planner::{reconcile, LocalReferenceIndex, ReplicationPlan, ReplicationPlanner};
pub use zfs::ZfsBackend;
