//! Point-in-time markers (snapshots), durable references (bookmarks) and
//! the remote history view used for reconciliation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BackupError;

/// Stable identity of a marker. Assigned once at creation, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Guid(pub u64);

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Guid {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(Guid)
            .map_err(|e| BackupError::Parse {
                msg: format!("invalid guid {:?}: {}", s, e),
            })
    }
}

/// An immutable point-in-time view of a dataset, `dataset@label`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
    /// Dataset the marker belongs to.
    pub dataset: String,
    /// Free-form label, normally a timestamp.
    pub label: String,
    /// Stable identity.
    pub guid: Guid,
    /// Creation order (transaction group), total and consistent with time.
    pub creation: u64,
}

impl Marker {
    /// Full `dataset@label` name.
    pub fn name(&self) -> String {
        marker_name(&self.dataset, &self.label)
    }
}

/// A space-free reference to a marker's guid, `dataset#label`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableReference {
    /// Dataset the reference belongs to.
    pub dataset: String,
    /// Label, equal to the label of the marker it was created from.
    pub label: String,
    /// Guid of the marker it was created from.
    pub guid: Guid,
    /// Creation order inherited from the marker.
    pub creation: u64,
}

impl DurableReference {
    /// Full `dataset#label` name.
    pub fn name(&self) -> String {
        reference_name(&self.dataset, &self.label)
    }
}

/// `dataset@label`
pub fn marker_name(dataset: &str, label: &str) -> String {
    format!("{}@{}", dataset, label)
}

/// `dataset#label`
pub fn reference_name(dataset: &str, label: &str) -> String {
    format!("{}#{}", dataset, label)
}

/// Splits `dataset@label` or `dataset#label` at the given separator.
pub fn split_name(name: &str, sep: char) -> Result<(&str, &str), BackupError> {
    match name.split_once(sep) {
        Some((dataset, label)) if !dataset.is_empty() && !label.is_empty() => {
            Ok((dataset, label))
        }
        _ => Err(BackupError::Parse {
            msg: format!("expected dataset{}label, got {:?}", sep, name),
        }),
    }
}

/// Checks that a dataset path is usable as a replication endpoint.
pub fn validate_dataset(dataset: &str) -> Result<(), BackupError> {
    let bad = dataset.is_empty()
        || dataset.starts_with('/')
        || dataset.ends_with('/')
        || dataset.contains("//")
        || dataset.contains(['@', '#', ' ', '\t', '\n']);
    if bad {
        return Err(BackupError::Config {
            msg: format!("invalid dataset name {:?}", dataset),
        });
    }
    Ok(())
}

/// Parent of a dataset path, if it is not a pool root.
pub fn parent_dataset(dataset: &str) -> Option<&str> {
    dataset.rsplit_once('/').map(|(parent, _)| parent)
}

/// Where a plan is executed: `{ user, host, dataset }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Login user on the remote host.
    pub user: String,
    /// Remote host name.
    pub host: String,
    /// Dataset path on the remote host.
    pub dataset: String,
}

impl Target {
    /// `user@host`, as used by ssh and rsync.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.dataset)
    }
}

/// One remote marker as seen by the planner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// Remote marker label.
    pub label: String,
    /// Remote marker guid.
    pub guid: Guid,
}

/// Markers present on a remote dataset, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteHistory {
    entries: Vec<RemoteEntry>,
}

impl RemoteHistory {
    /// Build from entries already ordered newest to oldest.
    pub fn new(entries: Vec<RemoteEntry>) -> Self {
        Self { entries }
    }

    /// Build from a marker listing in any order; sorted newest first by creation.
    pub fn from_markers(mut markers: Vec<Marker>) -> Self {
        // Stable sort keeps listing order among equal creation values.
        markers.sort_by(|a, b| b.creation.cmp(&a.creation));
        let entries = markers
            .into_iter()
            .map(|m| RemoteEntry {
                label: m.label,
                guid: m.guid,
            })
            .collect();
        Self { entries }
    }

    /// Entries newest to oldest.
    pub fn entries(&self) -> &[RemoteEntry] {
        &self.entries
    }

    /// Whether the remote has no markers.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of remote markers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker(label: &str, guid: u64, creation: u64) -> Marker {
        Marker {
            dataset: "tank/data".into(),
            label: label.into(),
            guid: Guid(guid),
            creation,
        }
    }

    #[test]
    fn test_names() {
        let m = marker("a", 1, 1);
        assert_eq!(m.name(), "tank/data@a");
        assert_eq!(reference_name("tank/data", "a"), "tank/data#a");
    }

    #[test]
    fn test_guid_parse() {
        assert_eq!("18446744073709551615".parse::<Guid>().unwrap(), Guid(u64::MAX));
        assert!("abc".parse::<Guid>().is_err());
        assert!("".parse::<Guid>().is_err());
    }

    #[test]
    fn test_split_name() {
        assert_eq!(split_name("pool/ds@snap", '@').unwrap(), ("pool/ds", "snap"));
        assert_eq!(split_name("pool/ds#bm", '#').unwrap(), ("pool/ds", "bm"));
        assert!(split_name("pool/ds", '@').is_err());
        assert!(split_name("@snap", '@').is_err());
    }

    #[test]
    fn test_validate_dataset() {
        assert!(validate_dataset("tank").is_ok());
        assert!(validate_dataset("tank/a/b").is_ok());
        assert!(validate_dataset("").is_err());
        assert!(validate_dataset("tank/").is_err());
        assert!(validate_dataset("tank@x").is_err());
        assert!(validate_dataset("tank#x").is_err());
        assert!(validate_dataset("/tank").is_err());
    }

    #[test]
    fn test_parent_dataset() {
        assert_eq!(parent_dataset("tank/a/b"), Some("tank/a"));
        assert_eq!(parent_dataset("tank"), None);
    }

    #[test]
    fn test_remote_history_newest_first() {
        let history = RemoteHistory::from_markers(vec![
            marker("s1", 10, 100),
            marker("s3", 30, 300),
            marker("s2", 20, 200),
        ]);
        let labels: Vec<_> = history.entries().iter().map(|e| e.label.as_str()).collect();
        assert_eq!(labels, vec!["s3", "s2", "s1"]);
        assert_eq!(history.len(), 3);
        assert!(!history.is_empty());
    }

    #[test]
    fn test_target_display() {
        let t = Target {
            user: "root".into(),
            host: "backup".into(),
            dataset: "backup/data".into(),
        };
        assert_eq!(t.destination(), "root@backup");
        assert_eq!(t.to_string(), "root@backup:backup/data");
    }
}
