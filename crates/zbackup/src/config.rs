//! Run configuration, loaded from TOML or JSON and overridden by flags.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::command::SshConfig;
use crate::error::{BackupError, BackupResult};
use crate::marker::{validate_dataset, Target};
use crate::snapshot::format_label;
use crate::throttle::ThrottleConfig;

/// A replica host and the dataset receiving the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// ssh login user.
    pub user: String,
    /// Host name.
    pub host: String,
    /// Receiving dataset on the host.
    pub dataset: String,
}

impl TargetConfig {
    fn new(host: &str, dataset: &str) -> Self {
        Self {
            user: "root".to_string(),
            host: host.to_string(),
            dataset: dataset.to_string(),
        }
    }

    /// The execution target described by this entry.
    pub fn target(&self) -> Target {
        Target {
            user: self.user.clone(),
            host: self.host.clone(),
            dataset: self.dataset.clone(),
        }
    }
}

/// Buffer and bandwidth settings of the transfer pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Bytes per second handed to the receiver (0 = unlimited).
    pub max_bytes_per_sec: u64,
    /// Burst allowance as a multiple of the rate.
    pub burst_factor: f64,
    /// Bytes held between sender and receiver.
    pub buffer_bytes: usize,
    /// Read size of the sending side.
    pub chunk_bytes: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_bytes_per_sec: 0,
            burst_factor: 1.5,
            buffer_bytes: 64 * 1024 * 1024,
            chunk_bytes: 128 * 1024,
        }
    }
}

impl TransferConfig {
    /// Rate limit settings for the buffer stage.
    pub fn throttle(&self) -> ThrottleConfig {
        ThrottleConfig {
            max_bytes_per_sec: self.max_bytes_per_sec,
            burst_factor: self.burst_factor,
        }
    }
}

/// Files copied to the nearline host before each run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestConfig {
    /// Local paths to copy.
    pub sources: Vec<PathBuf>,
    /// Directory on the nearline host.
    pub destination: String,
}

/// Everything a run needs to know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Source dataset.
    pub dataset: String,
    /// Local markers kept after rotation (at least 1).
    pub keep_markers: usize,
    /// strftime format of new marker labels.
    pub marker_label_format: String,
    /// strftime format of the archival rename label.
    pub archive_label_format: String,
    /// Day of month on which the archive target runs.
    pub archive_day: u32,
    /// PID file guarding against concurrent runs.
    pub lock_path: PathBuf,
    /// zfs executable, locally and on the replicas.
    pub zfs_program: String,
    /// How replicas are reached.
    pub ssh: SshConfig,
    /// Replica updated on every run.
    pub nearline: TargetConfig,
    /// Replica updated monthly.
    pub archive: TargetConfig,
    /// Pipeline settings.
    pub transfer: TransferConfig,
    /// Ancillary files copied to the nearline host.
    pub manifests: Option<ManifestConfig>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dataset: "tank".to_string(),
            keep_markers: 10,
            marker_label_format: "%Y-%m-%d_%H.%M.%S%.3f".to_string(),
            archive_label_format: "%Y-%m".to_string(),
            archive_day: 1,
            lock_path: PathBuf::from("/var/run/zbackup.pid"),
            zfs_program: "zfs".to_string(),
            ssh: SshConfig::default(),
            nearline: TargetConfig::new("nearline", "backup/tank"),
            archive: TargetConfig::new("archive", "archive/tank"),
            transfer: TransferConfig::default(),
            manifests: None,
        }
    }
}

impl BackupConfig {
    /// Load from `path`; the extension selects TOML or JSON.
    pub fn from_file(path: &Path) -> BackupResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| BackupError::Config {
                msg: format!("{}: {}", path.display(), e),
            }),
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => Err(BackupError::Config {
                msg: format!("unsupported config file extension: {}", ext),
            }),
        }
    }

    /// Load `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> BackupResult<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Reject settings a run cannot work with.
    pub fn validate(&self) -> BackupResult<()> {
        validate_dataset(&self.dataset)?;
        for (name, target) in [("nearline", &self.nearline), ("archive", &self.archive)] {
            validate_dataset(&target.dataset)?;
            if target.host.trim().is_empty() {
                return Err(BackupError::Config {
                    msg: format!("{} host is empty", name),
                });
            }
            if target.user.trim().is_empty() {
                return Err(BackupError::Config {
                    msg: format!("{} user is empty", name),
                });
            }
        }
        if !(1..=28).contains(&self.archive_day) {
            return Err(BackupError::Config {
                msg: format!("archive_day must be within 1..=28, got {}", self.archive_day),
            });
        }
        let sample = NaiveDate::from_ymd_opt(2000, 1, 1)
            .and_then(|d| d.and_hms_milli_opt(0, 0, 0, 0))
            .ok_or_else(|| BackupError::Config {
                msg: "cannot build sample timestamp".to_string(),
            })?;
        format_label(&self.marker_label_format, &sample)?;
        format_label(&self.archive_label_format, &sample)?;
        if self.transfer.chunk_bytes == 0 {
            return Err(BackupError::Config {
                msg: "transfer.chunk_bytes must be > 0".to_string(),
            });
        }
        if self.transfer.buffer_bytes < self.transfer.chunk_bytes {
            return Err(BackupError::Config {
                msg: "transfer.buffer_bytes must be >= transfer.chunk_bytes".to_string(),
            });
        }
        if self.transfer.burst_factor < 1.0 {
            return Err(BackupError::Config {
                msg: "transfer.burst_factor must be >= 1.0".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = BackupConfig::default();
        assert_eq!(config.keep_markers, 10);
        assert_eq!(config.archive_day, 1);
        assert_eq!(config.archive_label_format, "%Y-%m");
        assert_eq!(config.lock_path, PathBuf::from("/var/run/zbackup.pid"));
        assert_eq!(config.transfer.max_bytes_per_sec, 0);
        assert!(config.manifests.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
dataset = "pool/home"
keep_markers = 4

[nearline]
user = "backup"
host = "nas1"
dataset = "nas/home"

[transfer]
max_bytes_per_sec = 1048576

[manifests]
sources = ["/etc/fstab"]
destination = "/srv/manifests"
"#
        )
        .unwrap();

        let config = BackupConfig::from_file(file.path()).unwrap();
        assert_eq!(config.dataset, "pool/home");
        assert_eq!(config.keep_markers, 4);
        assert_eq!(config.nearline.host, "nas1");
        assert_eq!(config.nearline.target().destination(), "backup@nas1");
        assert_eq!(config.archive, BackupConfig::default().archive);
        assert_eq!(config.transfer.max_bytes_per_sec, 1_048_576);
        assert_eq!(config.transfer.chunk_bytes, TransferConfig::default().chunk_bytes);
        assert_eq!(config.manifests.unwrap().sources, vec![PathBuf::from("/etc/fstab")]);
    }

    #[test]
    fn test_from_json_file() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        write!(file, r#"{{"dataset": "pool/vm", "archive_day": 15}}"#).unwrap();
        let config = BackupConfig::from_file(file.path()).unwrap();
        assert_eq!(config.dataset, "pool/vm");
        assert_eq!(config.archive_day, 15);
    }

    #[test]
    fn test_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        let err = BackupConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, BackupError::Config { .. }));
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "keep_markers = \"many\"").unwrap();
        assert!(matches!(
            BackupConfig::from_file(file.path()),
            Err(BackupError::Config { .. })
        ));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = BackupConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, BackupConfig::default());
    }

    #[test]
    fn test_validate_rejects() {
        let mut config = BackupConfig::default();
        config.archive_day = 31;
        assert!(config.validate().is_err());

        let mut config = BackupConfig::default();
        config.dataset = "tank@snap".into();
        assert!(config.validate().is_err());

        let mut config = BackupConfig::default();
        config.transfer.buffer_bytes = 10;
        config.transfer.chunk_bytes = 20;
        assert!(config.validate().is_err());

        let mut config = BackupConfig::default();
        config.archive.host = " ".into();
        assert!(config.validate().is_err());

        let mut config = BackupConfig::default();
        config.marker_label_format = "%Y-%m-%d %H:%M".into();
        assert!(config.validate().is_err());
    }
}
