//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use zbackup::{BackupConfig, MemoryBackend, RunController, RunOptions, RunRequest};

pub const SOURCE: &str = "tank/data";
pub const NEARLINE: &str = "backup/data";
pub const ARCHIVE: &str = "archive/data";

/// Local wall-clock time on `day` of `month` 2026.
pub fn at(month: u32, day: u32, hour: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, month, day)
        .and_then(|d| d.and_hms_milli_opt(hour, 0, 0, 0))
        .expect("valid timestamp")
}

pub fn request(month: u32, day: u32, hour: u32) -> RunRequest {
    RunRequest {
        now: at(month, day, hour),
        force_archive: false,
    }
}

pub fn config() -> BackupConfig {
    let mut config = BackupConfig::default();
    config.dataset = SOURCE.to_string();
    config.keep_markers = 3;
    config.nearline.dataset = NEARLINE.to_string();
    config.archive.dataset = ARCHIVE.to_string();
    config.transfer.chunk_bytes = 4096;
    config.transfer.buffer_bytes = 16 * 1024;
    config
}

/// A source host and two replicas, all in memory.
pub struct Site {
    pub local: MemoryBackend,
    pub nearline: MemoryBackend,
    pub archive: MemoryBackend,
}

impl Site {
    pub fn new() -> Self {
        let local = MemoryBackend::new("local").with_payload_len(32 * 1024);
        local.add_dataset(SOURCE);
        Self {
            local,
            nearline: MemoryBackend::new("nearline"),
            archive: MemoryBackend::new("archive"),
        }
    }

    pub fn controller(&self, options: RunOptions) -> RunController {
        self.controller_with(config(), options)
    }

    pub fn controller_with(&self, config: BackupConfig, options: RunOptions) -> RunController {
        RunController::new(
            config,
            options,
            Arc::new(self.local.clone()),
            Arc::new(self.nearline.clone()),
            Arc::new(self.archive.clone()),
        )
    }
}
