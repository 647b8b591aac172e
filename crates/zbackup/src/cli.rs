//! Command-line interface of the `zbackup` binary.

use std::path::PathBuf;

use clap::Parser;

use crate::config::BackupConfig;
use crate::mode::{ExecMode, RunOptions};

/// Snapshot a dataset and replicate it to the nearline and archive hosts.
#[derive(Parser, Debug)]
#[command(name = "zbackup")]
#[command(about = "Snapshot/bookmark replication to nearline and archive replicas", long_about = None)]
pub struct Cli {
    /// Configuration file (TOML or JSON); defaults apply when it is missing.
    #[arg(short, long, default_value = "/etc/zbackup/zbackup.toml", env = "ZBACKUP_CONFIG")]
    pub config: PathBuf,

    /// Print commands that would change state instead of running them.
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Verbosity: 1 commands and decisions, 2 reconciliation detail, 3 everything.
    #[arg(short, long, value_parser = clap::value_parser!(u8).range(1..=3))]
    pub debug: Option<u8>,

    /// Run the archive target regardless of the day of month.
    #[arg(short, long)]
    pub archive: bool,

    /// Source dataset.
    #[arg(long)]
    pub dataset: Option<String>,

    /// Nearline host.
    #[arg(long)]
    pub backup_host: Option<String>,

    /// Dataset on the nearline host.
    #[arg(long)]
    pub backup_dataset: Option<String>,

    /// Archive host.
    #[arg(long)]
    pub archive_host: Option<String>,

    /// Dataset on the archive host.
    #[arg(long)]
    pub archive_dataset: Option<String>,

    /// ssh user for both hosts.
    #[arg(short, long)]
    pub user: Option<String>,
}

impl Cli {
    /// Overlay the flags given on the command line onto `config`.
    pub fn apply(&self, config: &mut BackupConfig) {
        if let Some(dataset) = &self.dataset {
            config.dataset = dataset.clone();
        }
        if let Some(host) = &self.backup_host {
            config.nearline.host = host.clone();
        }
        if let Some(dataset) = &self.backup_dataset {
            config.nearline.dataset = dataset.clone();
        }
        if let Some(host) = &self.archive_host {
            config.archive.host = host.clone();
        }
        if let Some(dataset) = &self.archive_dataset {
            config.archive.dataset = dataset.clone();
        }
        if let Some(user) = &self.user {
            config.nearline.user = user.clone();
            config.archive.user = user.clone();
        }
    }

    /// Execution mode selected by `--dry-run`.
    pub fn mode(&self) -> ExecMode {
        if self.dry_run {
            ExecMode::DryRun
        } else {
            ExecMode::Execute
        }
    }

    /// Run options; progress is drawn only when standard error is a terminal.
    pub fn run_options(&self) -> RunOptions {
        RunOptions::detect(self.mode(), self.debug.unwrap_or(0) >= 2)
    }

    /// `tracing` filter directive for the `--debug` level.
    pub fn log_filter(&self) -> &'static str {
        match self.debug {
            None | Some(0) => "info",
            Some(1) => "debug",
            Some(2) => "info,zbackup=trace",
            Some(_) => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["zbackup"]);
        assert_eq!(cli.config, PathBuf::from("/etc/zbackup/zbackup.toml"));
        assert!(!cli.dry_run);
        assert!(!cli.archive);
        assert_eq!(cli.mode(), ExecMode::Execute);
        assert_eq!(cli.log_filter(), "info");
    }

    #[test]
    fn test_overrides_apply() {
        let cli = Cli::parse_from([
            "zbackup",
            "--dataset",
            "pool/home",
            "--backup-host",
            "nas1",
            "--backup-dataset",
            "nas/home",
            "--archive-host",
            "tape1",
            "--archive-dataset",
            "tape/home",
            "--user",
            "backup",
        ]);
        let mut config = BackupConfig::default();
        cli.apply(&mut config);
        assert_eq!(config.dataset, "pool/home");
        assert_eq!(config.nearline.host, "nas1");
        assert_eq!(config.nearline.dataset, "nas/home");
        assert_eq!(config.archive.host, "tape1");
        assert_eq!(config.archive.dataset, "tape/home");
        assert_eq!(config.nearline.user, "backup");
        assert_eq!(config.archive.user, "backup");
    }

    #[test]
    fn test_absent_flags_keep_config() {
        let cli = Cli::parse_from(["zbackup", "--dry-run"]);
        let mut config = BackupConfig::default();
        cli.apply(&mut config);
        assert_eq!(config, BackupConfig::default());
        assert_eq!(cli.mode(), ExecMode::DryRun);
    }

    #[test]
    fn test_debug_levels() {
        assert_eq!(Cli::parse_from(["zbackup", "--debug", "1"]).log_filter(), "debug");
        assert_eq!(
            Cli::parse_from(["zbackup", "--debug", "2"]).log_filter(),
            "info,zbackup=trace"
        );
        assert_eq!(Cli::parse_from(["zbackup", "-d", "3"]).log_filter(), "trace");
        assert!(!Cli::parse_from(["zbackup", "-d", "1"]).run_options().verbose);
        assert!(Cli::parse_from(["zbackup", "-d", "2"]).run_options().verbose);
    }

    #[test]
    fn test_debug_out_of_range() {
        assert!(Cli::try_parse_from(["zbackup", "--debug", "4"]).is_err());
        assert!(Cli::try_parse_from(["zbackup", "--debug", "0"]).is_err());
    }
}
