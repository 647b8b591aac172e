//! Copy of ancillary manifest files to the nearline host.

use crate::command::{CommandLine, Shell, SshConfig};
use crate::config::ManifestConfig;
use crate::error::{BackupError, BackupResult};
use crate::marker::Target;
use crate::mode::RunOptions;

/// rsync of the configured manifest files, with their paths preserved.
#[derive(Debug, Clone)]
pub struct ManifestSync {
    program: String,
    config: ManifestConfig,
    target: Target,
    ssh: SshConfig,
}

impl ManifestSync {
    /// Copy `config.sources` into `config.destination` on `target`'s host.
    pub fn new(config: ManifestConfig, target: Target, ssh: SshConfig) -> Self {
        Self {
            program: "rsync".to_string(),
            config,
            target,
            ssh,
        }
    }

    /// Use another rsync executable.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// `rsync -a --relative -e '<ssh>' <sources> user@host:<destination>`.
    pub fn command(&self) -> CommandLine {
        let remote_shell = CommandLine::new(&self.ssh.program)
            .args(self.ssh.options.iter().cloned())
            .render();
        CommandLine::new(&self.program)
            .args(["-a", "--relative", "-e"])
            .arg(remote_shell)
            .args(self.config.sources.iter().map(|p| p.display().to_string()))
            .arg(format!(
                "{}:{}",
                self.target.destination(),
                self.config.destination
            ))
    }

    /// Run the copy; a dry run only prints it.
    pub async fn sync(&self, options: &RunOptions) -> BackupResult<()> {
        if self.config.sources.is_empty() {
            return Ok(());
        }
        let cmd = self.command();
        if options.is_dry_run() {
            options.trace(&cmd.render());
            return Ok(());
        }
        Shell::local().run(&cmd).await.map_err(|e| match e {
            BackupError::Io(source) => BackupError::Transfer {
                msg: format!("cannot run {}: {}", self.program, source),
            },
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::ExecMode;
    use std::path::PathBuf;

    fn sync() -> ManifestSync {
        ManifestSync::new(
            ManifestConfig {
                sources: vec![PathBuf::from("/etc/fstab"), PathBuf::from("/etc/zfs/zpool.cache")],
                destination: "/srv/manifests".into(),
            },
            Target {
                user: "root".into(),
                host: "nas1".into(),
                dataset: "backup/tank".into(),
            },
            SshConfig::default(),
        )
    }

    #[test]
    fn test_command_line() {
        assert_eq!(
            sync().command().render(),
            "rsync -a --relative -e 'ssh -o BatchMode=yes' /etc/fstab /etc/zfs/zpool.cache root@nas1:/srv/manifests"
        );
    }

    #[tokio::test]
    async fn test_dry_run_does_not_execute() {
        let options = RunOptions {
            mode: ExecMode::DryRun,
            ..Default::default()
        };
        let sync = sync().with_program("/nonexistent/rsync");
        sync.sync(&options).await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_is_reported() {
        let sync = sync().with_program("false");
        let err = sync.sync(&RunOptions::execute()).await.unwrap_err();
        assert!(matches!(err, BackupError::CommandFailed { .. }));

        let missing = self::sync().with_program("/nonexistent/rsync");
        let err = missing.sync(&RunOptions::execute()).await.unwrap_err();
        assert!(matches!(err, BackupError::Transfer { .. }));
    }
}
