#![warn(missing_docs)]

//! zbackup binary: one backup run per invocation, usually from cron.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use zbackup::cli::Cli;
use zbackup::lock::{LockOutcome, RunLock};
use zbackup::{BackupConfig, BackupError, RunController, RunRequest, ZfsBackend};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_filter()));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = BackupConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    cli.apply(&mut config);
    config.validate()?;
    let options = cli.run_options();

    let _lock = match RunLock::acquire(&config.lock_path)? {
        LockOutcome::Acquired(lock) => {
            info!(pid = lock.pid(), "holding run lock {}", lock.path().display());
            lock
        }
        LockOutcome::Held { pid } => {
            warn!(pid, "another run is in progress, skipping");
            return Ok(());
        }
    };

    info!(
        dataset = %config.dataset,
        nearline = %config.nearline.target(),
        archive = %config.archive.target(),
        dry_run = options.is_dry_run(),
        "zbackup starting"
    );

    let local = Arc::new(ZfsBackend::local(&config.zfs_program));
    let nearline = Arc::new(ZfsBackend::remote(
        &config.nearline.user,
        &config.nearline.host,
        &config.zfs_program,
        config.ssh.clone(),
    ));
    let archive = Arc::new(ZfsBackend::remote(
        &config.archive.user,
        &config.archive.host,
        &config.zfs_program,
        config.ssh.clone(),
    ));
    let controller = RunController::new(config, options, local, nearline, archive);
    let request = RunRequest {
        now: Local::now().naive_local(),
        force_archive: cli.archive,
    };

    let report = tokio::select! {
        report = controller.run(request) => report?,
        signal = shutdown_signal() => {
            signal?;
            return Err(BackupError::Cancelled.into());
        }
    };

    info!(
        marker = %report.marker.name(),
        rotated = report.rotation.destroyed.len(),
        nearline_bytes = report.nearline.bytes,
        archived = report.archive.is_some(),
        "zbackup finished"
    );
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        ctrl_c = tokio::signal::ctrl_c() => ctrl_c?,
        _ = terminate.recv() => {}
    }
    warn!("signal received, cancelling run");
    Ok(())
}
