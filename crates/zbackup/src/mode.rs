//! Execution mode shared by every stage of a run.

use std::io::IsTerminal;

/// Whether state-changing operations are executed or only traced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecMode {
    /// Execute everything.
    #[default]
    Execute,
    /// Run read-only queries, print every mutating command instead of running it.
    DryRun,
}

/// Per-run behaviour switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunOptions {
    /// Execute or trace.
    pub mode: ExecMode,
    /// Log reconciliation state (remote and local identity orderings).
    pub verbose: bool,
    /// Probe transfer size and draw progress.
    pub interactive: bool,
}

impl RunOptions {
    /// Options for an unattended run: no progress, not verbose.
    pub fn execute() -> Self {
        Self::default()
    }

    /// Interactive when standard error is a terminal.
    pub fn detect(mode: ExecMode, verbose: bool) -> Self {
        Self {
            mode,
            verbose,
            interactive: std::io::stderr().is_terminal(),
        }
    }

    /// Whether mutations are only printed.
    pub fn is_dry_run(&self) -> bool {
        self.mode == ExecMode::DryRun
    }

    /// Print a command a dry run skips.
    pub fn trace(&self, command: &str) {
        println!("+ {}", command);
    }
}
