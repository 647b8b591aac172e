//! External command execution, locally or on a remote host over ssh.

use std::fmt;
use std::process::Stdio;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::backend::{ReceiveSink, SendStream};
use crate::error::{BackupError, BackupResult};

/// Where a command is executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// On this machine.
    Local,
    /// On `user@host` through ssh.
    Remote {
        /// Login user.
        user: String,
        /// Host name.
        host: String,
    },
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Local => write!(f, "local"),
            Location::Remote { user, host } => write!(f, "{}@{}", user, host),
        }
    }
}

/// How to reach remote hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshConfig {
    /// ssh executable.
    pub program: String,
    /// Extra options passed before the destination.
    pub options: Vec<String>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            options: vec!["-o".to_string(), "BatchMode=yes".to_string()],
        }
    }
}

/// A program with its arguments, rendered shell-safe for tracing and ssh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
}

impl CommandLine {
    /// Start a command line for `program`.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// The program name.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// The arguments.
    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Single shell-quoted string.
    pub fn render(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|s| shell_quote(s))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Quote `s` for a POSIX shell. Plain words are left as is.
pub fn shell_quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./@#%:=,+".contains(c));
    if plain {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

/// Runs command lines at one location.
#[derive(Debug, Clone)]
pub struct Shell {
    location: Location,
    ssh: SshConfig,
}

impl Shell {
    /// Shell on this machine.
    pub fn local() -> Self {
        Self {
            location: Location::Local,
            ssh: SshConfig::default(),
        }
    }

    /// Shell on `user@host`.
    pub fn remote(user: impl Into<String>, host: impl Into<String>, ssh: SshConfig) -> Self {
        Self {
            location: Location::Remote {
                user: user.into(),
                host: host.into(),
            },
            ssh,
        }
    }

    /// Where commands run.
    pub fn location(&self) -> &Location {
        &self.location
    }

    /// The command line actually executed on this machine: `cmd` itself
    /// locally, or `ssh [options] user@host '<cmd>'` for a remote.
    pub fn wrap(&self, cmd: &CommandLine) -> CommandLine {
        match &self.location {
            Location::Local => cmd.clone(),
            Location::Remote { user, host } => CommandLine::new(&self.ssh.program)
                .args(self.ssh.options.iter().cloned())
                .arg(format!("{}@{}", user, host))
                .arg(cmd.render()),
        }
    }

    fn process(&self, cmd: &CommandLine) -> Command {
        let wrapped = self.wrap(cmd);
        let mut process = Command::new(wrapped.program());
        process.args(wrapped.arguments()).kill_on_drop(true);
        process
    }

    /// Run `cmd` to completion and return its standard output.
    pub async fn output(&self, cmd: &CommandLine) -> BackupResult<String> {
        debug!(location = %self.location, "exec: {}", cmd);
        let output = self
            .process(cmd)
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            return Err(self.failure(cmd, output.status, &output.stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run `cmd` and discard its output.
    pub async fn run(&self, cmd: &CommandLine) -> BackupResult<()> {
        self.output(cmd).await.map(|_| ())
    }

    /// Spawn `cmd` with its standard output exposed as a stream.
    pub fn spawn_reader(&self, cmd: &CommandLine) -> BackupResult<SendStream> {
        debug!(location = %self.location, "spawn reader: {}", cmd);
        let mut child = self
            .process(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let stdout = child.stdout.take().ok_or_else(|| BackupError::Transfer {
            msg: format!("no stdout for `{}`", cmd),
        })?;
        let shell = self.clone();
        let cmd = cmd.clone();
        let completion: BoxFuture<'static, BackupResult<()>> = Box::pin(async move {
            let output = child.wait_with_output().await?;
            if !output.status.success() {
                return Err(shell.failure(&cmd, output.status, &output.stderr));
            }
            Ok(())
        });
        Ok(SendStream {
            reader: Box::new(stdout),
            completion,
        })
    }

    /// Spawn `cmd` with its standard input exposed as a sink.
    pub fn spawn_writer(&self, cmd: &CommandLine) -> BackupResult<ReceiveSink> {
        debug!(location = %self.location, "spawn writer: {}", cmd);
        let mut child = self
            .process(cmd)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        let stdin = child.stdin.take().ok_or_else(|| BackupError::Transfer {
            msg: format!("no stdin for `{}`", cmd),
        })?;
        let shell = self.clone();
        let cmd = cmd.clone();
        let completion: BoxFuture<'static, BackupResult<()>> = Box::pin(async move {
            let output = child.wait_with_output().await?;
            if !output.status.success() {
                return Err(shell.failure(&cmd, output.status, &output.stderr));
            }
            Ok(())
        });
        Ok(ReceiveSink {
            writer: Box::new(stdin),
            completion,
        })
    }

    fn failure(&self, cmd: &CommandLine, status: std::process::ExitStatus, stderr: &[u8]) -> BackupError {
        BackupError::CommandFailed {
            location: self.location.to_string(),
            command: cmd.render(),
            status: status.to_string(),
            stderr: String::from_utf8_lossy(stderr).trim().to_string(),
        }
    }
}
