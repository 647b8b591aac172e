//! `zfs` command-line backend.

use async_trait::async_trait;
use tracing::info;

use crate::backend::{Mutation, ReceiveSink, SendSpec, SendStream, StorageBackend};
use crate::command::{CommandLine, Shell, SshConfig};
use crate::error::{BackupError, BackupResult};
use crate::marker::{marker_name, parent_dataset, reference_name, split_name, Guid};
use crate::marker::{DurableReference, Marker};

const LIST_COLUMNS: &str = "name,guid,createtxg";

/// Snapshot/bookmark operations through the `zfs` CLI on one host.
#[derive(Debug, Clone)]
pub struct ZfsBackend {
    shell: Shell,
    zfs: String,
}

impl ZfsBackend {
    /// Backend for datasets on this machine.
    pub fn local(zfs: impl Into<String>) -> Self {
        Self {
            shell: Shell::local(),
            zfs: zfs.into(),
        }
    }

    /// Backend for datasets on `user@host`, reached through ssh.
    pub fn remote(
        user: impl Into<String>,
        host: impl Into<String>,
        zfs: impl Into<String>,
        ssh: SshConfig,
    ) -> Self {
        Self {
            shell: Shell::remote(user, host, ssh),
            zfs: zfs.into(),
        }
    }

    fn zfs(&self) -> CommandLine {
        CommandLine::new(&self.zfs)
    }

    /// `zfs list -H -p -o name,guid,createtxg -t <kind> -s createtxg -d 1 <dataset>`
    pub fn list_cmd(&self, kind: &str, dataset: &str) -> CommandLine {
        self.zfs()
            .args(["list", "-H", "-p", "-o", LIST_COLUMNS, "-t", kind])
            .args(["-s", "createtxg", "-d", "1", dataset])
    }

    /// `zfs list` of a single snapshot or bookmark by full name.
    pub fn get_cmd(&self, kind: &str, name: &str) -> CommandLine {
        self.zfs()
            .args(["list", "-H", "-p", "-o", LIST_COLUMNS, "-t", kind, name])
    }

    fn send_args(&self, spec: &SendSpec, dry_run: bool) -> CommandLine {
        let mut cmd = self.zfs().arg("send");
        if dry_run {
            cmd = cmd.args(["-n", "-P"]);
        }
        if let Some(base) = &spec.base {
            cmd = cmd.args(["-i".to_string(), reference_name(&spec.dataset, base)]);
        }
        cmd.arg(marker_name(&spec.dataset, &spec.label))
    }

    /// The command line `op` maps to, before ssh wrapping.
    pub fn mutation_cmd(&self, op: &Mutation<'_>) -> CommandLine {
        match op {
            Mutation::CreateMarker { dataset, label } => {
                self.zfs().args(["snapshot".to_string(), marker_name(dataset, label)])
            }
            Mutation::CreateReference { dataset, label } => self.zfs().args([
                "bookmark".to_string(),
                marker_name(dataset, label),
                reference_name(dataset, label),
            ]),
            Mutation::DestroyMarker {
                dataset,
                label,
                recursive,
            } => {
                let mut cmd = self.zfs().arg("destroy");
                if *recursive {
                    cmd = cmd.arg("-r");
                }
                cmd.arg(marker_name(dataset, label))
            }
            Mutation::RenameMarker { dataset, from, to } => self.zfs().args([
                "rename".to_string(),
                marker_name(dataset, from),
                marker_name(dataset, to),
            ]),
            Mutation::EnsureParent { dataset } => {
                let dataset: &str = dataset;
                let parent = parent_dataset(dataset).unwrap_or(dataset);
                self.zfs().args(["create", "-p", parent])
            }
            Mutation::Send(spec) => self.send_args(spec, false),
            Mutation::Receive { dataset } => self.zfs().args(["receive", "-F", "-u", *dataset]),
        }
    }

    async fn get_marker(&self, dataset: &str, label: &str) -> BackupResult<Marker> {
        let out = self
            .shell
            .output(&self.get_cmd("snapshot", &marker_name(dataset, label)))
            .await?;
        parse_markers(&out)?
            .into_iter()
            .next()
            .ok_or_else(|| BackupError::MarkerNotFound {
                name: marker_name(dataset, label),
            })
    }
}

/// Parse `name\tguid\tcreatetxg` lines of snapshots.
pub fn parse_markers(output: &str) -> BackupResult<Vec<Marker>> {
    parse_rows(output, '@')
        .map(|row| {
            row.map(|(dataset, label, guid, creation)| Marker {
                dataset,
                label,
                guid,
                creation,
            })
        })
        .collect()
}

/// Parse `name\tguid\tcreatetxg` lines of bookmarks.
pub fn parse_references(output: &str) -> BackupResult<Vec<DurableReference>> {
    parse_rows(output, '#')
        .map(|row| {
            row.map(|(dataset, label, guid, creation)| DurableReference {
                dataset,
                label,
                guid,
                creation,
            })
        })
        .collect()
}

fn parse_rows(
    output: &str,
    sep: char,
) -> impl Iterator<Item = BackupResult<(String, String, Guid, u64)>> + '_ {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(move |line| {
            let mut cols = line.split('\t');
            let (name, guid, txg) = match (cols.next(), cols.next(), cols.next()) {
                (Some(name), Some(guid), Some(txg)) => (name, guid, txg),
                _ => {
                    return Err(BackupError::Parse {
                        msg: format!("expected 3 columns: {:?}", line),
                    })
                }
            };
            let (dataset, label) = split_name(name, sep)?;
            let guid: Guid = guid.parse()?;
            let creation = txg.trim().parse::<u64>().map_err(|e| BackupError::Parse {
                msg: format!("invalid createtxg {:?}: {}", txg, e),
            })?;
            Ok((dataset.to_string(), label.to_string(), guid, creation))
        })
}

/// Parse the `size` line of `zfs send -n -P`.
pub fn parse_send_size(output: &str) -> BackupResult<u64> {
    output
        .lines()
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            match (cols.next(), cols.next()) {
                (Some("size"), Some(n)) => Some(n),
                _ => None,
            }
        })
        .last()
        .ok_or_else(|| BackupError::Parse {
            msg: "no size line in send estimate".to_string(),
        })?
        .parse::<u64>()
        .map_err(|e| BackupError::Parse {
            msg: format!("invalid send size: {}", e),
        })
}

fn is_missing_dataset(err: &BackupError) -> bool {
    matches!(err, BackupError::CommandFailed { stderr, .. } if stderr.contains("does not exist"))
}

#[async_trait]
impl StorageBackend for ZfsBackend {
    fn location(&self) -> String {
        self.shell.location().to_string()
    }

    fn preview(&self, op: &Mutation<'_>) -> String {
        self.shell.wrap(&self.mutation_cmd(op)).render()
    }

    async fn dataset_exists(&self, dataset: &str) -> BackupResult<bool> {
        let cmd = self.zfs().args(["list", "-H", "-o", "name", dataset]);
        match self.shell.run(&cmd).await {
            Ok(()) => Ok(true),
            Err(e) if is_missing_dataset(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn ensure_parent(&self, dataset: &str) -> BackupResult<()> {
        if parent_dataset(dataset).is_none() {
            return Ok(());
        }
        self.shell
            .run(&self.mutation_cmd(&Mutation::EnsureParent { dataset }))
            .await
    }

    async fn list_markers(&self, dataset: &str) -> BackupResult<Vec<Marker>> {
        let out = self.shell.output(&self.list_cmd("snapshot", dataset)).await?;
        parse_markers(&out)
    }

    async fn list_references(&self, dataset: &str) -> BackupResult<Vec<DurableReference>> {
        let out = self.shell.output(&self.list_cmd("bookmark", dataset)).await?;
        parse_references(&out)
    }

    async fn create_marker(&self, dataset: &str, label: &str) -> BackupResult<Marker> {
        let cmd = self.mutation_cmd(&Mutation::CreateMarker { dataset, label });
        match self.shell.run(&cmd).await {
            Ok(()) => {}
            Err(BackupError::CommandFailed { stderr, .. }) if stderr.contains("already exists") => {
                return Err(BackupError::AlreadyExists {
                    dataset: dataset.to_string(),
                    label: label.to_string(),
                })
            }
            Err(e) => return Err(e),
        }
        self.get_marker(dataset, label).await
    }

    async fn create_reference(&self, marker: &Marker) -> BackupResult<DurableReference> {
        let dataset = marker.dataset.as_str();
        let label = marker.label.as_str();
        self.shell
            .run(&self.mutation_cmd(&Mutation::CreateReference { dataset, label }))
            .await?;
        let name = reference_name(dataset, label);
        let out = self.shell.output(&self.get_cmd("bookmark", &name)).await?;
        parse_references(&out)?
            .into_iter()
            .next()
            .ok_or(BackupError::MarkerNotFound { name })
    }

    async fn destroy_marker(
        &self,
        dataset: &str,
        label: &str,
        recursive: bool,
    ) -> BackupResult<()> {
        self.shell
            .run(&self.mutation_cmd(&Mutation::DestroyMarker {
                dataset,
                label,
                recursive,
            }))
            .await
    }

    async fn rename_marker(&self, dataset: &str, from: &str, to: &str) -> BackupResult<()> {
        let existing = self.list_markers(dataset).await?;
        if existing.iter().any(|m| m.label == to) {
            return Err(BackupError::RenameCollision {
                dataset: dataset.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        info!(location = %self.shell.location(), "renaming {} -> {}", marker_name(dataset, from), to);
        self.shell
            .run(&self.mutation_cmd(&Mutation::RenameMarker { dataset, from, to }))
            .await
    }

    async fn estimate_send_size(&self, spec: &SendSpec) -> BackupResult<u64> {
        let out = self.shell.output(&self.send_args(spec, true)).await?;
        parse_send_size(&out)
    }

    async fn send_stream(&self, spec: &SendSpec) -> BackupResult<SendStream> {
        self.shell.spawn_reader(&self.send_args(spec, false))
    }

    async fn receive_stream(&self, dataset: &str) -> BackupResult<ReceiveSink> {
        self.shell
            .spawn_writer(&self.mutation_cmd(&Mutation::Receive { dataset }))
    }
}
