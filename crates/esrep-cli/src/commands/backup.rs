//! `esbackup` actions, run on the backup node.

use super::read_json_input;
use crate::{failure, load_config};
use clap::{Args, Subcommand};
use esrep_core::{
    Backup, DsCreate, DsDelete, DsRestore, FileCreate, FileDelete, FileRestore, Response,
};
use esrep_driver::{CancelToken, CommandRunner, Drivers, ShellHost, ShellTransfer, SshTarget, Target};
use esrep_types::EsrepConfig;
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Host of the backed up VM; the local host when omitted.
#[derive(Debug, Clone, Default, Args)]
pub struct HostArgs {
    /// Address of the VM host, as passed to SSH.
    #[arg(short = 'H', long)]
    pub host: Option<String>,
}

#[derive(Debug, Clone, Default, Args)]
pub struct MetadataArgs {
    /// Metadata sidecar file written next to the backup.
    #[arg(short = 'm', long)]
    pub metadata: Option<PathBuf>,

    /// JSON content of the metadata file (`-` reads stdin).
    #[arg(short = 'j', long = "json-file", requires = "metadata")]
    pub json_file: Option<PathBuf>,
}

impl MetadataArgs {
    fn json(&self) -> Result<Option<Value>, String> {
        self.json_file.as_deref().map(read_json_input).transpose()
    }
}

#[derive(Debug, Clone, Args)]
pub struct DsCreateArgs {
    /// New snapshot of the VM disk, `<dataset>@is-<epoch>`.
    #[arg(short = 's', long)]
    pub snapshot: String,
    /// Backup dataset, at least three levels deep.
    #[arg(short = 'd', long)]
    pub destination: String,
    /// Backup name stored on the snapshot.
    #[arg(short = 'n', long)]
    pub name: String,
    /// Command run inside the VM around the snapshot.
    #[arg(short = 'F', long)]
    pub fsfreeze: Option<String>,
    /// Bandwidth limit for the transfer.
    #[arg(short = 'l', long = "bwlimit")]
    pub limit: Option<String>,
    #[command(flatten)]
    pub metadata: MetadataArgs,
    #[command(flatten)]
    pub host: HostArgs,
}

#[derive(Debug, Clone, Args)]
pub struct DsDeleteArgs {
    /// Backup snapshots to delete.
    #[arg(short = 's', long = "snapshot", required = true, num_args = 1..)]
    pub snapshots: Vec<String>,
    /// Snapshots on the VM host that anchored the deleted backups.
    #[arg(short = 'r', long = "last-snapshot", num_args = 1..)]
    pub last_snapshots: Vec<String>,
    /// Metadata sidecar file to remove.
    #[arg(short = 'm', long)]
    pub metadata: Option<PathBuf>,
    #[command(flatten)]
    pub host: HostArgs,
}

#[derive(Debug, Clone, Args)]
pub struct DsRestoreArgs {
    /// Backup snapshot to restore.
    #[arg(short = 's', long)]
    pub snapshot: String,
    /// Dataset on the VM host replaced by the backup.
    #[arg(short = 'd', long)]
    pub destination: String,
    #[command(flatten)]
    pub host: HostArgs,
}

#[derive(Debug, Clone, Args)]
pub struct FileCreateArgs {
    /// Dataset or snapshot on the VM host.
    #[arg(short = 's', long)]
    pub source: String,
    /// Backup file, `<backup dir>/<vm>/<disk>/<file>`.
    #[arg(short = 'f', long)]
    pub file: PathBuf,
    /// Compression program for the stream (e.g. `gzip`).
    #[arg(short = 'c', long)]
    pub compression: Option<String>,
    /// Command run inside the VM around the snapshot.
    #[arg(short = 'F', long)]
    pub fsfreeze: Option<String>,
    /// Bandwidth limit for the transfer.
    #[arg(short = 'l', long = "bwlimit")]
    pub limit: Option<String>,
    #[command(flatten)]
    pub metadata: MetadataArgs,
    #[command(flatten)]
    pub host: HostArgs,
}

#[derive(Debug, Clone, Args)]
pub struct FileDeleteArgs {
    /// Backup files to delete.
    #[arg(short = 'f', long = "file", required = true, num_args = 1..)]
    pub files: Vec<PathBuf>,
    /// Metadata sidecar file to remove.
    #[arg(short = 'm', long)]
    pub metadata: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
pub struct FileRestoreArgs {
    /// Backup file to restore.
    #[arg(short = 'f', long)]
    pub file: PathBuf,
    /// Dataset on the VM host replaced by the backup.
    #[arg(short = 'd', long)]
    pub destination: String,
    /// Expected SHA-1 of the backup file.
    #[arg(short = 'c', long)]
    pub checksum: String,
    #[command(flatten)]
    pub host: HostArgs,
}

#[derive(Debug, Subcommand)]
#[command(rename_all = "snake_case")]
pub enum BackupCommand {
    /// Back up a VM disk snapshot into a backup dataset.
    #[command(alias = "ds-create")]
    DsCreate(DsCreateArgs),
    /// Delete dataset backups.
    #[command(alias = "ds-delete")]
    DsDelete(DsDeleteArgs),
    /// Restore a dataset backup over a VM disk.
    #[command(alias = "ds-restore")]
    DsRestore(DsRestoreArgs),
    /// Back up a VM disk into a file.
    #[command(alias = "file-create")]
    FileCreate(FileCreateArgs),
    /// Delete file backups.
    #[command(alias = "file-delete")]
    FileDelete(FileDeleteArgs),
    /// Restore a file backup over a VM disk.
    #[command(alias = "file-restore")]
    FileRestore(FileRestoreArgs),
}

pub fn run(command: BackupCommand, config: Option<&Path>, cancel: CancelToken) -> Response {
    match execute(command, config, cancel) {
        Ok(response) => response,
        Err(msg) => failure(msg),
    }
}

fn execute(
    command: BackupCommand,
    config: Option<&Path>,
    cancel: CancelToken,
) -> Result<Response, String> {
    let config = load_config(config)?;
    let response = match command {
        BackupCommand::DsCreate(args) => {
            let request = DsCreate {
                snapshot: args.snapshot,
                destination: args.destination,
                name: args.name,
                json: args.metadata.json()?,
                metadata: args.metadata.metadata,
                fsfreeze: args.fsfreeze,
            };
            engine(&config, args.host, cancel)
                .with_limit(args.limit)
                .ds_create(request)
        }
        BackupCommand::DsDelete(args) => engine(&config, args.host, cancel).ds_delete(DsDelete {
            snapshots: args.snapshots,
            metadata: args.metadata,
            last_snapshots: args.last_snapshots,
        }),
        BackupCommand::DsRestore(args) => engine(&config, args.host, cancel).ds_restore(DsRestore {
            snapshot: args.snapshot,
            destination: args.destination,
        }),
        BackupCommand::FileCreate(args) => {
            let request = FileCreate {
                source: args.source,
                filename: args.file,
                json: args.metadata.json()?,
                metadata: args.metadata.metadata,
                fsfreeze: args.fsfreeze,
            };
            engine(&config, args.host, cancel)
                .with_limit(args.limit)
                .with_compression(args.compression)
                .file_create(request)
        }
        BackupCommand::FileDelete(args) => {
            engine(&config, HostArgs::default(), cancel).file_delete(FileDelete {
                filenames: args.files,
                metadata: args.metadata,
            })
        }
        BackupCommand::FileRestore(args) => {
            engine(&config, args.host, cancel).file_restore(FileRestore {
                destination: args.destination,
                filename: args.file,
                checksum: args.checksum,
            })
        }
    };
    Ok(response)
}

fn engine(config: &EsrepConfig, host: HostArgs, cancel: CancelToken) -> Backup {
    Backup::new(drivers(config, host.host, &cancel), cancel)
}

/// Without a VM host the VM side is the local host as well.
fn drivers(config: &EsrepConfig, host: Option<String>, cancel: &CancelToken) -> Drivers {
    let helper = config.helpers.esbackup.clone();
    let vm_target = host.as_ref().map_or(Target::Local, |host| {
        Target::Ssh(SshTarget::new(host.clone(), config.ssh.clone()))
    });
    Drivers::new(
        ShellHost::new(CommandRunner::local(cancel.clone()), helper.clone()),
        ShellHost::new(CommandRunner::new(vm_target, cancel.clone()), helper.clone()),
        ShellTransfer::new(CommandRunner::local(cancel.clone()), helper, host),
    )
}
