//! Dataset and file backups of VM disks.
//!
//! The engine runs on the backup node: the local driver owns the backup
//! datasets and files, the remote driver is the host of the backed up VM
//! (the local host itself when no host is given), and the transfer streams
//! between the two. Backup snapshots carry the `is-<epoch>` prefix.

mod dataset;
mod file;
pub mod metadata;

pub use file::file_checksum;

use crate::action::{unix_now, ActionContext};
use crate::CoreError;
use esrep_driver::{CancelToken, DriverError, Drivers};
use esrep_types::{snapshot_name, PropertyKey, SnapshotPrefix};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Properties copied onto the empty dataset that replaces a restore target.
const KEEP_PROPERTIES: &[&str] = &[
    "type",
    "volsize",
    "volblocksize",
    "compression",
    "refreservation",
    "reservation",
    "quota",
    "recordsize",
    "zoned",
];

#[derive(Debug, Clone)]
pub struct DsCreate {
    /// `<source dataset>@is-<epoch>` on the VM host.
    pub snapshot: String,
    /// Backup dataset, at least three levels deep.
    pub destination: String,
    /// Stored in `es:bkpname` on the new snapshot.
    pub name: String,
    pub metadata: Option<PathBuf>,
    pub json: Option<Value>,
    pub fsfreeze: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DsDelete {
    pub snapshots: Vec<String>,
    pub metadata: Option<PathBuf>,
    /// Snapshots on the VM host that anchored the deleted backups.
    pub last_snapshots: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DsRestore {
    pub snapshot: String,
    pub destination: String,
}

#[derive(Debug, Clone)]
pub struct FileCreate {
    pub source: String,
    pub filename: PathBuf,
    pub metadata: Option<PathBuf>,
    pub json: Option<Value>,
    pub fsfreeze: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FileDelete {
    pub filenames: Vec<PathBuf>,
    pub metadata: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct FileRestore {
    pub destination: String,
    pub filename: PathBuf,
    /// Expected SHA-1 of the backup file, hex encoded.
    pub checksum: String,
}

pub struct Backup {
    drivers: Drivers,
    cancel: CancelToken,
    clock: Box<dyn Fn() -> i64>,
    compression: Option<String>,
    limit: Option<String>,

    // journal read by the cleanup steps
    update_snapshots: Vec<Value>,
    last_snapshot: Option<String>,
    deleted_last_snapshot_names: Vec<String>,
    metadata_file: Option<PathBuf>,
    deleted_metadata: Option<PathBuf>,
    affected_datasets: Vec<String>,
    deleted_snapshots: Vec<String>,
    deleted_files: Vec<PathBuf>,

    filesystem: bool,
    zoned: bool,
    msg: Option<String>,
}

fn path_value(path: Option<&Path>) -> Value {
    path.map_or(Value::Null, |p| Value::String(p.display().to_string()))
}

/// `path` made absolute against the working directory.
fn absolute(path: &Path) -> Result<PathBuf, CoreError> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Outcome of a best-effort step: signals still abort the action.
fn tolerate(result: Result<(), DriverError>, what: &str) -> Result<bool, CoreError> {
    match result {
        Ok(()) => Ok(true),
        Err(DriverError::Cancelled(signal)) => Err(CoreError::Cancelled(signal)),
        Err(e) => {
            debug!("{what}: {e}");
            Ok(false)
        }
    }
}

impl Backup {
    pub fn new(drivers: Drivers, cancel: CancelToken) -> Self {
        Self {
            drivers,
            cancel,
            clock: Box::new(unix_now),
            compression: None,
            limit: None,
            update_snapshots: Vec::new(),
            last_snapshot: None,
            deleted_last_snapshot_names: Vec::new(),
            metadata_file: None,
            deleted_metadata: None,
            affected_datasets: Vec::new(),
            deleted_snapshots: Vec::new(),
            deleted_files: Vec::new(),
            filesystem: false,
            zoned: false,
            msg: None,
        }
    }

    /// Compression program for file backups.
    #[must_use]
    pub fn with_compression(mut self, compression: Option<String>) -> Self {
        self.compression = compression;
        self
    }

    /// Bandwidth limit for transfers.
    #[must_use]
    pub fn with_limit(mut self, limit: Option<String>) -> Self {
        self.limit = limit;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: impl Fn() -> i64 + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Only a remote VM host is checked; a local one is always reachable.
    fn check_host(&self) -> Result<(), CoreError> {
        if self.drivers.remote.is_remote() {
            crate::check_reachable(self.drivers.remote.as_ref())?;
        }
        Ok(())
    }

    /// Local dataset or snapshot must exist (rc 4).
    fn check_dataset(&self, dataset: &str) -> Result<(), CoreError> {
        match self.drivers.local.dataset_exists(dataset) {
            Ok(true) => Ok(()),
            Ok(false) => Err(CoreError::DatasetCheck(format!(
                "Invalid dataset (cannot open '{dataset}': dataset does not exist)"
            ))),
            Err(DriverError::Cancelled(signal)) => Err(CoreError::Cancelled(signal)),
            Err(e) => Err(CoreError::DatasetCheck(format!(
                "Invalid dataset ({})",
                e.message().map_or_else(|| e.to_string(), str::to_owned)
            ))),
        }
    }

    /// Full names of backup snapshots on `dataset`, oldest first.
    fn list_backup_snapshots(&self, dataset: &str, remote: bool) -> Result<Vec<String>, CoreError> {
        Ok(self
            .drivers
            .host(remote)
            .list_snapshots(dataset)?
            .into_iter()
            .filter(|snapshot| SnapshotPrefix::Backup.matches(snapshot))
            .collect())
    }

    /// `{name, written}` of the backup snapshots left on datasets touched by
    /// `ds_delete`.
    fn snapshot_sizes(&self) -> Result<Vec<Value>, CoreError> {
        let mut sizes = Vec::new();
        if self.deleted_snapshots.is_empty() {
            return Ok(sizes);
        }

        for dataset in &self.affected_datasets {
            match self.drivers.local.list_snapshot_sizes(dataset) {
                Ok(list) => sizes.extend(
                    list.into_iter()
                        .filter(|(name, _)| SnapshotPrefix::Backup.matches(name))
                        .map(|(name, written)| serde_json::json!({"name": name, "written": written})),
                ),
                Err(DriverError::Cancelled(signal)) => return Err(CoreError::Cancelled(signal)),
                Err(e) => debug!("listing snapshots of {dataset}: {e}"),
            }
        }
        Ok(sizes)
    }

    fn store_metadata(&mut self, path: &Path, data: &Value) -> Result<(), CoreError> {
        metadata::store(path, data)?;
        self.metadata_file = Some(path.to_path_buf());
        Ok(())
    }

    fn remove_metadata(&mut self, path: &Path) {
        if metadata::remove_silent(path) {
            self.deleted_metadata = Some(path.to_path_buf());
        }
        self.metadata_file = None;
    }

    /// Move the restore target aside as `<dataset>-esbackup-<epoch>` and put
    /// an empty dataset with the same key properties in its place. Returns the
    /// archive name.
    fn archive_and_create_empty(&mut self, dataset: &str) -> Result<String, CoreError> {
        let host = self.drivers.remote.as_ref();
        let mut properties = host.get_properties(dataset, KEEP_PROPERTIES)?;
        let kind = properties.remove("type").unwrap_or_default();
        let zoned = properties.remove("zoned");

        let kind = if kind == "volume" {
            properties.remove("volsize").unwrap_or_default()
        } else {
            self.zoned = zoned.as_deref() == Some("on");
            self.filesystem = true;
            // children only; the dataset itself is handled below
            host.set_property(dataset, PropertyKey::ZONED, "off", true)?;
            kind
        };

        if self.zoned {
            host.set_property(dataset, PropertyKey::ZONED, "off", false)?;
            properties.insert(PropertyKey::ZONED.to_owned(), "on".to_owned());
        }

        let archive = format!("{dataset}-esbackup-{}", (self.clock)());
        host.rename_dataset(dataset, &archive, false)?;

        if let Err(e) = host.create_dataset(dataset, &kind, &properties) {
            warn!("cannot create empty {dataset}, restoring it from {archive}: {e}");
            host.rename_dataset(&archive, dataset, self.zoned)?;
            if self.filesystem {
                host.set_property(dataset, PropertyKey::ZONED, "on", true)?;
            }
            return Err(e.into());
        }
        info!("archived {dataset} as {archive}");
        Ok(archive)
    }

    /// Drop the archive after a successful restore, or put it back in place
    /// of the half-restored dataset.
    fn settle_restore(
        &self,
        outcome: Result<(), CoreError>,
        archive: &str,
        destination: &str,
    ) -> Result<(), CoreError> {
        let host = self.drivers.remote.as_ref();
        match outcome {
            Ok(()) => {
                host.destroy(archive, true)?;
                Ok(())
            }
            Err(e) => {
                warn!("restore into {destination} failed, rolling back: {e}");
                host.destroy(destination, true)?;
                host.rename_dataset(archive, destination, self.zoned)?;
                if self.filesystem {
                    host.set_property(destination, PropertyKey::ZONED, "on", true)?;
                }
                Err(e)
            }
        }
    }

    /// Receive into the freshly created destination and move the archived
    /// children back under it.
    fn restore_into(
        &self,
        archive: &str,
        destination: &str,
        receive: impl FnOnce(&Drivers) -> Result<(), DriverError>,
    ) -> Result<(), CoreError> {
        receive(&self.drivers)?;
        self.drivers
            .remote
            .rename_children(archive, destination, self.filesystem)?;
        Ok(())
    }

    fn last_snapshot_name(&self) -> Value {
        self.last_snapshot
            .as_deref()
            .map_or(Value::Null, |s| Value::String(snapshot_name(s).to_owned()))
    }
}

impl ActionContext for Backup {
    fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    fn take_msg(&mut self) -> Option<String> {
        self.msg.take()
    }
}
