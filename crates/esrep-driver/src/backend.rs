use crate::DriverError;
use std::collections::BTreeMap;
use std::path::Path;

/// ZFS, SMF and VM primitives of one host.
///
/// Dataset, snapshot and FMRI arguments are passed as their text form.
/// Existence checks map the tool's "not found" message to `Ok(false)`; every
/// other failure is an error.
pub trait HostDriver {
    /// Short label for logs: `local`, `ssh:<host>`, `mock:<node>`.
    fn name(&self) -> String;

    fn is_remote(&self) -> bool;

    /// Node hostname. Doubles as the reachability probe for remote hosts.
    fn hostname(&self) -> Result<String, DriverError>;

    // ZFS

    /// Raw property value; `-` when the property is unset.
    fn get_property(&self, dataset: &str, name: &str) -> Result<String, DriverError>;

    /// With `children`, the property is set on every descendant but not on
    /// `dataset` itself.
    fn set_property(
        &self,
        dataset: &str,
        name: &str,
        value: &str,
        children: bool,
    ) -> Result<(), DriverError>;

    fn clear_property(&self, dataset: &str, name: &str) -> Result<(), DriverError>;

    /// Unset properties are omitted and `0` is reported as `none`.
    fn get_properties(
        &self,
        dataset: &str,
        names: &[&str],
    ) -> Result<BTreeMap<String, String>, DriverError>;

    /// Returns the helper output (filesystem freeze messages, if any).
    fn create_snapshot(
        &self,
        snapshot: &str,
        metadata: Option<&str>,
        fsfreeze: Option<&str>,
    ) -> Result<String, DriverError>;

    /// `target` is a dataset or `dataset@a,b,c`. `force` destroys recursively.
    fn destroy(&self, target: &str, force: bool) -> Result<(), DriverError>;

    fn dataset_exists(&self, dataset: &str) -> Result<bool, DriverError>;

    fn mount(&self, dataset: &str) -> Result<(), DriverError>;

    fn unmount(&self, dataset: &str, force: bool) -> Result<(), DriverError>;

    /// Full snapshot names, oldest first.
    fn list_snapshots(&self, dataset: &str) -> Result<Vec<String>, DriverError>;

    /// Full snapshot names with their `written` size, oldest first.
    fn list_snapshot_sizes(&self, dataset: &str) -> Result<Vec<(String, u64)>, DriverError>;

    /// With `set_zoned`, the renamed dataset gets `zoned=on` again.
    fn rename_dataset(&self, current: &str, new: &str, set_zoned: bool)
        -> Result<(), DriverError>;

    /// Move the direct children of `current` under `new`.
    fn rename_children(
        &self,
        current: &str,
        new: &str,
        set_zoned: bool,
    ) -> Result<(), DriverError>;

    /// `kind` is `filesystem`, or the volume size for a zvol.
    fn create_dataset(
        &self,
        dataset: &str,
        kind: &str,
        properties: &BTreeMap<String, String>,
    ) -> Result<(), DriverError>;

    fn destroy_all_snapshots(&self, dataset: &str) -> Result<(), DriverError>;

    // VM

    fn vm_json(&self, uuid: &str) -> Result<String, DriverError>;

    fn vm_create(&self, json: &str) -> Result<(), DriverError>;

    fn vm_remove_indestructible(&self, uuid: &str) -> Result<(), DriverError>;

    fn vm_delete(&self, uuid: &str) -> Result<(), DriverError>;

    fn vm_start(&self, uuid: &str) -> Result<(), DriverError>;

    fn vm_stop(&self, uuid: &str, force: bool) -> Result<(), DriverError>;

    // SMF

    fn service_status(&self, fmri: &str, columns: &[&str]) -> Result<String, DriverError>;

    fn service_enable(&self, fmri: &str) -> Result<(), DriverError>;

    fn service_disable(&self, fmri: &str) -> Result<(), DriverError>;

    fn service_restart(&self, fmri: &str) -> Result<(), DriverError>;

    fn service_validate(&self, manifest: &Path) -> Result<(), DriverError>;

    fn service_import(&self, fmri: &str, manifest: &Path) -> Result<(), DriverError>;

    fn service_export(&self, fmri: &str) -> Result<String, DriverError>;

    fn service_delete(&self, fmri: &str) -> Result<(), DriverError>;

    fn service_save(&self, fmri: &str) -> Result<String, DriverError>;

    fn service_exists(&self, fmri: &str) -> Result<bool, DriverError>;

    fn service_instance_import(&self, fmri: &str, manifest: &Path) -> Result<(), DriverError>;

    fn service_instance_delete(&self, fmri: &str, instance: &str) -> Result<(), DriverError>;

    fn service_instance_exists(&self, fmri: &str) -> Result<bool, DriverError>;
}

/// Streams between the local host and its peer (the local host itself when
/// there is no peer). The receiving side is named by the operation.
pub trait TransferDriver {
    fn peer(&self) -> Option<&str>;

    /// Replication: receive peer `snapshot` into local `dataset`, incrementally
    /// from peer snapshot `incremental` when given.
    fn send_recv(
        &self,
        snapshot: &str,
        dataset: &str,
        incremental: Option<&str>,
        limit: Option<&str>,
    ) -> Result<(), DriverError>;

    /// Copy the quota of peer volume `source` onto local volume `destination`.
    fn sync_quota(&self, source: &str, destination: &str) -> Result<(), DriverError>;

    /// Backup: receive peer `snapshot` into local `dataset`.
    fn backup_dataset(
        &self,
        snapshot: &str,
        dataset: &str,
        incremental: Option<&str>,
        limit: Option<&str>,
    ) -> Result<(), DriverError>;

    /// Restore: send local `snapshot` into peer `dataset`.
    fn restore_dataset(&self, snapshot: &str, dataset: &str) -> Result<(), DriverError>;

    /// Stream peer `source` into local `file`.
    fn backup_to_file(
        &self,
        source: &str,
        file: &Path,
        compression: Option<&str>,
        limit: Option<&str>,
        fsfreeze: Option<&str>,
    ) -> Result<(), DriverError>;

    /// Stream local `file` into peer `dataset`.
    fn restore_file(&self, file: &Path, dataset: &str) -> Result<(), DriverError>;
}

/// The drivers an engine runs with.
pub struct Drivers {
    pub local: Box<dyn HostDriver>,
    pub remote: Box<dyn HostDriver>,
    pub transfer: Box<dyn TransferDriver>,
}

impl Drivers {
    pub fn new(
        local: impl HostDriver + 'static,
        remote: impl HostDriver + 'static,
        transfer: impl TransferDriver + 'static,
    ) -> Self {
        Self {
            local: Box::new(local),
            remote: Box::new(remote),
            transfer: Box::new(transfer),
        }
    }

    pub fn host(&self, remote: bool) -> &dyn HostDriver {
        if remote {
            self.remote.as_ref()
        } else {
            self.local.as_ref()
        }
    }
}
