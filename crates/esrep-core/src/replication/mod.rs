//! ZFS replication of one VM's disks between a master and a slave host.
//!
//! Actions run on the slave host: the local driver is the slave side, the
//! remote driver and the transfer peer are the master. `clear` runs on the
//! master itself and `reinit` on the old master, which becomes the slave.
//!
//! The replication state lives entirely on the hosts: peering properties on
//! the disks (`esrep:dst:<id>` on master disks, `esrep:src:<id>` on slave
//! disks), `@rs-<id>-<epoch>` snapshots, and the `esrep-sync` SMF instance.

mod failover;
mod service;
mod sync;
mod teardown;

use crate::action::{into_fields, perform, unix_now, Action, ActionContext, Fields, LockPolicy};
use crate::{CoreError, Response};
use esrep_driver::{BundleManifest, CancelToken, DriverError, Drivers, HostDriver};
use esrep_types::{
    build_snapshot, Dataset, EsrepConfig, PeerLink, PropertyKey, SnapshotPrefix, VmDefinition,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

pub use sync::SyncCallback;

/// Sync interval written into service instances created without one.
pub const DEFAULT_SLEEP_TIME: f64 = 60.0;

#[derive(Debug, Clone)]
pub struct ReplicationOptions {
    pub master_uuid: String,
    pub slave_uuid: String,
    /// Address of the master host, as passed to SSH.
    pub master_host: String,
    pub id: u32,
    pub force: bool,
    pub quiet: bool,
    /// Bandwidth limit handed to the transfer helper.
    pub limit: Option<String>,
    /// Seconds between sync cycles; `None` syncs once.
    pub sleep_time: Option<f64>,
    pub enabled: bool,
    /// Callback spec recorded in the service instance.
    pub callback: Option<String>,
    /// Slave VM definition, required by `init`.
    pub slave_definition: Option<Value>,
}

impl ReplicationOptions {
    pub fn new(
        master_uuid: impl Into<String>,
        slave_uuid: impl Into<String>,
        master_host: impl Into<String>,
    ) -> Self {
        Self {
            master_uuid: master_uuid.into(),
            slave_uuid: slave_uuid.into(),
            master_host: master_host.into(),
            id: 1,
            force: false,
            quiet: false,
            limit: None,
            sleep_time: None,
            enabled: false,
            callback: None,
            slave_definition: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReplicationSettings {
    pub lock_dir: PathBuf,
    pub lock_timeout: Option<Duration>,
    pub lock_interval: Duration,
    pub bundle: BundleManifest,
}

impl ReplicationSettings {
    pub fn from_config(config: &EsrepConfig) -> Self {
        let env = |name: &str| std::env::var(name).unwrap_or_default();
        Self {
            lock_dir: config.lock.dir.clone(),
            lock_timeout: Some(Duration::from_secs(config.lock.timeout_secs)),
            lock_interval: Duration::from_secs(config.lock.sleep_interval_secs),
            bundle: BundleManifest {
                erigones_home: config.service.erigones_home.display().to_string(),
                path: config.service.path.clone().unwrap_or_else(|| env("PATH")),
                python_path: config
                    .service
                    .python_path
                    .clone()
                    .unwrap_or_else(|| env("PYTHONPATH")),
                sync_bin: config.helpers.esrep_sync.display().to_string(),
            },
        }
    }
}

/// Snapshot taken on a master disk that is not yet known to be synced.
#[derive(Debug, Clone)]
struct SnapRecord {
    master: String,
    name: String,
}

/// Newest snapshot present on both sides, with each side's full prefix list.
#[derive(Debug)]
struct CommonSnapshot {
    name: String,
    master: Vec<String>,
    slave: Vec<String>,
}

/// One disk pair of `_initial_sync`, with an optional incremental base.
type SyncPair = (String, String, Option<String>);

pub struct Replication {
    options: ReplicationOptions,
    drivers: Drivers,
    settings: ReplicationSettings,
    cancel: CancelToken,
    callback: Option<Box<dyn SyncCallback>>,
    progress: Option<Box<dyn FnMut(&Fields)>>,
    clock: Box<dyn Fn() -> i64>,
    local_vm: Option<VmDefinition>,
    remote_vm: Option<VmDefinition>,
    is_hvm: bool,
    cores_dataset: Option<String>,
    vm_created: Option<String>,
    disks_snap: Vec<SnapRecord>,
    disks_synced: Vec<(String, String)>,
    disks_cleared: Vec<(String, String)>,
    sync_count: u64,
    msg: Option<String>,
}

fn check_disk_count(master: &[String], slave: &[String]) -> Result<(), CoreError> {
    if master.len() == slave.len() {
        Ok(())
    } else {
        Err(CoreError::DiskCheck(
            "Inconsistent disk configuration between master and slave VM".to_owned(),
        ))
    }
}

fn pairs_value(pairs: &[(String, String)]) -> Value {
    Value::Array(pairs.iter().map(|(m, s)| json!([m, s])).collect())
}

impl Replication {
    pub fn new(
        options: ReplicationOptions,
        drivers: Drivers,
        settings: ReplicationSettings,
        cancel: CancelToken,
    ) -> Self {
        Self {
            options,
            drivers,
            settings,
            cancel,
            callback: None,
            progress: None,
            clock: Box::new(unix_now),
            local_vm: None,
            remote_vm: None,
            is_hvm: false,
            cores_dataset: None,
            vm_created: None,
            disks_snap: Vec::new(),
            disks_synced: Vec::new(),
            disks_cleared: Vec::new(),
            sync_count: 0,
            msg: None,
        }
    }

    #[must_use]
    pub fn with_callback(mut self, callback: impl SyncCallback + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Receives the intermediate response of every sync cycle unless `quiet`.
    #[must_use]
    pub fn with_progress(mut self, progress: impl FnMut(&Fields) + 'static) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    /// Source of the epoch used in snapshot names.
    #[must_use]
    pub fn with_clock(mut self, clock: impl Fn() -> i64 + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn options(&self) -> &ReplicationOptions {
        &self.options
    }

    fn prefix(&self) -> SnapshotPrefix {
        SnapshotPrefix::Replication(self.options.id)
    }

    /// Property on master disks naming their slave disk.
    fn master_link(&self) -> PropertyKey {
        PropertyKey::master_link(self.options.id)
    }

    /// Property on slave disks naming their master disk.
    fn slave_link(&self) -> PropertyKey {
        PropertyKey::slave_link(self.options.id)
    }

    fn lock_policy(&self, file_name: &str) -> LockPolicy {
        LockPolicy {
            path: self.settings.lock_dir.join(file_name),
            timeout: self.settings.lock_timeout,
            interval: self.settings.lock_interval,
        }
    }

    fn slave_lock(&self) -> LockPolicy {
        self.lock_policy(&format!("esrep-{}.lock", self.options.slave_uuid))
    }

    fn master_lock(&self) -> LockPolicy {
        self.lock_policy(&format!("esrep-{}.lock", self.options.master_uuid))
    }

    fn service_lock(&self) -> LockPolicy {
        self.lock_policy("esrep.lock")
    }

    fn host(&self, remote: bool) -> &dyn HostDriver {
        self.drivers.host(remote)
    }

    /// VM definition, fetched once per side.
    fn vm(&mut self, uuid: &str, remote: bool) -> Result<VmDefinition, CoreError> {
        let cached = if remote { &self.remote_vm } else { &self.local_vm };
        if let Some(vm) = cached {
            return Ok(vm.clone());
        }
        let vm = VmDefinition::from_json(&self.host(remote).vm_json(uuid)?)?;
        if remote {
            self.remote_vm = Some(vm.clone());
        } else {
            self.local_vm = Some(vm.clone());
        }
        Ok(vm)
    }

    fn vm_hostname(&self, remote: bool) -> Value {
        let vm = if remote { &self.remote_vm } else { &self.local_vm };
        vm.as_ref()
            .and_then(|vm| vm.hostname.clone())
            .map_or(Value::Null, Value::String)
    }

    fn vm_disks(&mut self, uuid: &str, remote: bool) -> Result<Vec<String>, CoreError> {
        let vm = self.vm(uuid, remote)?;
        self.is_hvm = vm.is_hvm();
        Ok(vm.disks()?.into_iter().map(Dataset::into_inner).collect())
    }

    /// Hostname of the master, failing with rc 3 when it cannot be reached.
    fn check_host(&self) -> Result<String, CoreError> {
        crate::check_reachable(self.drivers.remote.as_ref())
    }

    fn host_and_disks(&mut self, uuid: &str, remote: bool) -> Result<(String, Vec<String>), CoreError> {
        let hostname = if remote {
            self.check_host()?
        } else {
            self.drivers.local.hostname()?
        };
        let disks = self.vm_disks(uuid, remote)?;
        Ok((hostname, disks))
    }

    /// Like `host_and_disks`, but with `force` an unavailable host or VM
    /// yields no hostname and no disks instead of an error.
    fn try_host_and_disks(
        &mut self,
        uuid: &str,
        remote: bool,
        force: bool,
    ) -> Result<(Option<String>, Vec<String>), CoreError> {
        if !force {
            let (hostname, disks) = self.host_and_disks(uuid, remote)?;
            return Ok((Some(hostname), disks));
        }

        let hostname = if remote {
            self.check_host()
        } else {
            self.drivers.local.hostname().map_err(CoreError::from)
        };
        let hostname = match hostname {
            Ok(hostname) => hostname,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                warn!("ignoring unavailable host of VM {uuid}: {e}");
                return Ok((None, Vec::new()));
            }
        };

        match self.vm_disks(uuid, remote) {
            Ok(disks) => Ok((Some(hostname), disks)),
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                warn!("ignoring unavailable VM {uuid}: {e}");
                Ok((Some(hostname), Vec::new()))
            }
        }
    }

    /// Peering property of `disk`: the master side (`esrep:dst`) or the
    /// slave side (`esrep:src`).
    fn disk_link(&self, disk: &str, master: bool, remote: bool) -> Result<PeerLink, CoreError> {
        let (side, key) = if master {
            ("master", self.master_link())
        } else {
            ("slave", self.slave_link())
        };
        let link = self
            .host(remote)
            .get_property(disk, key.as_str())
            .map_err(CoreError::from)
            .and_then(|value| value.parse::<PeerLink>().map_err(CoreError::from));

        match link {
            Ok(link) => Ok(link),
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                debug!("reading {key} on {disk}: {e}");
                Err(CoreError::DiskCheck(format!(
                    "Could not read {side} disk property on disk \"{disk}\""
                )))
            }
        }
    }

    fn property_empty(&self, disk: &str, key: &str, remote: bool) -> Result<bool, CoreError> {
        Ok(self.host(remote).get_property(disk, key)? == "-")
    }

    /// Names (without dataset) of this replication's snapshots, oldest first.
    fn list_snapshots(&self, dataset: &str, remote: bool) -> Result<Vec<String>, CoreError> {
        let prefix = self.prefix();
        Ok(self
            .host(remote)
            .list_snapshots(dataset)?
            .iter()
            .filter(|snapshot| prefix.matches(snapshot))
            .map(|snapshot| esrep_types::snapshot_name(snapshot).to_owned())
            .collect())
    }

    fn destroy_snapshots(
        &self,
        dataset: &str,
        names: &[String],
        remote: bool,
    ) -> Result<(), CoreError> {
        if names.is_empty() {
            return Ok(());
        }
        let target = build_snapshot(dataset, &names.join(","));
        self.host(remote).destroy(&target, false)?;
        Ok(())
    }

    fn set_properties(
        &self,
        dataset: &str,
        properties: &[(&str, &str)],
        remote: bool,
    ) -> Result<(), CoreError> {
        let host = self.host(remote);
        for (name, value) in properties {
            host.set_property(dataset, name, value, false)?;
        }
        Ok(())
    }

    /// `@rs-<id>-<epoch>`, appended to a dataset to name a snapshot.
    fn new_snapshot_name(&self) -> String {
        format!("@{}", self.prefix().name_at((self.clock)()))
    }

    fn snapshot_timestamp(&self, snapshot_name: &str) -> i64 {
        self.prefix().timestamp(snapshot_name).unwrap_or_default()
    }

    /// Delegated datasets of OS zones travel inside their parent's stream.
    fn should_be_synced(&self, dataset: &str) -> bool {
        self.is_hvm || dataset.matches('/').count() < 2
    }

    fn send_recv(
        &self,
        snapshot: &str,
        dataset: &str,
        incremental: Option<&str>,
    ) -> Result<(), CoreError> {
        debug!("receiving {snapshot} into {dataset}");
        self.drivers.transfer.send_recv(
            snapshot,
            dataset,
            incremental,
            self.options.limit.as_deref(),
        )?;
        Ok(())
    }

    /// Copy the quota of the master's `<zpool>/<uuid>` onto the slave's.
    fn sync_quota(&mut self) -> Result<(), CoreError> {
        let master = self.options.master_uuid.clone();
        let slave = self.options.slave_uuid.clone();
        let source = self.vm(&master, true)?.quota_dataset()?;
        let destination = self.vm(&slave, false)?.quota_dataset()?;
        self.drivers
            .transfer
            .sync_quota(source.as_str(), destination.as_str())?;
        Ok(())
    }

    fn vm_destroy(&self, uuid: &str, remote: bool) -> Result<(), CoreError> {
        let host = self.host(remote);
        if let Err(e) = host.vm_remove_indestructible(uuid) {
            if let DriverError::Cancelled(signal) = e {
                return Err(CoreError::Cancelled(signal));
            }
            debug!("removing indestructible property of {uuid}: {e}");
        }
        info!("destroying VM {uuid} on {}", host.name());
        host.vm_delete(uuid)?;
        Ok(())
    }

    fn create_new_snapshot(
        &mut self,
        master_disk: &str,
        snap_name: &str,
        record: bool,
    ) -> Result<(), CoreError> {
        let snapshot = build_snapshot(master_disk, snap_name);
        self.drivers.remote.create_snapshot(&snapshot, None, None)?;
        if record {
            self.disks_snap.push(SnapRecord {
                master: master_disk.to_owned(),
                name: snap_name.to_owned(),
            });
        }
        Ok(())
    }

    /// Snapshot every master disk, transfer each one and write the peering
    /// properties. The only place where peering values are constructed.
    fn initial_sync(
        &mut self,
        disks: &[SyncPair],
        master_host: &str,
        slave_host: &str,
        clear_master_property: Option<&PropertyKey>,
        clear_slave_property: Option<&PropertyKey>,
    ) -> Result<String, CoreError> {
        let snap_name = self.new_snapshot_name();
        self.disks_snap.clear();
        self.disks_synced.clear();

        for (master_disk, _, _) in disks {
            self.create_new_snapshot(master_disk, &snap_name, true)?;
        }

        let master_key = self.master_link();
        let slave_key = self.slave_link();
        for (master_disk, slave_disk, incremental) in disks {
            if self.should_be_synced(master_disk) {
                let snapshot = build_snapshot(master_disk, &snap_name);
                self.send_recv(&snapshot, slave_disk, incremental.as_deref())?;
            }

            if let Some(key) = clear_slave_property {
                self.drivers.local.clear_property(slave_disk, key.as_str())?;
            }
            let master_link = PeerLink::new(master_host, master_disk.as_str()).to_string();
            self.set_properties(
                slave_disk,
                &[(slave_key.as_str(), master_link.as_str()), (PropertyKey::READONLY, "on")],
                false,
            )?;

            if let Some(key) = clear_master_property {
                self.drivers.remote.clear_property(master_disk, key.as_str())?;
            }
            let slave_link = PeerLink::new(slave_host, slave_disk.as_str()).to_string();
            self.set_properties(
                master_disk,
                &[(master_key.as_str(), slave_link.as_str()), (PropertyKey::READONLY, "off")],
                true,
            )?;

            debug!("linked {master_disk} -> {slave_disk}");
            self.disks_synced
                .push((master_disk.clone(), slave_disk.clone()));
        }

        Ok(snap_name)
    }

    fn common_snapshot(
        &self,
        master_disk: &str,
        slave_disk: &str,
    ) -> Result<CommonSnapshot, CoreError> {
        let slave = self.list_snapshots(slave_disk, false)?;
        let master = self.list_snapshots(master_disk, true)?;

        let Some(common) = master.iter().rev().find(|snap| slave.contains(snap)) else {
            return Err(CoreError::SnapshotCheck(format!(
                "Master VM disk \"{master_disk}\" and slave VM disk \"{slave_disk}\" do not have a common snapshot"
            )));
        };
        Ok(CommonSnapshot {
            name: format!("@{common}"),
            master,
            slave,
        })
    }

    /// Both peering properties of a disk pair must point at each other.
    fn check_disk_sync(&self, master_disk: &str, slave_disk: &str) -> Result<(), CoreError> {
        if self.disk_link(slave_disk, false, false)?.dataset != master_disk {
            return Err(CoreError::DiskCheck(format!(
                "Slave VM disk \"{slave_disk}\" is not initialized with master VM disk \"{master_disk}\""
            )));
        }
        if self.disk_link(master_disk, true, true)?.dataset != slave_disk {
            return Err(CoreError::DiskCheck(format!(
                "Master VM disk \"{master_disk}\" is not initialized with slave VM disk \"{slave_disk}\""
            )));
        }
        Ok(())
    }

    /// Unmount the cores dataset of an OS zone before its disks are replaced.
    fn prepare_dataset_destroy(&mut self, slave_uuid: &str) -> Result<(), CoreError> {
        if self.is_hvm {
            return Ok(());
        }
        let cores = self.vm(slave_uuid, false)?.cores_dataset()?.into_inner();
        match self.drivers.local.unmount(&cores, false) {
            Ok(()) => self.cores_dataset = Some(cores),
            Err(e)
                if e.message()
                    .is_some_and(|msg| msg.contains("dataset does not exist")) =>
            {
                debug!("no cores dataset {cores}");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn finalize_initialized_vm(&self) -> Result<(), CoreError> {
        if let Some(cores) = &self.cores_dataset {
            self.drivers.local.mount(cores)?;
        }
        Ok(())
    }

    /// Create the slave VM and perform the initial full transfer.
    pub fn init(&mut self) -> Response {
        let lock = self.slave_lock();
        perform(
            self,
            "init",
            Some(lock),
            Action::compensated(Self::run_init, Self::init_cleanup),
        )
    }

    fn run_init(&mut self) -> Result<Fields, CoreError> {
        let master = self.options.master_uuid.clone();
        let slave = self.options.slave_uuid.clone();
        let definition = self.options.slave_definition.clone().ok_or_else(|| {
            CoreError::Unknown("init requires the slave VM definition".to_owned())
        })?;
        let slave_vm = VmDefinition::from_value(definition.clone())?;
        if slave_vm.uuid != slave {
            return Err(CoreError::Unknown(format!(
                "Slave VM definition is for {}, not {slave}",
                slave_vm.uuid
            )));
        }

        let slave_host = self.drivers.local.hostname()?;
        let master_host = self.check_host()?;
        info!("creating slave VM {slave}");
        self.drivers
            .local
            .vm_create(&serde_json::to_string(&definition)?)?;
        self.vm_created = Some(slave.clone());

        let slave_disks = self.vm_disks(&slave, false)?;
        let master_disks = self.vm_disks(&master, true)?;
        check_disk_count(&master_disks, &slave_disks)?;
        self.prepare_dataset_destroy(&slave)?;

        // delegated datasets go first
        for disk in slave_disks.iter().rev() {
            self.drivers.local.destroy(disk, false)?;
        }
        if slave_vm.is_bhyve() {
            self.sync_quota()?;
        }

        let disks: Vec<SyncPair> = master_disks
            .iter()
            .zip(&slave_disks)
            .map(|(m, s)| (m.clone(), s.clone(), None))
            .collect();
        let snapshot_name = self.initial_sync(&disks, &master_host, &slave_host, None, None)?;
        self.finalize_initialized_vm()?;
        let slave_json = self.vm(&slave, false)?.to_value()?;
        info!(
            "replication {} initialized: {master} -> {slave}",
            self.options.id
        );

        Ok(into_fields(json!({
            "master": master,
            "master_hostname": self.vm_hostname(true),
            "master_host": master_host,
            "master_disks": master_disks,
            "slave": slave,
            "slave_hostname": self.vm_hostname(false),
            "slave_host": slave_host,
            "slave_disks": slave_disks,
            "synced_disks": pairs_value(&self.disks_synced),
            "snapshot_name": snapshot_name,
            "timestamp": self.snapshot_timestamp(&snapshot_name),
            "slave_json": slave_json,
        })))
    }

    /// Unlink synced master disks, destroy the slave VM (and with it every
    /// received dataset) and the snapshots taken on the master.
    fn init_cleanup(&mut self, _fields: &mut Fields) -> Result<(), CoreError> {
        let key = self.master_link();
        for (master_disk, _) in &self.disks_synced {
            if let Err(e) = self.drivers.remote.clear_property(master_disk, key.as_str()) {
                warn!("failed to clear {key} on {master_disk}: {e}");
            }
        }

        if let Some(uuid) = self.vm_created.take() {
            self.vm_destroy(&uuid, false)?;
            for record in &self.disks_snap {
                let snapshot = build_snapshot(&record.master, &record.name);
                if let Err(e) = self.drivers.remote.destroy(&snapshot, false) {
                    debug!("failed to destroy {snapshot}: {e}");
                }
            }
        }
        Ok(())
    }
}

impl ActionContext for Replication {
    fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    fn take_msg(&mut self) -> Option<String> {
        self.msg.take()
    }
}
