use super::{check_disk_count, pairs_value, Replication, SyncPair};
use crate::action::{into_fields, perform, Action, Fields};
use crate::{CoreError, Response};
use esrep_driver::DriverError;
use esrep_types::{build_snapshot, PropertyKey};
use serde_json::json;
use tracing::{debug, info, warn};

impl Replication {
    /// Promote the slave VM to master. The old master is stopped when
    /// reachable and otherwise left untouched.
    pub fn failover(&mut self) -> Response {
        let lock = self.slave_lock();
        perform(
            self,
            "failover",
            Some(lock),
            Action::compensated(Self::run_failover, Self::failover_cleanup),
        )
    }

    fn run_failover(&mut self) -> Result<Fields, CoreError> {
        let master = self.options.master_uuid.clone();
        let slave = self.options.slave_uuid.clone();
        let check_master = !self.options.force;

        let (slave_host, slave_disks) = self.host_and_disks(&slave, false)?;
        let (master_host, master_disks) =
            self.try_host_and_disks(&master, true, self.options.force)?;
        if check_master {
            check_disk_count(&master_disks, &slave_disks)?;
        }

        // every local disk must be a slave disk of this replication
        let mut links = Vec::with_capacity(slave_disks.len());
        for slave_disk in &slave_disks {
            let link = self.disk_link(slave_disk, false, false)?;
            if !check_master && !link.dataset.contains(master.as_str()) {
                return Err(CoreError::DiskCheck(format!(
                    "Slave disk \"{slave_disk}\" is not synced with master disk"
                )));
            }
            links.push((slave_disk.clone(), link));
        }

        if check_master {
            for ((slave_disk, link), master_disk) in links.iter().zip(&master_disks) {
                if link.dataset != *master_disk {
                    return Err(CoreError::DiskCheck(format!(
                        "Slave disk \"{slave_disk}\" is not synced with master disk \"{master_disk}\""
                    )));
                }
            }
            for (master_disk, slave_disk) in master_disks.iter().zip(&slave_disks) {
                if self.disk_link(master_disk, true, true)?.dataset != *slave_disk {
                    return Err(CoreError::DiskCheck(format!(
                        "Master disk \"{master_disk}\" is not synced with slave disk \"{slave_disk}\""
                    )));
                }
            }
        }

        self.ensure_no_instance("failover")?;

        let old_master_stopped = match self.drivers.remote.vm_stop(&master, true) {
            Ok(()) => true,
            Err(e) if check_master || matches!(e, DriverError::Cancelled(_)) => {
                return Err(e.into())
            }
            Err(e) => {
                warn!("could not stop old master {master}: {e}");
                false
            }
        };

        // esrep:dst arrives on slave disks through the recursive stream
        let master_key = self.master_link();
        let slave_key = self.slave_link();
        self.disks_cleared.clear();
        for (slave_disk, link) in links {
            self.drivers
                .local
                .clear_property(&slave_disk, master_key.as_str())?;
            self.drivers
                .local
                .clear_property(&slave_disk, slave_key.as_str())?;
            self.disks_cleared.push((slave_disk.clone(), link.to_string()));
            self.drivers
                .local
                .clear_property(&slave_disk, PropertyKey::READONLY)?;
        }

        self.drivers.local.vm_start(&slave)?;
        self.disks_cleared.clear();
        info!("VM {slave} is the new master of replication {}", self.options.id);

        Ok(into_fields(json!({
            "new_master": slave,
            "new_master_disks": slave_disks,
            "new_master_host": slave_host,
            "new_master_hostname": self.vm_hostname(false),
            "old_master": master,
            "old_master_hostname": self.vm_hostname(true),
            "old_master_disks": master_disks,
            "old_master_host": master_host,
            "old_master_stopped": old_master_stopped,
        })))
    }

    /// Put the slave link and `readonly=on` back on disks whose properties
    /// were already cleared.
    fn failover_cleanup(&mut self, _fields: &mut Fields) -> Result<(), CoreError> {
        if self.disks_cleared.is_empty() {
            return Ok(());
        }
        let slave = self.options.slave_uuid.clone();
        if let Err(e) = self.drivers.local.vm_stop(&slave, true) {
            debug!("stopping {slave} after failed failover: {e}");
        }

        let key = self.slave_link();
        for (slave_disk, link) in std::mem::take(&mut self.disks_cleared) {
            self.set_properties(
                &slave_disk,
                &[(key.as_str(), link.as_str()), (PropertyKey::READONLY, "on")],
                false,
            )?;
        }
        Ok(())
    }

    /// Degrade the old master (local) to a slave of the new master (remote)
    /// after a failover, syncing from the newest common snapshot.
    pub fn reinit(&mut self) -> Response {
        let lock = self.slave_lock();
        perform(
            self,
            "reinit",
            Some(lock),
            Action::compensated(Self::run_reinit, Self::reinit_cleanup),
        )
    }

    fn run_reinit(&mut self) -> Result<Fields, CoreError> {
        let master = self.options.master_uuid.clone();
        let slave = self.options.slave_uuid.clone();

        self.drivers.local.vm_stop(&slave, true)?;

        let (slave_host, slave_disks) = self.host_and_disks(&slave, false)?;
        let (master_host, master_disks) = self.host_and_disks(&master, true)?;
        check_disk_count(&master_disks, &slave_disks)?;

        let master_key = self.master_link();
        let slave_key = self.slave_link();
        let mut disks: Vec<SyncPair> = Vec::with_capacity(master_disks.len());
        for (master_disk, slave_disk) in master_disks.iter().zip(&slave_disks) {
            let link = self.disk_link(slave_disk, true, false)?;
            let readonly = self
                .drivers
                .local
                .get_property(slave_disk, PropertyKey::READONLY)?;
            if link.dataset != *master_disk || readonly != "off" {
                return Err(CoreError::DiskCheck(format!(
                    "Slave (old master) VM disk \"{slave_disk}\" was not initialized with new master VM disk \"{master_disk}\""
                )));
            }

            let clean = self.property_empty(master_disk, master_key.as_str(), true)?
                && self.property_empty(master_disk, slave_key.as_str(), true)?
                && self
                    .drivers
                    .remote
                    .get_property(master_disk, PropertyKey::READONLY)?
                    == "off";
            if !clean {
                return Err(CoreError::DiskCheck(format!(
                    "Master disk \"{master_disk}\" has replication metadata set"
                )));
            }

            let common = self.common_snapshot(master_disk, slave_disk)?;
            let base = build_snapshot(master_disk, &common.name);
            disks.push((master_disk.clone(), slave_disk.clone(), Some(base)));
        }

        let snapshot_name =
            self.initial_sync(&disks, &master_host, &slave_host, None, Some(&master_key))?;
        info!("VM {slave} re-initialized as slave of {master}");

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
        })))
    }

    /// Synced disks stay synced; only snapshots of the disks that did not
    /// make it are removed from the master.
    fn reinit_cleanup(&mut self, fields: &mut Fields) -> Result<(), CoreError> {
        fields.insert("synced_disks".to_owned(), pairs_value(&self.disks_synced));

        for record in &self.disks_snap {
            if self.disks_synced.iter().any(|(m, _)| *m == record.master) {
                continue;
            }
            let snapshot = build_snapshot(&record.master, &record.name);
            if let Err(e) = self.drivers.remote.destroy(&snapshot, false) {
                debug!("failed to destroy {snapshot}: {e}");
            }
        }
        Ok(())
    }
}
