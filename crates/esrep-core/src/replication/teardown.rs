use super::{check_disk_count, Replication};
use crate::action::{into_fields, perform, Action, Fields};
use crate::{CoreError, Response};
use serde_json::json;
use tracing::{debug, info};

impl Replication {
    /// Destroy the slave VM, then strip snapshots and links from the master
    /// disks without ever failing on them.
    pub fn destroy(&mut self) -> Response {
        let lock = self.slave_lock();
        perform(self, "destroy", Some(lock), Action::plain(Self::run_destroy))
    }

    fn run_destroy(&mut self) -> Result<Fields, CoreError> {
        let master = self.options.master_uuid.clone();
        let slave = self.options.slave_uuid.clone();
        let check_master = !self.options.force;

        let (slave_host, slave_disks) = self.host_and_disks(&slave, false)?;
        let (master_host, master_disks) =
            self.try_host_and_disks(&master, true, self.options.force)?;
        if check_master {
            check_disk_count(&master_disks, &slave_disks)?;
        }

        for (i, slave_disk) in slave_disks.iter().enumerate() {
            let link = self.disk_link(slave_disk, false, false)?;
            if check_master {
                let master_disk = master_disks.get(i).map_or("", String::as_str);
                if link.dataset != master_disk {
                    return Err(CoreError::DiskCheck(format!(
                        "Slave disk \"{slave_disk}\" is not synced with master disk \"{master_disk}\""
                    )));
                }
            } else if !link.dataset.contains(master.as_str()) {
                return Err(CoreError::DiskCheck(format!(
                    "Slave disk \"{slave_disk}\" is not synced with master disk"
                )));
            }
        }

        self.ensure_no_instance("destroy")?;
        self.vm_destroy(&slave, false)?;

        // the slave is gone; master cleanup is best-effort from here on
        let mut cleaned = Vec::new();
        for (master_disk, slave_disk) in master_disks.iter().zip(&slave_disks) {
            match self.unlink_master_disk(master_disk, slave_disk) {
                Ok(true) => cleaned.push(master_disk.clone()),
                Ok(false) => {}
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => debug!("skipping cleanup of {master_disk}: {e}"),
            }
        }
        info!("replication {} destroyed", self.options.id);

        Ok(into_fields(json!({
            "slave": slave,
            "slave_hostname": self.vm_hostname(false),
            "slave_disks": slave_disks,
            "slave_host": slave_host,
            "master": master,
            "master_hostname": self.vm_hostname(true),
            "master_disks": master_disks,
            "master_host": master_host,
            "master_cleaned_disks": cleaned,
        })))
    }

    /// Drop replication snapshots of `master_disk` and clear its link when it
    /// still points at `slave_disk`. Returns whether the link was cleared.
    fn unlink_master_disk(&self, master_disk: &str, slave_disk: &str) -> Result<bool, CoreError> {
        let snapshots = self.list_snapshots(master_disk, true)?;
        self.destroy_snapshots(master_disk, &snapshots, true)?;

        if self.disk_link(master_disk, true, true)?.dataset != slave_disk {
            return Ok(false);
        }
        self.drivers
            .remote
            .clear_property(master_disk, self.master_link().as_str())?;
        Ok(true)
    }

    /// Destroy the slave VM and clear the master disks, which must not carry
    /// a slave link.
    pub fn destroy_clear(&mut self) -> Response {
        let lock = self.slave_lock();
        perform(
            self,
            "destroy_clear",
            Some(lock),
            Action::plain(Self::run_destroy_clear),
        )
    }

    fn run_destroy_clear(&mut self) -> Result<Fields, CoreError> {
        let master = self.options.master_uuid.clone();
        let slave = self.options.slave_uuid.clone();

        let (slave_host, slave_disks) = self.host_and_disks(&slave, false)?;
        let (master_host, master_disks) = self.host_and_disks(&master, true)?;

        self.ensure_no_instance("destroy")?;
        self.vm_destroy(&slave, false)?;
        let cleaned = self.clear_disks(&master_disks, true)?;

        Ok(into_fields(json!({
            "slave": slave,
            "slave_hostname": self.vm_hostname(false),
            "slave_disks": slave_disks,
            "slave_host": slave_host,
            "master": master,
            "master_hostname": self.vm_hostname(true),
            "master_disks": master_disks,
            "master_host": master_host,
            "master_cleaned_disks": cleaned,
        })))
    }

    /// Remove replication snapshots and links from the master VM. Runs on the
    /// master host.
    pub fn clear(&mut self) -> Response {
        let lock = self.master_lock();
        perform(self, "clear", Some(lock), Action::plain(Self::run_clear))
    }

    fn run_clear(&mut self) -> Result<Fields, CoreError> {
        let master = self.options.master_uuid.clone();
        let (master_host, master_disks) = self.host_and_disks(&master, false)?;
        let cleaned = self.clear_disks(&master_disks, false)?;

        Ok(into_fields(json!({
            "master": master,
            "master_hostname": self.vm_hostname(false),
            "master_disks": master_disks,
            "master_host": master_host,
            "master_cleaned_disks": cleaned,
        })))
    }

    /// Clear master links and replication snapshots; returns the disks that
    /// had either.
    fn clear_disks(&self, master_disks: &[String], remote: bool) -> Result<Vec<String>, CoreError> {
        let master_key = self.master_link();
        let slave_key = self.slave_link();
        let mut cleaned = Vec::new();

        for disk in master_disks {
            if !self.property_empty(disk, slave_key.as_str(), remote)? {
                return Err(CoreError::DiskCheck(format!(
                    "Master disk \"{disk}\" does look like a slave disk!"
                )));
            }

            // already gone after a failover
            let linked = !self.property_empty(disk, master_key.as_str(), remote)?;
            if linked {
                self.host(remote).clear_property(disk, master_key.as_str())?;
            }

            let snapshots = self.list_snapshots(disk, remote)?;
            self.destroy_snapshots(disk, &snapshots, remote)?;

            if linked || !snapshots.is_empty() {
                cleaned.push(disk.clone());
            }
        }
        Ok(cleaned)
    }
}
