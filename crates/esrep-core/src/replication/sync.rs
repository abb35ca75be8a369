use super::{check_disk_count, pairs_value, CommonSnapshot, Replication};
use crate::action::{into_fields, perform, Action, Fields};
use crate::{CoreError, Response};
use esrep_driver::Signal;
use esrep_types::build_snapshot;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Invoked with the response after each successful sync cycle. An error is
/// reported under `callback_error` and never fails the sync.
pub trait SyncCallback {
    fn call(&mut self, response: &Fields) -> Result<(), String>;
}

impl<F> SyncCallback for F
where
    F: FnMut(&Fields) -> Result<(), String>,
{
    fn call(&mut self, response: &Fields) -> Result<(), String> {
        self(response)
    }
}

type DiskPair = (String, String);

impl Replication {
    /// Incremental sync from the newest common snapshot. With `sleep_time`
    /// set, keeps syncing until interrupted.
    pub fn sync(&mut self) -> Response {
        let lock = self.slave_lock();
        perform(
            self,
            "sync",
            Some(lock),
            Action::compensated(Self::run_sync, Self::sync_cleanup),
        )
    }

    fn run_sync(&mut self) -> Result<Fields, CoreError> {
        let master = self.options.master_uuid.clone();
        let slave = self.options.slave_uuid.clone();
        let (slave_host, slave_disks) = self.host_and_disks(&slave, false)?;
        let (master_host, master_disks) = self.host_and_disks(&master, true)?;
        check_disk_count(&master_disks, &slave_disks)?;

        // the master quota may have grown since the last sync
        if self.vm(&master, true)?.is_bhyve() {
            self.sync_quota()?;
        }

        let mut pairs = Vec::with_capacity(master_disks.len());
        for (master_disk, slave_disk) in master_disks.iter().zip(&slave_disks) {
            self.check_disk_sync(master_disk, slave_disk)?;
            let common = self.common_snapshot(master_disk, slave_disk)?;
            pairs.push((master_disk.clone(), slave_disk.clone(), common));
        }

        let mut last_snap = self.cold_sync(&pairs)?;
        self.sync_count = 1;
        let mut response = into_fields(json!({
            "master": master,
            "master_hostname": self.vm_hostname(true),
            "master_host": master_host,
            "master_disks": master_disks,
            "slave": slave,
            "slave_hostname": self.vm_hostname(false),
            "slave_host": slave_host,
            "slave_disks": slave_disks,
            "synced_disks": pairs_value(&self.disks_synced),
            "snapshot_name": last_snap,
            "timestamp": self.snapshot_timestamp(&last_snap),
            "sync": self.sync_count,
        }));

        let Some(sleep_time) = self.options.sleep_time else {
            self.run_callback(&mut response);
            return Ok(response);
        };

        let interval = Duration::try_from_secs_f64(sleep_time).unwrap_or(Duration::ZERO);
        let disks: Vec<DiskPair> = self.disks_synced.clone();
        loop {
            self.run_callback(&mut response);
            if !self.options.quiet {
                if let Some(progress) = self.progress.as_mut() {
                    progress(&response);
                }
            }

            match self.cancel.sleep(interval) {
                Some(Signal::Interrupt) => {
                    info!("sync loop interrupted after {} syncs", self.sync_count);
                    return Ok(response);
                }
                Some(Signal::Terminate) => return Err(CoreError::Cancelled(Signal::Terminate)),
                None => {}
            }

            last_snap = self.hot_sync(&disks, &last_snap)?;
            self.sync_count += 1;
            response.insert("sync".to_owned(), json!(self.sync_count));
            response.insert("snapshot_name".to_owned(), json!(last_snap));
            response.insert(
                "timestamp".to_owned(),
                json!(self.snapshot_timestamp(&last_snap)),
            );
            response.insert(
                "synced_disks".to_owned(),
                pairs_value(&self.disks_synced),
            );
        }
    }

    /// First cycle: sync from the common snapshot, then drop every older
    /// replication snapshot on both sides.
    fn cold_sync(
        &mut self,
        pairs: &[(String, String, CommonSnapshot)],
    ) -> Result<String, CoreError> {
        let snap_name = self.new_snapshot_name();
        self.disks_snap.clear();
        self.disks_synced.clear();

        for (master_disk, _, _) in pairs {
            self.create_new_snapshot(master_disk, &snap_name, true)?;
        }

        for (master_disk, slave_disk, common) in pairs {
            if self.should_be_synced(master_disk) {
                let base = build_snapshot(master_disk, &common.name);
                let snapshot = build_snapshot(master_disk, &snap_name);
                self.send_recv(&snapshot, slave_disk, Some(&base))?;
            }
            // received; nothing left to undo for this disk
            if !self.disks_snap.is_empty() {
                self.disks_snap.remove(0);
            }

            self.destroy_snapshots(master_disk, &common.master, true)?;
            self.destroy_snapshots(slave_disk, &common.slave, false)?;
            self.disks_synced
                .push((master_disk.clone(), slave_disk.clone()));
        }

        debug!("cold sync finished with {snap_name}");
        Ok(snap_name)
    }

    /// Later cycles: sync from the previous cycle's snapshot and destroy it.
    fn hot_sync(&mut self, disks: &[DiskPair], base: &str) -> Result<String, CoreError> {
        let snap_name = self.new_snapshot_name();
        self.disks_synced.clear();

        for (master_disk, _) in disks {
            self.create_new_snapshot(master_disk, &snap_name, false)?;
        }

        for (master_disk, slave_disk) in disks {
            let master_base = build_snapshot(master_disk, base);
            if self.should_be_synced(master_disk) {
                self.send_recv(
                    &build_snapshot(master_disk, &snap_name),
                    slave_disk,
                    Some(&master_base),
                )?;
            }
            self.drivers.remote.destroy(&master_base, false)?;
            self.drivers
                .local
                .destroy(&build_snapshot(slave_disk, base), false)?;
            self.disks_synced
                .push((master_disk.clone(), slave_disk.clone()));
        }

        debug!("hot sync finished with {snap_name}");
        Ok(snap_name)
    }

    fn run_callback(&mut self, response: &mut Fields) {
        let Some(callback) = self.callback.as_mut() else {
            return;
        };
        response.remove("callback_error");
        if let Err(e) = callback.call(response) {
            warn!("sync callback failed: {e}");
            response.insert("callback_error".to_owned(), Value::String(e));
        }
    }

    /// Report the number of finished cycles and drop snapshots of a cold sync
    /// that did not reach the slave.
    fn sync_cleanup(&mut self, fields: &mut Fields) -> Result<(), CoreError> {
        fields.insert("sync".to_owned(), json!(self.sync_count));

        for record in std::mem::take(&mut self.disks_snap) {
            let snapshot = build_snapshot(&record.master, &record.name);
            if let Err(e) = self.drivers.remote.destroy(&snapshot, false) {
                debug!("failed to destroy {snapshot}: {e}");
            }
        }
        Ok(())
    }
}
