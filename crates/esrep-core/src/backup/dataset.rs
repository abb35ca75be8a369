use super::{path_value, tolerate, Backup, DsCreate, DsDelete, DsRestore};
use crate::action::{into_fields, perform, Action, Fields};
use crate::{CoreError, Response};
use esrep_driver::DriverError;
use esrep_types::{
    build_snapshot, snapshot_dataset, snapshot_name, switch_snapshot_dataset, PropertyKey,
    TypesError,
};
use serde_json::{json, Value};
use tracing::{debug, info};

impl Backup {
    /// Snapshot a VM disk on its host and receive it into a backup dataset,
    /// incrementally when the newest backup snapshot still exists there.
    pub fn ds_create(&mut self, request: DsCreate) -> Response {
        perform(
            self,
            "ds_create",
            None,
            Action::compensated(
                move |b: &mut Self| b.run_ds_create(&request),
                Self::ds_create_cleanup,
            ),
        )
    }

    fn run_ds_create(&mut self, request: &DsCreate) -> Result<Fields, CoreError> {
        let destination = request.destination.as_str();
        let depth = destination.split('/').count();
        if depth < 3 {
            return Err(CoreError::DatasetCheck(
                "Invalid destination dataset".to_owned(),
            ));
        }
        let (source, snap_name) = request
            .snapshot
            .split_once('@')
            .ok_or_else(|| TypesError::InvalidSnapshot(request.snapshot.clone()))?;

        let parent = destination
            .rsplit_once('/')
            .map_or(destination, |(parent, _)| parent);
        self.check_dataset(parent)?;
        self.check_host()?;

        self.deleted_last_snapshot_names.clear();
        let mut source_snapshots: Vec<String> = self
            .list_backup_snapshots(source, true)?
            .iter()
            .map(|s| snapshot_name(s).to_owned())
            .collect();

        // written first so a failed write costs no transfer
        if let (Some(path), Some(data)) = (&request.metadata, &request.json) {
            self.store_metadata(path, data)?;
        }

        let mut incremental = None;
        if self.drivers.local.dataset_exists(destination)? {
            let backups = self.list_backup_snapshots(destination, false)?;
            let newest = backups
                .last()
                .map(|s| snapshot_name(s).to_owned())
                .ok_or_else(|| {
                    CoreError::Unknown("Backup destination exists, but has no snapshots".to_owned())
                })?;

            if let Some(pos) = source_snapshots.iter().position(|s| *s == newest) {
                source_snapshots.remove(pos);
                incremental = Some((build_snapshot(source, &newest), newest));
            } else {
                let archive = format!("{destination}-arch-{}", (self.clock)());
                self.drivers
                    .local
                    .rename_dataset(destination, &archive, false)?;
                info!("no common snapshot with {source}, archived {destination} as {archive}");
                self.update_snapshots = backups
                    .iter()
                    .map(|s| json!({"name": s, "new_name": switch_snapshot_dataset(s, &archive)}))
                    .collect();
            }
        }

        // no longer usable as incremental bases
        if !source_snapshots.is_empty() {
            let stale = build_snapshot(source, &source_snapshots.join(","));
            self.drivers.remote.destroy(&stale, false)?;
            self.deleted_last_snapshot_names = source_snapshots;
        }

        let name = PropertyKey::backup_name().assignment(&request.name);
        let output = self.drivers.remote.create_snapshot(
            &request.snapshot,
            Some(&name),
            request.fsfreeze.as_deref(),
        )?;
        self.msg = Some(output.trim().to_owned());
        self.last_snapshot = Some(request.snapshot.clone());

        self.drivers.transfer.backup_dataset(
            &request.snapshot,
            destination,
            incremental.as_ref().map(|(snapshot, _)| snapshot.as_str()),
            self.limit.as_deref(),
        )?;
        let backup_snapshot = build_snapshot(destination, snap_name);

        // the backup exists; nothing below may fail it
        let size = match self
            .drivers
            .local
            .get_property(&backup_snapshot, PropertyKey::WRITTEN)
        {
            Ok(value) => value.trim().parse::<u64>().unwrap_or_default(),
            Err(DriverError::Cancelled(signal)) => {
                return Err(CoreError::Cancelled(signal))
            }
            Err(e) => {
                debug!("reading size of {backup_snapshot}: {e}");
                0
            }
        };

        match incremental {
            Some((base, newest)) => {
                let removed = self.drivers.remote.destroy(&base, false);
                if tolerate(removed, "removing incremental base")? {
                    self.deleted_last_snapshot_names.push(newest);
                }
            }
            None => {
                let readonly =
                    self.drivers
                        .local
                        .set_property(destination, PropertyKey::READONLY, "on", false);
                tolerate(readonly, "setting readonly on new backup dataset")?;
            }
        }
        info!("backed up {} into {backup_snapshot}", request.snapshot);

        Ok(into_fields(json!({
            "backup_snapshot": backup_snapshot,
            "backup_snapshot_size": size,
            "update_snapshots": self.update_snapshots,
            "last_snapshot_name": self.last_snapshot_name(),
            "deleted_last_snapshot_names": self.deleted_last_snapshot_names,
            "metadata_file": path_value(self.metadata_file.as_deref()),
        })))
    }

    /// Drop the metadata file and the new source snapshot; report what the
    /// caller has to reconcile.
    fn ds_create_cleanup(&mut self, fields: &mut Fields) -> Result<(), CoreError> {
        fields.insert(
            "update_snapshots".to_owned(),
            Value::Array(self.update_snapshots.clone()),
        );
        fields.insert(
            "deleted_last_snapshot_names".to_owned(),
            json!(self.deleted_last_snapshot_names),
        );

        if let Some(path) = self.metadata_file.take() {
            super::metadata::remove_silent(&path);
        }
        fields.insert("metadata_file".to_owned(), Value::Null);

        if let Some(snapshot) = self.last_snapshot.take() {
            if let Err(e) = self.drivers.remote.destroy(&snapshot, false) {
                debug!("failed to destroy {snapshot}: {e}");
                fields.insert(
                    "last_snapshot_name".to_owned(),
                    json!(snapshot_name(&snapshot)),
                );
            }
        }
        Ok(())
    }

    /// Delete backup snapshots; a dataset that would be left without any
    /// backup snapshot is destroyed as a whole.
    pub fn ds_delete(&mut self, request: DsDelete) -> Response {
        perform(
            self,
            "ds_delete",
            None,
            Action::compensated(
                move |b: &mut Self| b.run_ds_delete(&request),
                Self::ds_delete_cleanup,
            ),
        )
    }

    fn run_ds_delete(&mut self, request: &DsDelete) -> Result<Fields, CoreError> {
        self.deleted_snapshots.clear();
        self.affected_datasets.clear();

        let mut groups: Vec<(String, Vec<String>)> = Vec::new();
        for snapshot in &request.snapshots {
            let dataset = snapshot_dataset(snapshot);
            match groups.iter_mut().find(|(ds, _)| ds == dataset) {
                Some((_, snapshots)) => snapshots.push(snapshot.clone()),
                None => groups.push((dataset.to_owned(), vec![snapshot.clone()])),
            }
        }

        let mut existing = Vec::with_capacity(groups.len());
        for (dataset, _) in &groups {
            existing.push(self.list_backup_snapshots(dataset, false)?);
        }

        for ((dataset, snapshots), current) in groups.iter().zip(&existing) {
            let names: Vec<&str> = snapshots
                .iter()
                .filter(|s| current.contains(*s))
                .map(|s| snapshot_name(s))
                .collect();
            if names.is_empty() {
                continue;
            }

            let keep_dataset = current.iter().any(|s| !snapshots.contains(s));
            if keep_dataset {
                self.drivers
                    .local
                    .destroy(&build_snapshot(dataset, &names.join(",")), false)?;
            } else {
                info!("destroying {dataset} with its last backup snapshots");
                self.drivers.local.destroy(dataset, true)?;
            }

            self.deleted_snapshots.extend(snapshots.iter().cloned());
            if keep_dataset {
                self.affected_datasets.push(dataset.clone());
            }
        }

        if let Some(path) = &request.metadata {
            self.remove_metadata(path);
        }

        if let Some(first) = request.last_snapshots.first() {
            let names: Vec<String> = request
                .last_snapshots
                .iter()
                .map(|s| snapshot_name(s).to_owned())
                .collect();
            let target = build_snapshot(snapshot_dataset(first), &names.join(","));
            let removed = self.drivers.remote.destroy(&target, false);
            if tolerate(removed, "removing source snapshots")? {
                self.deleted_last_snapshot_names = names;
            }
        }

        Ok(into_fields(json!({
            "deleted_snapshots": self.deleted_snapshots,
            "update_snapshots": self.snapshot_sizes()?,
            "deleted_last_snapshot_names": self.deleted_last_snapshot_names,
            "deleted_metadata_file": path_value(self.deleted_metadata.as_deref()),
        })))
    }

    fn ds_delete_cleanup(&mut self, fields: &mut Fields) -> Result<(), CoreError> {
        fields.insert(
            "deleted_snapshots".to_owned(),
            json!(self.deleted_snapshots),
        );
        fields.insert(
            "update_snapshots".to_owned(),
            Value::Array(self.snapshot_sizes().unwrap_or_default()),
        );
        fields.insert(
            "deleted_last_snapshot_names".to_owned(),
            json!(self.deleted_last_snapshot_names),
        );
        fields.insert(
            "deleted_metadata_file".to_owned(),
            path_value(self.deleted_metadata.as_deref()),
        );
        Ok(())
    }

    /// Restore a backup snapshot over a dataset on the VM host. The previous
    /// dataset is kept aside until the stream has been received.
    pub fn ds_restore(&mut self, request: DsRestore) -> Response {
        perform(
            self,
            "ds_restore",
            None,
            Action::plain(move |b: &mut Self| b.run_ds_restore(&request)),
        )
    }

    fn run_ds_restore(&mut self, request: &DsRestore) -> Result<Fields, CoreError> {
        let destination = request.destination.as_str();
        self.check_dataset(&request.snapshot)?;
        self.check_host()?;

        let archive = self.archive_and_create_empty(destination)?;
        let outcome = self.restore_into(&archive, destination, |drivers| {
            drivers
                .transfer
                .restore_dataset(&request.snapshot, destination)
        });
        self.settle_restore(outcome, &archive, destination)?;

        // the received snapshot is not kept
        let received = switch_snapshot_dataset(&request.snapshot, destination);
        let removed = self.drivers.remote.destroy(&received, false);
        tolerate(removed, "removing received snapshot")?;
        info!("restored {} into {destination}", request.snapshot);
        Ok(Fields::new())
    }
}
