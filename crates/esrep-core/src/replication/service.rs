use super::{check_disk_count, Replication, DEFAULT_SLEEP_TIME};
use crate::action::{into_fields, perform, Action, Fields};
use crate::{CoreError, Response};
use esrep_driver::manifest::{instance_fmri, instance_name, SERVICE_NAME};
use esrep_driver::InstanceManifest;
use serde_json::{json, Value};
use std::io::Write;
use tempfile::NamedTempFile;
use tracing::info;

fn manifest_file(xml: &str) -> Result<NamedTempFile, CoreError> {
    let mut file = tempfile::Builder::new()
        .prefix("esrep-")
        .suffix(".xml")
        .tempfile()?;
    file.write_all(xml.as_bytes())?;
    file.flush()?;
    Ok(file)
}

impl Replication {
    fn instance_fmri(&self) -> String {
        instance_fmri(&self.options.slave_uuid)
    }

    pub(super) fn instance_exists(&self) -> Result<bool, CoreError> {
        Ok(self
            .drivers
            .local
            .service_instance_exists(&self.instance_fmri())?)
    }

    pub(super) fn ensure_no_instance(&self, action: &str) -> Result<(), CoreError> {
        if self.instance_exists()? {
            return Err(CoreError::ServiceCheck(format!(
                "Replication service must be removed before {action}"
            )));
        }
        Ok(())
    }

    fn service_fields(&self) -> Result<Fields, CoreError> {
        let fmri = self.instance_fmri();
        let state = self.drivers.local.service_status(&fmri, &["state"])?;
        Ok(into_fields(json!({
            "master": self.options.master_uuid,
            "slave": self.options.slave_uuid,
            "service_name": fmri,
            "service_state": state.trim(),
        })))
    }

    pub fn svc_status(&mut self) -> Response {
        perform(self, "svc_status", None, Action::plain(|r: &mut Self| r.service_fields()))
    }

    pub fn svc_enable(&mut self) -> Response {
        perform(
            self,
            "svc_enable",
            None,
            Action::plain(|r: &mut Self| {
                r.drivers.local.service_enable(&r.instance_fmri())?;
                r.service_fields()
            }),
        )
    }

    pub fn svc_disable(&mut self) -> Response {
        perform(
            self,
            "svc_disable",
            None,
            Action::plain(|r: &mut Self| {
                r.drivers.local.service_disable(&r.instance_fmri())?;
                r.service_fields()
            }),
        )
    }

    /// Import the sync service instance for this pair, importing the service
    /// bundle first when the host does not know it yet.
    pub fn svc_create(&mut self) -> Response {
        let lock = self.service_lock();
        perform(self, "svc_create", Some(lock), Action::plain(Self::run_svc_create))
    }

    fn run_svc_create(&mut self) -> Result<Fields, CoreError> {
        let master = self.options.master_uuid.clone();
        let slave = self.options.slave_uuid.clone();
        let (_, slave_disks) = self.host_and_disks(&slave, false)?;
        let (_, master_disks) = self.host_and_disks(&master, true)?;
        check_disk_count(&master_disks, &slave_disks)?;
        for (master_disk, slave_disk) in master_disks.iter().zip(&slave_disks) {
            self.check_disk_sync(master_disk, slave_disk)?;
        }

        if !self.drivers.local.service_exists(SERVICE_NAME)? {
            let bundle = manifest_file(&self.settings.bundle.render())?;
            self.drivers.local.service_import(SERVICE_NAME, bundle.path())?;
            info!("imported service bundle {SERVICE_NAME}");
        }

        let sleep_time = self.options.sleep_time.unwrap_or(DEFAULT_SLEEP_TIME);
        let instance = InstanceManifest {
            master_uuid: master,
            slave_uuid: slave,
            master_host: self.options.master_host.clone(),
            id: self.options.id,
            sleep_time,
            enabled: self.options.enabled,
            callback: self.options.callback.clone(),
            limit: self.options.limit.clone(),
        };
        let file = manifest_file(&instance.render())?;
        self.drivers
            .local
            .service_instance_import(SERVICE_NAME, file.path())?;
        info!("imported service instance {}", self.instance_fmri());

        let mut fields = self.service_fields()?;
        fields.insert("sleep_time".to_owned(), json!(sleep_time));
        fields.insert("enabled".to_owned(), json!(self.options.enabled));
        fields.insert("bwlimit".to_owned(), json!(self.options.limit));
        fields.insert(
            "callback".to_owned(),
            self.options
                .callback
                .clone()
                .map_or(Value::Null, Value::String),
        );
        Ok(fields)
    }

    pub fn svc_remove(&mut self) -> Response {
        let lock = self.service_lock();
        perform(self, "svc_remove", Some(lock), Action::plain(Self::run_svc_remove))
    }

    fn run_svc_remove(&mut self) -> Result<Fields, CoreError> {
        let fmri = self.instance_fmri();
        self.drivers.local.service_disable(&fmri)?;
        self.drivers
            .local
            .service_instance_delete(SERVICE_NAME, &instance_name(&self.options.slave_uuid))?;
        info!("removed service instance {fmri}");

        Ok(into_fields(json!({
            "master": self.options.master_uuid,
            "slave": self.options.slave_uuid,
            "service_name": fmri,
            "service_state": "absent",
        })))
    }
}
