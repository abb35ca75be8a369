//! VM definitions as produced by the hypervisor tooling (`vmadm get`).
//!
//! Only the fields the engines look at are typed; everything else is kept in
//! `extra` so a definition read from one host can be fed back unchanged.

use crate::{Dataset, TypesError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const HVM_BRANDS: &[&str] = &["kvm", "bhyve"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmDisk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zfs_filesystem: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmDefinition {
    pub uuid: String,
    #[serde(default)]
    pub brand: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zpool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zfs_filesystem: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub datasets: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<VmDisk>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl VmDefinition {
    pub fn from_json(json: &str) -> Result<Self, TypesError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_value(value: Value) -> Result<Self, TypesError> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_value(&self) -> Result<Value, TypesError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Hardware-virtualized guests (KVM, bhyve) keep their data on zvols.
    pub fn is_hvm(&self) -> bool {
        HVM_BRANDS.contains(&self.brand.as_str())
    }

    pub fn is_bhyve(&self) -> bool {
        self.brand == "bhyve"
    }

    pub fn zpool(&self) -> Result<&str, TypesError> {
        self.zpool
            .as_deref()
            .ok_or_else(|| TypesError::InvalidVm(format!("VM {} has no zpool", self.uuid)))
    }

    /// Datasets that make up the VM, in definition order.
    ///
    /// HVM: every disk whose media is `disk` (the default). OS zones: the zone
    /// root followed by its delegated datasets.
    pub fn disks(&self) -> Result<Vec<Dataset>, TypesError> {
        if self.is_hvm() {
            return Ok(self
                .disks
                .iter()
                .filter(|disk| disk.media.as_deref().unwrap_or("disk") == "disk")
                .filter_map(|disk| disk.zfs_filesystem.as_deref())
                .map(Dataset::from)
                .collect());
        }

        let root = self.zfs_filesystem.as_deref().ok_or_else(|| {
            TypesError::InvalidVm(format!("VM {} has no zfs_filesystem", self.uuid))
        })?;
        let mut disks = vec![Dataset::from(root)];
        disks.extend(self.datasets.iter().map(|ds| Dataset::from(ds.as_str())));
        Ok(disks)
    }

    /// `<zpool>/<uuid>`, the volume that carries the VM quota.
    pub fn quota_dataset(&self) -> Result<Dataset, TypesError> {
        Ok(Dataset::new(format!("{}/{}", self.zpool()?, self.uuid)))
    }

    /// `<zpool>/cores/<uuid>`, mounted inside OS zones.
    pub fn cores_dataset(&self) -> Result<Dataset, TypesError> {
        Ok(Dataset::new(format!("{}/cores/{}", self.zpool()?, self.uuid)))
    }
}
