//! Value types shared by the esrep replication and backup engines.
//!
//! This crate owns the single parse/format boundary for everything that
//! travels through ZFS and SMF as text: dataset and snapshot names, session
//! snapshot prefixes, replication peering properties (`<host>/<dataset>`),
//! VM definitions as emitted by the hypervisor tooling, and the TOML
//! configuration file.

pub mod config;
pub mod dataset;
pub mod property;
pub mod vm;

pub use config::{
    EsrepConfig, HelperSection, LockSection, ServiceSection, SshSection, DEFAULT_CONFIG_PATH,
};
pub use dataset::{
    build_snapshot, snapshot_dataset, snapshot_name, switch_snapshot_dataset, Dataset,
    SnapshotPrefix,
};
pub use property::{PeerLink, PropertyKey};
pub use vm::{VmDefinition, VmDisk};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TypesError {
    #[error("Invalid snapshot: \"{0}\"")]
    InvalidSnapshot(String),
    #[error("invalid peer link '{0}': expected '<host>/<dataset>'")]
    InvalidPeerLink(String),
    #[error("invalid VM definition: {0}")]
    InvalidVm(String),
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}
