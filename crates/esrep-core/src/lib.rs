//! Replication and backup engines for VM disks on ZFS.
//!
//! Every public engine action runs through [`action::perform`], which takes
//! the action's lock, converts failures into the rc taxonomy below, runs the
//! compensating step on failure and stamps the JSON response envelope.
//! [`Replication`] drives incremental `zfs send/recv` between a master and a
//! slave host; [`Backup`] drives dataset and file backups on a backup node.

pub mod action;
pub mod backup;
pub mod concurrency;
pub mod replication;

pub use action::{perform, Action, ActionContext, Fields, LockPolicy, Response};
pub use backup::{Backup, DsCreate, DsDelete, DsRestore, FileCreate, FileDelete, FileRestore};
pub use concurrency::{install_signal_handlers, FileLock};
pub use replication::{Replication, ReplicationOptions, ReplicationSettings, SyncCallback};

use esrep_driver::{DriverError, HostDriver, Signal};
use thiserror::Error;

pub const OK: i32 = 0;
pub const ERR_HOST_CHECK: i32 = 3;
pub const ERR_DATASET_CHECK: i32 = 4;
pub const ERR_VM_DISK_CHECK: i32 = 5;
pub const ERR_FILE_CHECK: i32 = 5;
pub const ERR_VM_SNAP_CHECK: i32 = 6;
pub const ERR_SVC_CHECK: i32 = 7;
pub const ERR_UNKNOWN: i32 = 99;
pub const ERR_SIGTERM: i32 = 215;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Remote host is unreachable ({0})")]
    HostUnreachable(String),
    #[error("{0}")]
    DatasetCheck(String),
    #[error("{0}")]
    FileCheck(String),
    #[error("{0}")]
    DiskCheck(String),
    #[error("{0}")]
    SnapshotCheck(String),
    #[error("{0}")]
    ServiceCheck(String),
    /// A helper command failed; its exit code becomes the response rc.
    #[error("{msg}")]
    Command { rc: i32, msg: String },
    #[error("Interrupted by signal {0}")]
    Cancelled(Signal),
    #[error("Could not acquire lock within {0} seconds")]
    LockTimeout(u64),
    #[error("{0}")]
    Lock(String),
    #[error("invalid value: {0}")]
    Types(#[from] esrep_types::TypesError),
    #[error("driver error: {0}")]
    Driver(DriverError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Unknown(String),
}

impl From<DriverError> for CoreError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::Command { rc, msg } => Self::Command { rc, msg },
            DriverError::Cancelled(signal) => Self::Cancelled(signal),
            other => Self::Driver(other),
        }
    }
}

impl CoreError {
    pub fn rc(&self) -> i32 {
        match self {
            Self::HostUnreachable(_) => ERR_HOST_CHECK,
            Self::DatasetCheck(_) => ERR_DATASET_CHECK,
            Self::FileCheck(_) => ERR_FILE_CHECK,
            Self::DiskCheck(_) => ERR_VM_DISK_CHECK,
            Self::SnapshotCheck(_) => ERR_VM_SNAP_CHECK,
            Self::ServiceCheck(_) => ERR_SVC_CHECK,
            Self::Command { rc, .. } => *rc,
            Self::Cancelled(Signal::Terminate) => ERR_SIGTERM,
            Self::Cancelled(Signal::Interrupt)
            | Self::LockTimeout(_)
            | Self::Lock(_)
            | Self::Types(_)
            | Self::Driver(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Unknown(_) => ERR_UNKNOWN,
        }
    }

    /// Signals must reach the action wrapper; best-effort steps never swallow them.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Helper message of a failed command.
    pub fn command_message(&self) -> Option<&str> {
        match self {
            Self::Command { msg, .. } => Some(msg),
            _ => None,
        }
    }
}

/// Hostname of `host`; any failure other than a signal means rc 3.
pub(crate) fn check_reachable(host: &dyn HostDriver) -> Result<String, CoreError> {
    host.hostname().map_err(|e| match e {
        DriverError::Cancelled(signal) => CoreError::Cancelled(signal),
        other => CoreError::HostUnreachable(
            other
                .message()
                .map_or_else(|| other.to_string(), str::to_owned),
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rc_taxonomy() {
        assert_eq!(CoreError::HostUnreachable("x".into()).rc(), 3);
        assert_eq!(CoreError::DatasetCheck("x".into()).rc(), 4);
        assert_eq!(CoreError::DiskCheck("x".into()).rc(), 5);
        assert_eq!(CoreError::FileCheck("x".into()).rc(), 5);
        assert_eq!(CoreError::SnapshotCheck("x".into()).rc(), 6);
        assert_eq!(CoreError::ServiceCheck("x".into()).rc(), 7);
        assert_eq!(CoreError::LockTimeout(30).rc(), 99);
        assert_eq!(CoreError::Cancelled(Signal::Terminate).rc(), 215);
        assert_eq!(CoreError::Cancelled(Signal::Interrupt).rc(), 99);
    }

    #[test]
    fn helper_exit_code_is_kept() {
        let err = CoreError::from(DriverError::command(42, "boom"));
        assert_eq!(err.rc(), 42);
        assert_eq!(err.to_string(), "boom");
        assert_eq!(err.command_message(), Some("boom"));

        let err = CoreError::from(DriverError::NoPeer);
        assert_eq!(err.rc(), 99);
    }

    #[test]
    fn host_check_message() {
        assert_eq!(
            CoreError::HostUnreachable("Connection timed out".into()).to_string(),
            "Remote host is unreachable (Connection timed out)"
        );
        assert_eq!(
            CoreError::LockTimeout(1).to_string(),
            "Could not acquire lock within 1 seconds"
        );
    }
}
