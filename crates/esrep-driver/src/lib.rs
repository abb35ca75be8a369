//! Host drivers for the esrep engines.
//!
//! `HostDriver` covers the per-host ZFS, SMF and VM primitives and
//! `TransferDriver` the streams between hosts. `ShellHost`/`ShellTransfer`
//! implement them by running the node helper scripts through a
//! `CommandRunner` (locally or over SSH); `MockCluster` implements them in
//! memory for tests. Every helper invocation is a cancellation yield point.

pub mod backend;
pub mod cancel;
pub mod manifest;
pub mod mock;
pub mod runner;
pub mod shell;

pub use backend::{Drivers, HostDriver, TransferDriver};
pub use cancel::{CancelToken, Signal};
pub use manifest::{BundleManifest, InstanceManifest};
pub use mock::{MockCluster, MockDataset, MockHost, MockNode, MockSnapshot, MockTransfer};
pub use runner::{CommandOutput, CommandRunner, SshTarget, Target};
pub use shell::{ShellHost, ShellTransfer};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    /// A helper exited non-zero; `msg` is its stderr (stdout when stderr is empty).
    #[error("{msg}")]
    Command { rc: i32, msg: String },
    #[error("failed to execute '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Interrupted by signal {0}")]
    Cancelled(Signal),
    #[error("operation requires a peer host")]
    NoPeer,
    #[error("unexpected helper output: {0}")]
    Output(String),
    #[error("driver I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl DriverError {
    pub fn command(rc: i32, msg: impl Into<String>) -> Self {
        Self::Command {
            rc,
            msg: msg.into(),
        }
    }

    /// Helper message, for errors that are matched on their text.
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Command { msg, .. } => Some(msg),
            _ => None,
        }
    }
}
