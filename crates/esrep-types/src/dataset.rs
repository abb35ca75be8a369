//! ZFS dataset and snapshot names.
//!
//! Names are kept as plain strings on the wire (`pool/path`, `pool/path@name`);
//! the free functions at the bottom preserve the exact string semantics the
//! helper scripts rely on.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_newtype!(
    /// A ZFS filesystem or volume, `pool/path`.
    Dataset
);

/// Session-scoped snapshot name prefix. Everything that lists snapshots filters
/// by prefix, so snapshots created by hand are never touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotPrefix {
    /// `rs-<id>-<epoch>`, one namespace per replication id.
    Replication(u32),
    /// `is-<epoch>`, dataset backups.
    Backup,
}

impl SnapshotPrefix {
    pub fn as_string(self) -> String {
        match self {
            Self::Replication(id) => format!("rs-{id}-"),
            Self::Backup => "is-".to_owned(),
        }
    }

    pub fn name_at(self, epoch: i64) -> String {
        format!("{}{epoch}", self.as_string())
    }

    /// Accepts a bare snapshot name or a full `dataset@name`.
    pub fn matches(self, snapshot: &str) -> bool {
        snapshot_name(snapshot).starts_with(&self.as_string())
    }

    /// Epoch encoded in the last `-` separated field of a prefixed snapshot name.
    pub fn timestamp(self, snapshot: &str) -> Option<i64> {
        let name = snapshot_name(snapshot);
        if !self.matches(name) {
            return None;
        }
        name.rsplit('-').next()?.parse().ok()
    }
}

impl fmt::Display for SnapshotPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_string())
    }
}

/// Part after the last `@`; the input itself when there is none.
pub fn snapshot_name(snapshot: &str) -> &str {
    snapshot.rsplit('@').next().unwrap_or(snapshot)
}

/// Part before the first `@`.
pub fn snapshot_dataset(snapshot: &str) -> &str {
    snapshot.split('@').next().unwrap_or(snapshot)
}

/// `dataset@name`; the name may carry its leading `@` already.
pub fn build_snapshot(dataset: &str, name: &str) -> String {
    format!("{dataset}@{}", name.strip_prefix('@').unwrap_or(name))
}

/// Replace the dataset part of a snapshot reference, keeping the name.
pub fn switch_snapshot_dataset(snapshot: &str, dataset: &str) -> String {
    match snapshot.split_once('@') {
        Some((_, name)) => build_snapshot(dataset, name),
        None => dataset.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pure_helpers_keep_string_semantics() {
        assert_eq!(snapshot_name("zones/vm-disk0@rs-1-100"), "rs-1-100");
        assert_eq!(snapshot_dataset("zones/vm-disk0@rs-1-100"), "zones/vm-disk0");
        assert_eq!(build_snapshot("zones/a", "is-5"), "zones/a@is-5");
        assert_eq!(build_snapshot("zones/a", "@rs-1-100"), "zones/a@rs-1-100");
        assert_eq!(
            switch_snapshot_dataset("zones/a@is-5", "zones/a-arch-9"),
            "zones/a-arch-9@is-5"
        );
        assert_eq!(snapshot_name("no-at"), "no-at");
        assert_eq!(snapshot_dataset("no-at"), "no-at");
    }

    #[test]
    fn prefix_filters_by_session() {
        let rs1 = SnapshotPrefix::Replication(1);
        assert!(rs1.matches("zones/a@rs-1-100"));
        assert!(rs1.matches("rs-1-100"));
        assert!(!rs1.matches("zones/a@rs-10-100"));
        assert!(!rs1.matches("zones/a@manual"));
        assert!(SnapshotPrefix::Backup.matches("zones/a@is-7"));
        assert!(!SnapshotPrefix::Backup.matches("zones/a@rs-1-7"));
    }

    #[test]
    fn prefix_names_and_timestamps() {
        let rs = SnapshotPrefix::Replication(3);
        assert_eq!(rs.name_at(1_700_000_000), "rs-3-1700000000");
        assert_eq!(rs.timestamp("zones/a@rs-3-1700000000"), Some(1_700_000_000));
        assert_eq!(rs.timestamp("zones/a@other"), None);
        assert_eq!(SnapshotPrefix::Backup.name_at(12), "is-12");
        assert_eq!(SnapshotPrefix::Backup.timestamp("is-12"), Some(12));
    }
}
