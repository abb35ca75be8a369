//! ZFS user properties used to persist replication and backup state.

use crate::TypesError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Name of a ZFS property the engines read or write.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PropertyKey(String);

impl PropertyKey {
    pub const READONLY: &'static str = "readonly";
    pub const ZONED: &'static str = "zoned";
    pub const WRITTEN: &'static str = "written";

    /// `esrep:dst:<id>`, kept on the master disk and pointing at the slave disk.
    pub fn master_link(id: u32) -> Self {
        Self(format!("esrep:dst:{id}"))
    }

    /// `esrep:src:<id>`, kept on the slave disk and pointing at the master disk.
    pub fn slave_link(id: u32) -> Self {
        Self(format!("esrep:src:{id}"))
    }

    /// `es:bkpname`, set atomically on backup snapshots.
    pub fn backup_name() -> Self {
        Self("es:bkpname".to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `name=value` form accepted by `zfs snapshot -o`.
    pub fn assignment(&self, value: &str) -> String {
        format!("{}={value}", self.0)
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PropertyKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Value of a replication peering property: `<host>/<dataset>`.
///
/// The host never contains `/`, so the value is split on the first one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerLink {
    pub host: String,
    pub dataset: String,
}

impl PeerLink {
    pub fn new(host: impl Into<String>, dataset: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            dataset: dataset.into(),
        }
    }
}

impl fmt::Display for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.host, self.dataset)
    }
}

impl FromStr for PeerLink {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((host, dataset)) if !host.is_empty() && !dataset.is_empty() => {
                Ok(Self::new(host, dataset))
            }
            _ => Err(TypesError::InvalidPeerLink(s.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_keys_are_mirrored() {
        assert_eq!(PropertyKey::master_link(1).as_str(), "esrep:dst:1");
        assert_eq!(PropertyKey::slave_link(1).as_str(), "esrep:src:1");
        assert_eq!(
            PropertyKey::backup_name().assignment("daily"),
            "es:bkpname=daily"
        );
    }

    #[test]
    fn peer_link_splits_on_first_slash() {
        let link: PeerLink = "node01/zones/abc-disk0".parse().unwrap();
        assert_eq!(link.host, "node01");
        assert_eq!(link.dataset, "zones/abc-disk0");
        assert_eq!(link.to_string(), "node01/zones/abc-disk0");
    }

    #[test]
    fn unset_property_is_not_a_link() {
        assert!("-".parse::<PeerLink>().is_err());
        assert!("".parse::<PeerLink>().is_err());
        assert!("/zones/a".parse::<PeerLink>().is_err());
        assert!("node01/".parse::<PeerLink>().is_err());
    }
}
