//! `esrep.toml` configuration.
//!
//! Every section is optional; a missing file yields the built-in defaults of a
//! stock compute node.

use crate::TypesError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "/opt/erigones/etc/esrep.toml";
pub const CONFIG_ENV: &str = "ESREP_CONFIG";

const DEFAULT_ERIGONES_HOME: &str = "/opt/erigones";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EsrepConfig {
    #[serde(default)]
    pub helpers: HelperSection,
    #[serde(default)]
    pub ssh: SshSection,
    #[serde(default)]
    pub lock: LockSection,
    #[serde(default)]
    pub service: ServiceSection,
}

/// Helper executables that wrap `zfs`, `vmadm`, `svccfg` and friends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HelperSection {
    #[serde(default = "default_esrep_helper")]
    pub esrep: PathBuf,
    #[serde(default = "default_esbackup_helper")]
    pub esbackup: PathBuf,
    /// Wrapper started by the `esrep-sync` SMF service.
    #[serde(default = "default_sync_helper")]
    pub esrep_sync: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SshSection {
    #[serde(default = "default_ssh_program")]
    pub program: String,
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u32,
    #[serde(default)]
    pub extra_options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockSection {
    #[serde(default = "default_lock_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_lock_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_lock_interval")]
    pub sleep_interval_secs: u64,
}

/// Environment baked into the `esrep-sync` bundle manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceSection {
    #[serde(default = "default_erigones_home")]
    pub erigones_home: PathBuf,
    /// Defaults to the invoking process' `PATH`.
    #[serde(default)]
    pub path: Option<String>,
    /// Defaults to the invoking process' `PYTHONPATH`.
    #[serde(default)]
    pub python_path: Option<String>,
}

fn default_eslib() -> PathBuf {
    Path::new(DEFAULT_ERIGONES_HOME).join("bin/eslib")
}

fn default_esrep_helper() -> PathBuf {
    default_eslib().join("esrep.sh")
}

fn default_esbackup_helper() -> PathBuf {
    default_eslib().join("esbackup.sh")
}

fn default_sync_helper() -> PathBuf {
    default_eslib().join("esrep-sync.sh")
}

fn default_ssh_program() -> String {
    "ssh".to_owned()
}

fn default_ssh_user() -> String {
    "root".to_owned()
}

fn default_connect_timeout() -> u32 {
    10
}

fn default_lock_dir() -> PathBuf {
    PathBuf::from("/var/run")
}

fn default_lock_timeout() -> u64 {
    30
}

fn default_lock_interval() -> u64 {
    1
}

fn default_erigones_home() -> PathBuf {
    PathBuf::from(DEFAULT_ERIGONES_HOME)
}

impl Default for HelperSection {
    fn default() -> Self {
        Self {
            esrep: default_esrep_helper(),
            esbackup: default_esbackup_helper(),
            esrep_sync: default_sync_helper(),
        }
    }
}

impl Default for SshSection {
    fn default() -> Self {
        Self {
            program: default_ssh_program(),
            user: default_ssh_user(),
            connect_timeout: default_connect_timeout(),
            extra_options: Vec::new(),
        }
    }
}

impl Default for LockSection {
    fn default() -> Self {
        Self {
            dir: default_lock_dir(),
            timeout_secs: default_lock_timeout(),
            sleep_interval_secs: default_lock_interval(),
        }
    }
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            erigones_home: default_erigones_home(),
            path: None,
            python_path: None,
        }
    }
}

impl EsrepConfig {
    pub fn parse(content: &str) -> Result<Self, TypesError> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self, TypesError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Resolve the configuration: an explicit path must exist; otherwise
    /// `$ESREP_CONFIG`, then the system-wide file when present, then defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, TypesError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Self::load(Path::new(&path));
        }
        let system = Path::new(DEFAULT_CONFIG_PATH);
        if system.is_file() {
            return Self::load(system);
        }
        Ok(Self::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = EsrepConfig::parse("").unwrap();
        assert_eq!(config, EsrepConfig::default());
        assert_eq!(config.lock.timeout_secs, 30);
        assert_eq!(config.lock.sleep_interval_secs, 1);
        assert_eq!(config.lock.dir, PathBuf::from("/var/run"));
        assert_eq!(config.ssh.user, "root");
        assert_eq!(config.ssh.connect_timeout, 10);
        assert!(config.helpers.esrep.ends_with("esrep.sh"));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = EsrepConfig::parse(
            r#"
[lock]
dir = "/tmp/esrep"

[helpers]
esbackup = "/usr/local/bin/esbackup.sh"
"#,
        )
        .unwrap();
        assert_eq!(config.lock.dir, PathBuf::from("/tmp/esrep"));
        assert_eq!(config.lock.timeout_secs, 30);
        assert_eq!(config.helpers.esbackup, PathBuf::from("/usr/local/bin/esbackup.sh"));
        assert!(config.helpers.esrep.ends_with("esrep.sh"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(EsrepConfig::parse("[lock]\nstale_recovery = true\n").is_err());
        assert!(EsrepConfig::parse("[bogus]\n").is_err());
    }

    #[test]
    fn explicit_path_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(EsrepConfig::resolve(Some(&missing)).is_err());

        let path = dir.path().join("esrep.toml");
        std::fs::write(&path, "[ssh]\nconnect_timeout = 3\n").unwrap();
        let config = EsrepConfig::resolve(Some(&path)).unwrap();
        assert_eq!(config.ssh.connect_timeout, 3);
    }
}
