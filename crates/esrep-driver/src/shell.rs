//! Drivers backed by the node helper scripts.
//!
//! Each primitive is one helper sub-command (`esrep.sh _zfs_snap ...`). The
//! same helper runs locally or, for a remote host, through SSH.

use crate::runner::{CommandRunner, Target};
use crate::{DriverError, HostDriver, TransferDriver};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const NULL: &str = "null";

pub struct ShellHost {
    runner: CommandRunner,
    helper: PathBuf,
}

impl ShellHost {
    pub fn new(runner: CommandRunner, helper: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            helper: helper.into(),
        }
    }

    fn argv(&self, args: &[&str]) -> Vec<String> {
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(self.helper.display().to_string());
        argv.extend(args.iter().map(|arg| (*arg).to_owned()));
        argv
    }

    fn run(&self, args: &[&str]) -> Result<String, DriverError> {
        self.runner.run(&self.argv(args), None)
    }

    fn run_unit(&self, args: &[&str]) -> Result<(), DriverError> {
        self.run(args).map(drop)
    }

    fn run_merged(&self, args: &[&str]) -> Result<String, DriverError> {
        self.runner.run_merged(&self.argv(args))
    }
}

fn with_flag<'a>(mut args: Vec<&'a str>, flag: bool) -> Vec<&'a str> {
    if flag {
        args.push("true");
    }
    args
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

impl HostDriver for ShellHost {
    fn name(&self) -> String {
        match self.runner.target() {
            Target::Local => "local".to_owned(),
            Target::Ssh(ssh) => format!("ssh:{}", ssh.host),
        }
    }

    fn is_remote(&self) -> bool {
        matches!(self.runner.target(), Target::Ssh(_))
    }

    fn hostname(&self) -> Result<String, DriverError> {
        self.run(&["get_hostname"])
    }

    fn get_property(&self, dataset: &str, name: &str) -> Result<String, DriverError> {
        self.run(&["_zfs_dataset_property", dataset, name])
    }

    fn set_property(
        &self,
        dataset: &str,
        name: &str,
        value: &str,
        children: bool,
    ) -> Result<(), DriverError> {
        let command = if children {
            "_zfs_set_dataset_property_children"
        } else {
            "_zfs_set_dataset_property"
        };
        self.run_unit(&[command, dataset, name, value])
    }

    fn clear_property(&self, dataset: &str, name: &str) -> Result<(), DriverError> {
        self.run_unit(&["_zfs_clear_dataset_property", dataset, name])
    }

    fn get_properties(
        &self,
        dataset: &str,
        names: &[&str],
    ) -> Result<BTreeMap<String, String>, DriverError> {
        let output = self.run(&["_zfs_dataset_properties", dataset, names.join(",").as_str()])?;
        Ok(parse_properties(&output))
    }

    fn create_snapshot(
        &self,
        snapshot: &str,
        metadata: Option<&str>,
        fsfreeze: Option<&str>,
    ) -> Result<String, DriverError> {
        let mut args = vec!["_zfs_snap", snapshot, metadata.unwrap_or(NULL)];
        args.extend(fsfreeze);
        self.run_merged(&args)
    }

    fn destroy(&self, target: &str, force: bool) -> Result<(), DriverError> {
        self.run_unit(&with_flag(vec!["_zfs_destroy", target], force))
    }

    fn dataset_exists(&self, dataset: &str) -> Result<bool, DriverError> {
        match self.run(&["_zfs_dataset_exists", dataset]) {
            Ok(_) => Ok(true),
            Err(DriverError::Command { msg, .. }) if is_missing_dataset(&msg) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn mount(&self, dataset: &str) -> Result<(), DriverError> {
        self.run_unit(&["_zfs_mount", dataset])
    }

    fn unmount(&self, dataset: &str, force: bool) -> Result<(), DriverError> {
        self.run_unit(&with_flag(vec!["_zfs_unmount", dataset], force))
    }

    fn list_snapshots(&self, dataset: &str) -> Result<Vec<String>, DriverError> {
        let output = self.run(&["_zfs_list_snapshots", dataset])?;
        Ok(parse_snapshot_list(&output))
    }

    fn list_snapshot_sizes(&self, dataset: &str) -> Result<Vec<(String, u64)>, DriverError> {
        let output = self.run(&["_zfs_list_snapshots", dataset, "name,written"])?;
        Ok(parse_snapshot_sizes(&output))
    }

    fn rename_dataset(
        &self,
        current: &str,
        new: &str,
        set_zoned: bool,
    ) -> Result<(), DriverError> {
        self.run_unit(&with_flag(vec!["_zfs_dataset_rename", current, new], set_zoned))
    }

    fn rename_children(
        &self,
        current: &str,
        new: &str,
        set_zoned: bool,
    ) -> Result<(), DriverError> {
        self.run_unit(&with_flag(vec!["_zfs_rename_children", current, new], set_zoned))
    }

    fn create_dataset(
        &self,
        dataset: &str,
        kind: &str,
        properties: &BTreeMap<String, String>,
    ) -> Result<(), DriverError> {
        let assignments: Vec<String> = properties.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let mut args = vec!["_zfs_dataset_create", dataset, kind];
        args.extend(assignments.iter().map(String::as_str));
        self.run_unit(&args)
    }

    fn destroy_all_snapshots(&self, dataset: &str) -> Result<(), DriverError> {
        self.run_unit(&["_zfs_destroy_snapshots", dataset])
    }

    fn vm_json(&self, uuid: &str) -> Result<String, DriverError> {
        self.run(&["_vm_json", uuid])
    }

    fn vm_create(&self, json: &str) -> Result<(), DriverError> {
        self.runner
            .run(&self.argv(&["_vm_create"]), Some(json.as_bytes()))
            .map(drop)
    }

    fn vm_remove_indestructible(&self, uuid: &str) -> Result<(), DriverError> {
        self.run_unit(&["_vm_remove_indestructible_property", uuid])
    }

    fn vm_delete(&self, uuid: &str) -> Result<(), DriverError> {
        self.run_unit(&["_vm_delete", uuid])
    }

    fn vm_start(&self, uuid: &str) -> Result<(), DriverError> {
        self.run_unit(&["_vm_start", uuid])
    }

    fn vm_stop(&self, uuid: &str, force: bool) -> Result<(), DriverError> {
        let command = if force { "_vm_stop_force" } else { "_vm_stop" };
        self.run_unit(&[command, uuid])
    }

    fn service_status(&self, fmri: &str, columns: &[&str]) -> Result<String, DriverError> {
        self.run_merged(&["_service_status", fmri, columns.join(",").as_str()])
    }

    fn service_enable(&self, fmri: &str) -> Result<(), DriverError> {
        self.run_unit(&["_service_enable", fmri])
    }

    fn service_disable(&self, fmri: &str) -> Result<(), DriverError> {
        self.run_unit(&["_service_disable", fmri])
    }

    fn service_restart(&self, fmri: &str) -> Result<(), DriverError> {
        self.run_unit(&["_service_restart", fmri])
    }

    fn service_validate(&self, manifest: &Path) -> Result<(), DriverError> {
        self.run_unit(&["_service_validate", path_arg(manifest).as_str()])
    }

    fn service_import(&self, fmri: &str, manifest: &Path) -> Result<(), DriverError> {
        self.run_unit(&["_service_import", fmri, path_arg(manifest).as_str()])
    }

    fn service_export(&self, fmri: &str) -> Result<String, DriverError> {
        self.run(&["_service_export", fmri])
    }

    fn service_delete(&self, fmri: &str) -> Result<(), DriverError> {
        self.run_unit(&["_service_delete", fmri])
    }

    fn service_save(&self, fmri: &str) -> Result<String, DriverError> {
        self.run(&["_service_save", fmri])
    }

    fn service_exists(&self, fmri: &str) -> Result<bool, DriverError> {
        match self.service_export(fmri) {
            Ok(_) => Ok(true),
            Err(DriverError::Command { msg, .. }) if is_missing_service(&msg) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn service_instance_import(&self, fmri: &str, manifest: &Path) -> Result<(), DriverError> {
        self.run_unit(&["_service_instance_import", fmri, path_arg(manifest).as_str()])
    }

    fn service_instance_delete(&self, fmri: &str, instance: &str) -> Result<(), DriverError> {
        self.run_unit(&["_service_instance_delete", fmri, instance])
    }

    fn service_instance_exists(&self, fmri: &str) -> Result<bool, DriverError> {
        match self.service_status(fmri, &["state"]) {
            Ok(_) => Ok(true),
            Err(DriverError::Command { msg, .. }) if is_missing_instance(&msg) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Transfers run locally; the helper reaches the peer itself.
pub struct ShellTransfer {
    runner: CommandRunner,
    helper: PathBuf,
    peer: Option<String>,
}

impl ShellTransfer {
    pub fn new(runner: CommandRunner, helper: impl Into<PathBuf>, peer: Option<String>) -> Self {
        Self {
            runner,
            helper: helper.into(),
            peer,
        }
    }

    fn require_peer(&self) -> Result<&str, DriverError> {
        self.peer.as_deref().ok_or(DriverError::NoPeer)
    }

    fn run(&self, args: &[&str]) -> Result<(), DriverError> {
        let mut argv = vec![self.helper.display().to_string()];
        argv.extend(args.iter().map(|arg| (*arg).to_owned()));
        self.runner.run(&argv, None).map(drop)
    }
}

impl TransferDriver for ShellTransfer {
    fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    fn send_recv(
        &self,
        snapshot: &str,
        dataset: &str,
        incremental: Option<&str>,
        limit: Option<&str>,
    ) -> Result<(), DriverError> {
        let host = self.require_peer()?;
        let mut args = vec!["zfs_send_recv", dataset, snapshot, host, incremental.unwrap_or(NULL)];
        args.extend(limit);
        self.run(&args)
    }

    fn sync_quota(&self, source: &str, destination: &str) -> Result<(), DriverError> {
        let host = self.require_peer()?;
        self.run(&["zfs_sync_quota", source, destination, host])
    }

    fn backup_dataset(
        &self,
        snapshot: &str,
        dataset: &str,
        incremental: Option<&str>,
        limit: Option<&str>,
    ) -> Result<(), DriverError> {
        let mut args = match self.peer.as_deref() {
            Some(host) => vec!["zfs_dataset_backup_remote", dataset, snapshot, host],
            None => vec!["zfs_dataset_backup_local", dataset, snapshot],
        };
        args.push(incremental.unwrap_or(NULL));
        args.extend(limit);
        self.run(&args)
    }

    fn restore_dataset(&self, snapshot: &str, dataset: &str) -> Result<(), DriverError> {
        match self.peer.as_deref() {
            Some(host) => self.run(&["zfs_dataset_restore_remote", snapshot, dataset, host]),
            None => self.run(&["zfs_dataset_restore_local", snapshot, dataset]),
        }
    }

    fn backup_to_file(
        &self,
        source: &str,
        file: &Path,
        compression: Option<&str>,
        limit: Option<&str>,
        fsfreeze: Option<&str>,
    ) -> Result<(), DriverError> {
        let file = path_arg(file);
        let compression = compression.unwrap_or(NULL);
        let limit = limit.unwrap_or(NULL);
        let mut args = match self.peer.as_deref() {
            Some(host) => vec!["zfs_file_backup_remote", source, file.as_str(), host, compression, limit],
            None => vec!["zfs_file_backup_local", source, file.as_str(), compression, limit],
        };
        args.extend(fsfreeze);
        self.run(&args)
    }

    fn restore_file(&self, file: &Path, dataset: &str) -> Result<(), DriverError> {
        let file = path_arg(file);
        match self.peer.as_deref() {
            Some(host) => self.run(&["zfs_file_restore_remote", file.as_str(), dataset, host]),
            None => self.run(&["zfs_file_restore_local", file.as_str(), dataset]),
        }
    }
}

/// `name value` lines from `zfs get -H -o property,value`. Unset (`-`) values
/// are dropped and `0` becomes `none`.
pub fn parse_properties(output: &str) -> BTreeMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let mut words = line.split_whitespace();
            let name = words.next()?;
            let value = words.next()?;
            match value {
                "-" => None,
                "0" => Some((name.to_owned(), "none".to_owned())),
                other => Some((name.to_owned(), other.to_owned())),
            }
        })
        .collect()
}

pub fn parse_snapshot_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect()
}

/// `name written` lines; an unparsable size counts as zero.
pub fn parse_snapshot_sizes(output: &str) -> Vec<(String, u64)> {
    output
        .lines()
        .filter_map(|line| {
            let mut words = line.split_whitespace();
            let name = words.next()?;
            let written = words.next().and_then(|w| w.parse().ok()).unwrap_or(0);
            Some((name.to_owned(), written))
        })
        .collect()
}

pub fn is_missing_dataset(msg: &str) -> bool {
    msg.contains("does not exist")
}

pub fn is_missing_service(msg: &str) -> bool {
    msg.contains("doesn't match any service")
}

pub fn is_missing_instance(msg: &str) -> bool {
    msg.contains("doesn't match any instances")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CancelToken;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn properties_drop_unset_and_map_zero() {
        let props = parse_properties(
            "type filesystem\nvolsize -\nquota 0\nrecordsize 131072\nzoned on\n\n",
        );
        assert_eq!(props.len(), 4);
        assert_eq!(props["type"], "filesystem");
        assert_eq!(props["quota"], "none");
        assert_eq!(props["zoned"], "on");
        assert!(!props.contains_key("volsize"));
    }

    #[test]
    fn snapshot_lists() {
        assert_eq!(
            parse_snapshot_list(" zones/a@rs-1-1\n\nzones/a@rs-1-2 \n"),
            vec!["zones/a@rs-1-1", "zones/a@rs-1-2"]
        );
        assert_eq!(
            parse_snapshot_sizes("zones/a@is-1\t1024\nzones/a@is-2 x\n"),
            vec![("zones/a@is-1".to_owned(), 1024), ("zones/a@is-2".to_owned(), 0)]
        );
    }

    #[test]
    fn missing_messages() {
        assert!(is_missing_dataset("cannot open 'zones/x': dataset does not exist"));
        assert!(is_missing_service(
            "svccfg: Pattern 'application/esrep-sync' doesn't match any services"
        ));
        assert!(is_missing_instance(
            "svcs: Pattern 'svc:/application/esrep-sync:slave-x' doesn't match any instances"
        ));
        assert!(!is_missing_dataset("permission denied"));
    }

    /// A helper that logs its argv and answers a few sub-commands.
    fn fake_helper(dir: &Path) -> PathBuf {
        let path = dir.join("helper.sh");
        let log = dir.join("argv.log");
        std::fs::write(
            &path,
            format!(
                r#"#!/bin/sh
echo "$@" >> {log}
case "$1" in
  get_hostname) echo node01 ;;
  _zfs_dataset_exists) echo "cannot open '$2': dataset does not exist" >&2; exit 1 ;;
  _zfs_dataset_properties) printf 'type volume\nvolsize 10G\nzoned -\n' ;;
  _zfs_snap) echo "frozen" >&2 ;;
  _service_export) echo "svccfg: Pattern '$2' doesn't match any services" >&2; exit 1 ;;
  _service_status) echo online ;;
  _vm_create) cat > {dir}/vm.json ;;
esac
"#,
                log = log.display(),
                dir = dir.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn logged(dir: &Path) -> Vec<String> {
        std::fs::read_to_string(dir.join("argv.log"))
            .unwrap()
            .lines()
            .map(str::to_owned)
            .collect()
    }

    #[test]
    fn shell_host_maps_helper_protocol() {
        let dir = tempfile::tempdir().unwrap();
        let host = ShellHost::new(CommandRunner::local(CancelToken::new()), fake_helper(dir.path()));

        assert_eq!(host.name(), "local");
        assert!(!host.is_remote());
        assert_eq!(host.hostname().unwrap(), "node01");
        assert!(!host.dataset_exists("zones/missing").unwrap());
        assert!(!host.service_exists("application/esrep-sync").unwrap());
        assert!(host.service_instance_exists("svc:/application/esrep-sync:slave-x").unwrap());

        let props = host.get_properties("zones/vol", &["type", "volsize", "zoned"]).unwrap();
        assert_eq!(props.get("volsize").map(String::as_str), Some("10G"));
        assert!(!props.contains_key("zoned"));

        assert_eq!(host.create_snapshot("zones/a@is-1", Some("es:bkpname=x"), None).unwrap(), "frozen");
        host.destroy("zones/a@is-1,is-2", false).unwrap();
        host.destroy("zones/a", true).unwrap();
        host.vm_stop("abc", true).unwrap();
        host.vm_create("{\"uuid\":\"abc\"}").unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("vm.json")).unwrap(),
            "{\"uuid\":\"abc\"}"
        );

        let log = logged(dir.path());
        assert!(log.contains(&"_zfs_snap zones/a@is-1 es:bkpname=x".to_owned()));
        assert!(log.contains(&"_zfs_destroy zones/a@is-1,is-2".to_owned()));
        assert!(log.contains(&"_zfs_destroy zones/a true".to_owned()));
        assert!(log.contains(&"_vm_stop_force abc".to_owned()));
    }

    #[test]
    fn shell_transfer_argument_order() {
        let dir = tempfile::tempdir().unwrap();
        let helper = fake_helper(dir.path());
        let remote = ShellTransfer::new(
            CommandRunner::local(CancelToken::new()),
            &helper,
            Some("node02".to_owned()),
        );
        remote
            .send_recv("zones/m-disk0@rs-1-2", "zones/s-disk0", Some("zones/m-disk0@rs-1-1"), Some("10M"))
            .unwrap();
        remote.sync_quota("zones/m", "zones/s").unwrap();
        remote
            .backup_to_file("zones/a", Path::new("/b/f.zfs"), None, None, Some("fsfreeze"))
            .unwrap();

        let local = ShellTransfer::new(CommandRunner::local(CancelToken::new()), &helper, None);
        local.backup_dataset("zones/a@is-2", "backups/a", None, None).unwrap();
        local.restore_file(Path::new("/b/f.zfs"), "zones/a").unwrap();
        assert!(matches!(
            local.send_recv("zones/a@x", "zones/b", None, None),
            Err(DriverError::NoPeer)
        ));

        assert_eq!(
            logged(dir.path()),
            vec![
                "zfs_send_recv zones/s-disk0 zones/m-disk0@rs-1-2 node02 zones/m-disk0@rs-1-1 10M",
                "zfs_sync_quota zones/m zones/s node02",
                "zfs_file_backup_remote zones/a /b/f.zfs node02 null null fsfreeze",
                "zfs_dataset_backup_local backups/a zones/a@is-2 null",
                "zfs_file_restore_local /b/f.zfs zones/a",
            ]
        );
    }
}
