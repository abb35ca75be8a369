//! In-memory cluster for engine tests.
//!
//! A `MockCluster` holds any number of nodes, each with datasets, snapshots,
//! VMs and SMF services. `MockHost` and `MockTransfer` implement the driver
//! traits against it and reproduce the error messages of the real tools, so
//! the engines' message-based checks are exercised. Every driver call is
//! journaled and can be made to fail.

use crate::shell::parse_properties;
use crate::{CancelToken, DriverError, HostDriver, TransferDriver};
use esrep_types::{build_snapshot, snapshot_name, VmDefinition};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockSnapshot {
    pub name: String,
    pub data: String,
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockDataset {
    pub properties: BTreeMap<String, String>,
    /// Oldest first.
    pub snapshots: Vec<MockSnapshot>,
    pub data: String,
    pub mounted: bool,
}

impl MockDataset {
    fn filesystem(data: &str) -> Self {
        let mut properties = BTreeMap::new();
        properties.insert("type".to_owned(), "filesystem".to_owned());
        Self {
            properties,
            snapshots: Vec::new(),
            data: data.to_owned(),
            mounted: true,
        }
    }

    pub fn snapshot(&self, name: &str) -> Option<&MockSnapshot> {
        self.snapshots.iter().find(|s| s.name == name)
    }

    pub fn snapshot_names(&self) -> Vec<String> {
        self.snapshots.iter().map(|s| s.name.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockInstance {
    pub enabled: bool,
    pub manifest: String,
}

#[derive(Debug, Clone)]
pub struct MockNode {
    pub hostname: String,
    pub reachable: bool,
    pub datasets: BTreeMap<String, MockDataset>,
    pub vms: BTreeMap<String, Value>,
    pub running: BTreeSet<String>,
    pub services: BTreeSet<String>,
    pub instances: BTreeMap<String, MockInstance>,
}

fn missing(target: &str) -> DriverError {
    DriverError::command(1, format!("cannot open '{target}': dataset does not exist"))
}

fn vm_missing(uuid: &str) -> DriverError {
    DriverError::command(1, format!("Cannot find VM with uuid {uuid}"))
}

fn xml_attr<'a>(text: &'a str, tag: &str, attr: &str) -> Option<&'a str> {
    let start = text.find(&format!("<{tag} "))?;
    let rest = &text[start..];
    let rest = &rest[rest.find(&format!("{attr}='"))? + attr.len() + 2..];
    Some(&rest[..rest.find('\'')?])
}

impl MockNode {
    pub fn new(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_owned(),
            reachable: true,
            datasets: BTreeMap::new(),
            vms: BTreeMap::new(),
            running: BTreeSet::new(),
            services: BTreeSet::new(),
            instances: BTreeMap::new(),
        }
    }

    pub fn add_dataset(&mut self, name: &str, data: &str) -> &mut MockDataset {
        self.datasets
            .entry(name.to_owned())
            .or_insert_with(|| MockDataset::filesystem(data))
    }

    pub fn add_volume(&mut self, name: &str, volsize: &str, data: &str) -> &mut MockDataset {
        let ds = self.add_dataset(name, data);
        ds.properties.insert("type".to_owned(), "volume".to_owned());
        ds.properties.insert("volsize".to_owned(), volsize.to_owned());
        ds
    }

    pub fn dataset(&self, name: &str) -> Option<&MockDataset> {
        self.datasets.get(name)
    }

    pub fn dataset_mut(&mut self, name: &str) -> Option<&mut MockDataset> {
        self.datasets.get_mut(name)
    }

    /// Simulate guest writes.
    pub fn write(&mut self, name: &str, data: &str) -> bool {
        match self.datasets.get_mut(name) {
            Some(ds) => {
                ds.data = data.to_owned();
                true
            }
            None => false,
        }
    }

    pub fn snapshot_names(&self, dataset: &str) -> Vec<String> {
        self.datasets
            .get(dataset)
            .map(MockDataset::snapshot_names)
            .unwrap_or_default()
    }

    pub fn property(&self, dataset: &str, name: &str) -> Option<String> {
        self.datasets.get(dataset)?.properties.get(name).cloned()
    }

    pub fn has_vm(&self, uuid: &str) -> bool {
        self.vms.contains_key(uuid)
    }

    pub fn is_running(&self, uuid: &str) -> bool {
        self.running.contains(uuid)
    }

    pub fn instance(&self, fmri: &str) -> Option<&MockInstance> {
        self.instances.get(fmri)
    }

    /// Register a VM and create its datasets the way the hypervisor tooling does.
    pub fn add_vm(&mut self, definition: Value) -> Result<(), DriverError> {
        let vm = VmDefinition::from_value(definition.clone())
            .map_err(|e| DriverError::command(1, e.to_string()))?;
        if self.vms.contains_key(&vm.uuid) {
            return Err(DriverError::command(
                1,
                format!("VM with uuid {} already exists", vm.uuid),
            ));
        }
        if let Ok(root) = vm.quota_dataset() {
            self.add_dataset(&root, "");
        }
        if !vm.is_hvm() {
            if let Ok(cores) = vm.cores_dataset() {
                self.add_dataset(&cores, "");
            }
        }
        for (index, disk) in vm.disks().unwrap_or_default().iter().enumerate() {
            self.add_dataset(disk, &format!("blank-{index}"));
        }
        self.vms.insert(vm.uuid, definition);
        Ok(())
    }

    fn descendants(&self, name: &str) -> Vec<String> {
        let prefix = format!("{name}/");
        self.datasets
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect()
    }

    fn require(&self, name: &str) -> Result<&MockDataset, DriverError> {
        self.datasets.get(name).ok_or_else(|| missing(name))
    }

    fn require_mut(&mut self, name: &str) -> Result<&mut MockDataset, DriverError> {
        self.datasets.get_mut(name).ok_or_else(|| missing(name))
    }

    fn require_parent(&self, name: &str) -> Result<(), DriverError> {
        match name.rsplit_once('/') {
            // pools always exist
            Some((parent, _)) if parent.contains('/') && !self.datasets.contains_key(parent) => {
                Err(DriverError::command(
                    1,
                    format!("cannot create '{name}': parent does not exist"),
                ))
            }
            _ => Ok(()),
        }
    }

    fn remove_tree(&mut self, name: &str) {
        for child in self.descendants(name) {
            self.datasets.remove(&child);
        }
        self.datasets.remove(name);
    }

    fn move_tree(&mut self, current: &str, new: &str) -> Result<(), DriverError> {
        if self.datasets.contains_key(new) {
            return Err(DriverError::command(
                1,
                format!("cannot rename to '{new}': dataset already exists"),
            ));
        }
        self.require(current)?;
        let mut names = self.descendants(current);
        names.push(current.to_owned());
        for name in names {
            if let Some(ds) = self.datasets.remove(&name) {
                let renamed = format!("{new}{}", &name[current.len()..]);
                self.datasets.insert(renamed, ds);
            }
        }
        Ok(())
    }

    fn read_property(&self, target: &str, name: &str) -> Result<String, DriverError> {
        if let Some((dataset, snap)) = target.split_once('@') {
            let snapshot = self
                .require(dataset)?
                .snapshot(snap)
                .ok_or_else(|| missing(target))?;
            return Ok(match name {
                "written" => snapshot.data.len().to_string(),
                other => snapshot
                    .properties
                    .get(other)
                    .cloned()
                    .unwrap_or_else(|| "-".to_owned()),
            });
        }
        let ds = self.require(target)?;
        Ok(match (ds.properties.get(name), name) {
            (Some(value), _) => value.clone(),
            (None, "readonly" | "zoned") => "off".to_owned(),
            (None, "quota") => "0".to_owned(),
            (None, _) => "-".to_owned(),
        })
    }
}

#[derive(Debug)]
struct Fault {
    operation: String,
    target: String,
    skip: usize,
    rc: i32,
    message: String,
}

#[derive(Debug, Default)]
struct ClusterState {
    nodes: BTreeMap<String, MockNode>,
    faults: Vec<Fault>,
    calls: Vec<String>,
    cancel: Option<CancelToken>,
}

impl ClusterState {
    fn begin(&mut self, node: &str, operation: &str, target: &str) -> Result<(), DriverError> {
        if let Some(token) = &self.cancel {
            token.check()?;
        }
        self.calls.push(format!("{node} {operation} {target}").trim_end().to_owned());
        self.reachable(node)?;

        let matching = self
            .faults
            .iter()
            .position(|f| f.operation == operation && target.contains(&f.target));
        if let Some(index) = matching {
            if self.faults[index].skip > 0 {
                self.faults[index].skip -= 1;
            } else {
                let fault = self.faults.remove(index);
                return Err(DriverError::command(fault.rc, fault.message));
            }
        }
        Ok(())
    }

    fn reachable(&self, node: &str) -> Result<(), DriverError> {
        match self.nodes.get(node) {
            Some(n) if n.reachable => Ok(()),
            _ => Err(DriverError::command(
                255,
                format!("ssh: connect to host {node} port 22: Connection timed out"),
            )),
        }
    }

    fn node(&self, name: &str) -> Result<&MockNode, DriverError> {
        self.nodes
            .get(name)
            .ok_or_else(|| DriverError::command(255, format!("unknown host {name}")))
    }

    fn node_mut(&mut self, name: &str) -> Result<&mut MockNode, DriverError> {
        self.nodes
            .get_mut(name)
            .ok_or_else(|| DriverError::command(255, format!("unknown host {name}")))
    }

    /// `zfs send [-R] [-i incremental] snapshot | zfs recv [-F] dataset`.
    fn receive(
        &mut self,
        from: &str,
        snapshot: &str,
        to: &str,
        dataset: &str,
        incremental: Option<&str>,
        overwrite: bool,
    ) -> Result<(), DriverError> {
        let (source, name) = snapshot
            .split_once('@')
            .ok_or_else(|| DriverError::command(1, format!("invalid snapshot '{snapshot}'")))?;

        let streams: Vec<(String, MockSnapshot, BTreeMap<String, String>)> = {
            let src = self.node(from)?;
            let mut names = vec![source.to_owned()];
            names.extend(src.descendants(source));
            names
                .into_iter()
                .filter_map(|ds_name| {
                    let ds = src.datasets.get(&ds_name)?;
                    let snap = ds.snapshot(name)?.clone();
                    let kept: BTreeMap<String, String> = ds
                        .properties
                        .iter()
                        .filter(|(k, _)| matches!(k.as_str(), "type" | "volsize"))
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect();
                    Some((ds_name[source.len()..].to_owned(), snap, kept))
                })
                .collect()
        };
        if !streams.iter().any(|(suffix, _, _)| suffix.is_empty()) {
            return Err(missing(snapshot));
        }

        let dst = self.node_mut(to)?;
        for (suffix, snap, kept) in streams {
            let target = format!("{dataset}{suffix}");
            match incremental {
                None => match dst.datasets.get_mut(&target) {
                    Some(existing) if overwrite && suffix.is_empty() => {
                        existing.data.clone_from(&snap.data);
                        existing.snapshots = vec![snap];
                    }
                    Some(_) => {
                        return Err(DriverError::command(
                            1,
                            format!("cannot receive new filesystem stream: destination '{target}' exists"),
                        ))
                    }
                    None => {
                        dst.require_parent(&target)?;
                        let mut received = MockDataset::filesystem(&snap.data);
                        received.properties.extend(kept);
                        received.snapshots.push(snap);
                        dst.datasets.insert(target, received);
                    }
                },
                Some(base) => {
                    let base = snapshot_name(base);
                    let ds = dst.require_mut(&target)?;
                    let Some(position) = ds.snapshots.iter().position(|s| s.name == base) else {
                        return Err(DriverError::command(
                            1,
                            format!("cannot receive incremental stream: most recent snapshot of '{target}' does not match incremental source"),
                        ));
                    };
                    // recv -F rolls back to the incremental source
                    ds.snapshots.truncate(position + 1);
                    ds.data.clone_from(&snap.data);
                    ds.snapshots.push(snap);
                }
            }
        }
        Ok(())
    }
}

/// Shared in-memory cluster.
#[derive(Debug, Clone, Default)]
pub struct MockCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_node(&self, name: &str) {
        self.lock()
            .nodes
            .entry(name.to_owned())
            .or_insert_with(|| MockNode::new(name));
    }

    /// Inspect or prepare a node.
    pub fn node<R>(&self, name: &str, f: impl FnOnce(&mut MockNode) -> R) -> R {
        let mut state = self.lock();
        let node = state
            .nodes
            .entry(name.to_owned())
            .or_insert_with(|| MockNode::new(name));
        f(node)
    }

    /// Driver for `node`; `remote` marks it as reached over SSH.
    pub fn host(&self, node: &str, remote: bool) -> MockHost {
        self.add_node(node);
        MockHost {
            cluster: self.clone(),
            node: node.to_owned(),
            remote,
        }
    }

    pub fn transfer(&self, node: &str, peer: Option<&str>) -> MockTransfer {
        self.add_node(node);
        MockTransfer {
            cluster: self.clone(),
            node: node.to_owned(),
            peer: peer.map(str::to_owned),
        }
    }

    /// Make every driver call a yield point of `token`, like the shell drivers.
    pub fn attach_cancel(&self, token: &CancelToken) {
        self.lock().cancel = Some(token.clone());
    }

    pub fn set_reachable(&self, node: &str, reachable: bool) {
        self.node(node, |n| n.reachable = reachable);
    }

    /// Fail the next `operation` call whose target contains `target`.
    pub fn fail_on(&self, operation: &str, target: &str) {
        self.fail_after(operation, target, 0);
    }

    /// Let `skip` matching calls through, then fail the next one.
    pub fn fail_after(&self, operation: &str, target: &str, skip: usize) {
        self.lock().faults.push(Fault {
            operation: operation.to_owned(),
            target: target.to_owned(),
            skip,
            rc: 1,
            message: format!("{operation} failed on {target}"),
        });
    }

    /// `<node> <operation> <target>` for every driver call so far.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }
}

pub struct MockHost {
    cluster: MockCluster,
    node: String,
    remote: bool,
}

impl MockHost {
    fn call<R>(
        &self,
        operation: &str,
        target: &str,
        f: impl FnOnce(&mut MockNode) -> Result<R, DriverError>,
    ) -> Result<R, DriverError> {
        let mut state = self.cluster.lock();
        state.begin(&self.node, operation, target)?;
        f(state.node_mut(&self.node)?)
    }

    fn vm_mut<'a>(node: &'a mut MockNode, uuid: &str) -> Result<&'a mut Value, DriverError> {
        node.vms.get_mut(uuid).ok_or_else(|| vm_missing(uuid))
    }
}

impl HostDriver for MockHost {
    fn name(&self) -> String {
        format!("mock:{}", self.node)
    }

    fn is_remote(&self) -> bool {
        self.remote
    }

    fn hostname(&self) -> Result<String, DriverError> {
        self.call("hostname", "", |node| Ok(node.hostname.clone()))
    }

    fn get_property(&self, dataset: &str, name: &str) -> Result<String, DriverError> {
        self.call("get_property", dataset, |node| node.read_property(dataset, name))
    }

    fn set_property(
        &self,
        dataset: &str,
        name: &str,
        value: &str,
        children: bool,
    ) -> Result<(), DriverError> {
        self.call("set_property", dataset, |node| {
            node.require(dataset)?;
            let targets = if children {
                node.descendants(dataset)
            } else {
                vec![dataset.to_owned()]
            };
            for target in targets {
                if let Some(ds) = node.datasets.get_mut(&target) {
                    ds.properties.insert(name.to_owned(), value.to_owned());
                }
            }
            Ok(())
        })
    }

    fn clear_property(&self, dataset: &str, name: &str) -> Result<(), DriverError> {
        self.call("clear_property", dataset, |node| {
            node.require_mut(dataset)?.properties.remove(name);
            Ok(())
        })
    }

    fn get_properties(
        &self,
        dataset: &str,
        names: &[&str],
    ) -> Result<BTreeMap<String, String>, DriverError> {
        self.call("get_properties", dataset, |node| {
            let mut output = String::new();
            for name in names {
                let _ = writeln!(output, "{name}\t{}", node.read_property(dataset, name)?);
            }
            Ok(parse_properties(&output))
        })
    }

    fn create_snapshot(
        &self,
        snapshot: &str,
        metadata: Option<&str>,
        fsfreeze: Option<&str>,
    ) -> Result<String, DriverError> {
        self.call("create_snapshot", snapshot, |node| {
            let (dataset, name) = snapshot.split_once('@').ok_or_else(|| missing(snapshot))?;
            let ds = node.require_mut(dataset)?;
            if ds.snapshot(name).is_some() {
                return Err(DriverError::command(
                    1,
                    format!("cannot create snapshot '{snapshot}': dataset already exists"),
                ));
            }
            let properties = metadata
                .and_then(|m| m.split_once('='))
                .map(|(k, v)| BTreeMap::from([(k.to_owned(), v.to_owned())]))
                .unwrap_or_default();
            ds.snapshots.push(MockSnapshot {
                name: name.to_owned(),
                data: ds.data.clone(),
                properties,
            });
            Ok(fsfreeze
                .map(|f| format!("Filesystem freeze ({f}) completed"))
                .unwrap_or_default())
        })
    }

    fn destroy(&self, target: &str, force: bool) -> Result<(), DriverError> {
        self.call("destroy", target, |node| {
            if let Some((dataset, names)) = target.split_once('@') {
                let ds = node.require_mut(dataset)?;
                let names: Vec<&str> = names.split(',').collect();
                let before = ds.snapshots.len();
                ds.snapshots.retain(|s| !names.contains(&s.name.as_str()));
                if ds.snapshots.len() == before {
                    return Err(DriverError::command(
                        1,
                        "could not find any snapshots to destroy; check snapshot names.",
                    ));
                }
                return Ok(());
            }
            node.require(target)?;
            if !force && !node.descendants(target).is_empty() {
                return Err(DriverError::command(
                    1,
                    format!("cannot destroy '{target}': filesystem has children"),
                ));
            }
            node.remove_tree(target);
            Ok(())
        })
    }

    fn dataset_exists(&self, dataset: &str) -> Result<bool, DriverError> {
        self.call("dataset_exists", dataset, |node| {
            Ok(match dataset.split_once('@') {
                Some((ds, snap)) => node.dataset(ds).and_then(|d| d.snapshot(snap)).is_some(),
                None => node.datasets.contains_key(dataset),
            })
        })
    }

    fn mount(&self, dataset: &str) -> Result<(), DriverError> {
        self.call("mount", dataset, |node| {
            node.require_mut(dataset)?.mounted = true;
            Ok(())
        })
    }

    fn unmount(&self, dataset: &str, _force: bool) -> Result<(), DriverError> {
        self.call("unmount", dataset, |node| {
            node.require_mut(dataset)?.mounted = false;
            Ok(())
        })
    }

    fn list_snapshots(&self, dataset: &str) -> Result<Vec<String>, DriverError> {
        self.call("list_snapshots", dataset, |node| {
            Ok(node
                .require(dataset)?
                .snapshots
                .iter()
                .map(|s| build_snapshot(dataset, &s.name))
                .collect())
        })
    }

    fn list_snapshot_sizes(&self, dataset: &str) -> Result<Vec<(String, u64)>, DriverError> {
        self.call("list_snapshot_sizes", dataset, |node| {
            Ok(node
                .require(dataset)?
                .snapshots
                .iter()
                .map(|s| (build_snapshot(dataset, &s.name), s.data.len() as u64))
                .collect())
        })
    }

    fn rename_dataset(
        &self,
        current: &str,
        new: &str,
        set_zoned: bool,
    ) -> Result<(), DriverError> {
        self.call("rename_dataset", current, |node| {
            node.move_tree(current, new)?;
            if set_zoned {
                node.require_mut(new)?
                    .properties
                    .insert("zoned".to_owned(), "on".to_owned());
            }
            Ok(())
        })
    }

    fn rename_children(
        &self,
        current: &str,
        new: &str,
        set_zoned: bool,
    ) -> Result<(), DriverError> {
        self.call("rename_children", current, |node| {
            node.require(current)?;
            node.require(new)?;
            let children: Vec<String> = node
                .descendants(current)
                .into_iter()
                .filter(|c| !c[current.len() + 1..].contains('/'))
                .collect();
            for child in children {
                let renamed = format!("{new}{}", &child[current.len()..]);
                node.move_tree(&child, &renamed)?;
                if set_zoned {
                    node.require_mut(&renamed)?
                        .properties
                        .insert("zoned".to_owned(), "on".to_owned());
                }
            }
            Ok(())
        })
    }

    fn create_dataset(
        &self,
        dataset: &str,
        kind: &str,
        properties: &BTreeMap<String, String>,
    ) -> Result<(), DriverError> {
        self.call("create_dataset", dataset, |node| {
            if node.datasets.contains_key(dataset) {
                return Err(DriverError::command(
                    1,
                    format!("cannot create '{dataset}': dataset already exists"),
                ));
            }
            node.require_parent(dataset)?;
            let ds = if kind == "filesystem" {
                node.add_dataset(dataset, "")
            } else {
                node.add_volume(dataset, kind, "")
            };
            ds.properties
                .extend(properties.iter().map(|(k, v)| (k.clone(), v.clone())));
            Ok(())
        })
    }

    fn destroy_all_snapshots(&self, dataset: &str) -> Result<(), DriverError> {
        self.call("destroy_all_snapshots", dataset, |node| {
            node.require_mut(dataset)?.snapshots.clear();
            Ok(())
        })
    }

    fn vm_json(&self, uuid: &str) -> Result<String, DriverError> {
        self.call("vm_json", uuid, |node| {
            let vm = node.vms.get(uuid).ok_or_else(|| vm_missing(uuid))?;
            Ok(serde_json::to_string(vm)?)
        })
    }

    fn vm_create(&self, json: &str) -> Result<(), DriverError> {
        let definition: Value = serde_json::from_str(json)?;
        let uuid = definition["uuid"].as_str().unwrap_or_default().to_owned();
        self.call("vm_create", &uuid, |node| node.add_vm(definition))
    }

    fn vm_remove_indestructible(&self, uuid: &str) -> Result<(), DriverError> {
        self.call("vm_remove_indestructible", uuid, |node| {
            if let Some(vm) = Self::vm_mut(node, uuid)?.as_object_mut() {
                vm.remove("indestructible_zoneroot");
                vm.remove("indestructible_delegated");
            }
            Ok(())
        })
    }

    fn vm_delete(&self, uuid: &str) -> Result<(), DriverError> {
        self.call("vm_delete", uuid, |node| {
            let value = Self::vm_mut(node, uuid)?;
            if value["indestructible_zoneroot"] == Value::Bool(true)
                || value["indestructible_delegated"] == Value::Bool(true)
            {
                return Err(DriverError::command(1, format!("VM {uuid} is indestructible")));
            }
            let vm = VmDefinition::from_value(value.clone())
                .map_err(|e| DriverError::command(1, e.to_string()))?;
            for disk in vm.disks().unwrap_or_default() {
                node.remove_tree(&disk);
            }
            if let Ok(root) = vm.quota_dataset() {
                node.remove_tree(&root);
            }
            if let Ok(cores) = vm.cores_dataset() {
                node.remove_tree(&cores);
            }
            node.vms.remove(uuid);
            node.running.remove(uuid);
            Ok(())
        })
    }

    fn vm_start(&self, uuid: &str) -> Result<(), DriverError> {
        self.call("vm_start", uuid, |node| {
            Self::vm_mut(node, uuid)?;
            if !node.running.insert(uuid.to_owned()) {
                return Err(DriverError::command(1, format!("VM {uuid} is already running")));
            }
            Ok(())
        })
    }

    fn vm_stop(&self, uuid: &str, force: bool) -> Result<(), DriverError> {
        let operation = if force { "vm_stop_force" } else { "vm_stop" };
        self.call(operation, uuid, |node| {
            Self::vm_mut(node, uuid)?;
            if !node.running.remove(uuid) && !force {
                return Err(DriverError::command(1, format!("VM {uuid} is not running")));
            }
            Ok(())
        })
    }

    fn service_status(&self, fmri: &str, _columns: &[&str]) -> Result<String, DriverError> {
        self.call("service_status", fmri, |node| match node.instances.get(fmri) {
            Some(instance) if instance.enabled => Ok("online".to_owned()),
            Some(_) => Ok("disabled".to_owned()),
            None => Err(DriverError::command(
                1,
                format!("svcs: Pattern '{fmri}' doesn't match any instances"),
            )),
        })
    }

    fn service_enable(&self, fmri: &str) -> Result<(), DriverError> {
        self.call("service_enable", fmri, |node| set_enabled(node, fmri, true))
    }

    fn service_disable(&self, fmri: &str) -> Result<(), DriverError> {
        self.call("service_disable", fmri, |node| set_enabled(node, fmri, false))
    }

    fn service_restart(&self, fmri: &str) -> Result<(), DriverError> {
        self.call("service_restart", fmri, |node| set_enabled(node, fmri, true))
    }

    fn service_validate(&self, manifest: &Path) -> Result<(), DriverError> {
        let text = std::fs::read_to_string(manifest)?;
        self.call("service_validate", &manifest.display().to_string(), |_| {
            if text.contains("<service_bundle") {
                Ok(())
            } else {
                Err(DriverError::command(1, "svccfg: invalid manifest"))
            }
        })
    }

    fn service_import(&self, fmri: &str, manifest: &Path) -> Result<(), DriverError> {
        let text = std::fs::read_to_string(manifest)?;
        self.call("service_import", fmri, |node| {
            let name = xml_attr(&text, "service", "name")
                .ok_or_else(|| DriverError::command(1, "svccfg: no service in manifest"))?;
            node.services.insert(name.to_owned());
            Ok(())
        })
    }

    fn service_export(&self, fmri: &str) -> Result<String, DriverError> {
        self.call("service_export", fmri, |node| {
            if node.services.contains(fmri) {
                Ok(format!("<service name='{fmri}'/>"))
            } else {
                Err(DriverError::command(
                    1,
                    format!("svccfg: Pattern '{fmri}' doesn't match any services"),
                ))
            }
        })
    }

    fn service_delete(&self, fmri: &str) -> Result<(), DriverError> {
        self.call("service_delete", fmri, |node| {
            node.services.remove(fmri);
            let prefix = format!("svc:/{fmri}:");
            node.instances.retain(|k, _| !k.starts_with(&prefix));
            Ok(())
        })
    }

    fn service_save(&self, fmri: &str) -> Result<String, DriverError> {
        self.service_export(fmri)
    }

    fn service_exists(&self, fmri: &str) -> Result<bool, DriverError> {
        self.call("service_exists", fmri, |node| Ok(node.services.contains(fmri)))
    }

    fn service_instance_import(&self, fmri: &str, manifest: &Path) -> Result<(), DriverError> {
        let text = std::fs::read_to_string(manifest)?;
        self.call("service_instance_import", fmri, |node| {
            if !node.services.contains(fmri) {
                return Err(DriverError::command(
                    1,
                    format!("svccfg: Pattern '{fmri}' doesn't match any services"),
                ));
            }
            let name = xml_attr(&text, "instance", "name")
                .ok_or_else(|| DriverError::command(1, "svccfg: no instance in manifest"))?;
            let enabled = xml_attr(&text, "instance", "enabled") == Some("true");
            node.instances.insert(
                format!("svc:/{fmri}:{name}"),
                MockInstance {
                    enabled,
                    manifest: text.clone(),
                },
            );
            Ok(())
        })
    }

    fn service_instance_delete(&self, fmri: &str, instance: &str) -> Result<(), DriverError> {
        let key = format!("svc:/{fmri}:{instance}");
        self.call("service_instance_delete", &key, |node| {
            node.instances.remove(&key).map(drop).ok_or_else(|| {
                DriverError::command(1, format!("svccfg: Pattern '{key}' doesn't match any instances"))
            })
        })
    }

    fn service_instance_exists(&self, fmri: &str) -> Result<bool, DriverError> {
        self.call("service_instance_exists", fmri, |node| {
            Ok(node.instances.contains_key(fmri))
        })
    }
}

fn set_enabled(node: &mut MockNode, fmri: &str, enabled: bool) -> Result<(), DriverError> {
    match node.instances.get_mut(fmri) {
        Some(instance) => {
            instance.enabled = enabled;
            Ok(())
        }
        None => Err(DriverError::command(
            1,
            format!("svcadm: Pattern '{fmri}' doesn't match any instances"),
        )),
    }
}

/// Content of a mock backup file.
#[derive(Debug, Serialize, Deserialize)]
struct FileStream {
    source: String,
    data: String,
    properties: BTreeMap<String, String>,
}

pub struct MockTransfer {
    cluster: MockCluster,
    node: String,
    peer: Option<String>,
}

impl MockTransfer {
    fn call<R>(
        &self,
        operation: &str,
        target: &str,
        f: impl FnOnce(&mut ClusterState, &str) -> Result<R, DriverError>,
    ) -> Result<R, DriverError> {
        let mut state = self.cluster.lock();
        state.begin(&self.node, operation, target)?;
        let peer = self.peer.as_deref().unwrap_or(&self.node);
        state.reachable(peer)?;
        f(&mut *state, peer)
    }
}

impl TransferDriver for MockTransfer {
    fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    fn send_recv(
        &self,
        snapshot: &str,
        dataset: &str,
        incremental: Option<&str>,
        _limit: Option<&str>,
    ) -> Result<(), DriverError> {
        if self.peer.is_none() {
            return Err(DriverError::NoPeer);
        }
        self.call("send_recv", dataset, |state, peer| {
            state.receive(peer, snapshot, &self.node, dataset, incremental, false)
        })
    }

    fn sync_quota(&self, source: &str, destination: &str) -> Result<(), DriverError> {
        if self.peer.is_none() {
            return Err(DriverError::NoPeer);
        }
        self.call("sync_quota", destination, |state, peer| {
            let quota = state.node(peer)?.read_property(source, "quota")?;
            state
                .node_mut(&self.node)?
                .require_mut(destination)?
                .properties
                .insert("quota".to_owned(), quota);
            Ok(())
        })
    }

    fn backup_dataset(
        &self,
        snapshot: &str,
        dataset: &str,
        incremental: Option<&str>,
        _limit: Option<&str>,
    ) -> Result<(), DriverError> {
        self.call("backup_dataset", dataset, |state, peer| {
            state.receive(peer, snapshot, &self.node, dataset, incremental, false)
        })
    }

    fn restore_dataset(&self, snapshot: &str, dataset: &str) -> Result<(), DriverError> {
        self.call("restore_dataset", dataset, |state, peer| {
            state.receive(&self.node, snapshot, peer, dataset, None, true)
        })
    }

    fn backup_to_file(
        &self,
        source: &str,
        file: &Path,
        _compression: Option<&str>,
        _limit: Option<&str>,
        _fsfreeze: Option<&str>,
    ) -> Result<(), DriverError> {
        self.call("backup_to_file", source, |state, peer| {
            let node = state.node(peer)?;
            let (data, properties) = match source.split_once('@') {
                Some((ds, snap)) => {
                    let dataset = node.require(ds)?;
                    let snapshot = dataset.snapshot(snap).ok_or_else(|| missing(source))?;
                    (snapshot.data.clone(), dataset.properties.clone())
                }
                None => {
                    let dataset = node.require(source)?;
                    (dataset.data.clone(), dataset.properties.clone())
                }
            };
            let stream = FileStream {
                source: source.to_owned(),
                data,
                properties,
            };
            std::fs::write(file, serde_json::to_vec(&stream)?)?;
            Ok(())
        })
    }

    fn restore_file(&self, file: &Path, dataset: &str) -> Result<(), DriverError> {
        self.call("restore_file", dataset, |state, peer| {
            let stream: FileStream = serde_json::from_slice(&std::fs::read(file)?)?;
            let ds = state.node_mut(peer)?.require_mut(dataset)?;
            ds.data.clone_from(&stream.data);
            ds.snapshots = vec![MockSnapshot {
                name: snapshot_name(&stream.source).to_owned(),
                data: stream.data,
                properties: BTreeMap::new(),
            }];
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cluster() -> MockCluster {
        let cluster = MockCluster::new();
        cluster.node("node01", |n| {
            n.add_dataset("zones/m-disk0", "v1");
            n.add_dataset("zones/m-disk0/child", "c1");
        });
        cluster.add_node("node02");
        cluster
    }

    #[test]
    fn properties_follow_zfs_conventions() {
        let cluster = cluster();
        let host = cluster.host("node01", false);
        assert_eq!(host.get_property("zones/m-disk0", "esrep:dst:1").unwrap(), "-");
        assert_eq!(host.get_property("zones/m-disk0", "readonly").unwrap(), "off");
        host.set_property("zones/m-disk0", "esrep:dst:1", "node02/zones/s", false)
            .unwrap();
        assert_eq!(
            host.get_property("zones/m-disk0", "esrep:dst:1").unwrap(),
            "node02/zones/s"
        );
        host.clear_property("zones/m-disk0", "esrep:dst:1").unwrap();
        assert_eq!(host.get_property("zones/m-disk0", "esrep:dst:1").unwrap(), "-");

        host.set_property("zones/m-disk0", "zoned", "on", true).unwrap();
        assert_eq!(host.get_property("zones/m-disk0/child", "zoned").unwrap(), "on");
        assert_eq!(host.get_property("zones/m-disk0", "zoned").unwrap(), "off");

        let props = host
            .get_properties("zones/m-disk0", &["type", "quota", "volsize"])
            .unwrap();
        assert_eq!(props.get("type").map(String::as_str), Some("filesystem"));
        assert_eq!(props.get("quota").map(String::as_str), Some("none"));
        assert!(!props.contains_key("volsize"));

        let err = host.get_property("zones/nope", "readonly").unwrap_err();
        assert!(err.message().unwrap().contains("does not exist"));
    }

    #[test]
    fn full_and_incremental_receive() {
        let cluster = cluster();
        let master = cluster.host("node01", true);
        let transfer = cluster.transfer("node02", Some("node01"));

        master.create_snapshot("zones/m-disk0@rs-1-1", None, None).unwrap();
        master
            .create_snapshot("zones/m-disk0/child@rs-1-1", None, None)
            .unwrap();
        transfer
            .send_recv("zones/m-disk0@rs-1-1", "zones/s-disk0", None, None)
            .unwrap();
        cluster.node("node02", |n| {
            assert_eq!(n.dataset("zones/s-disk0").unwrap().data, "v1");
            assert_eq!(n.snapshot_names("zones/s-disk0/child"), vec!["rs-1-1"]);
        });

        cluster.node("node01", |n| n.write("zones/m-disk0", "v2"));
        master.create_snapshot("zones/m-disk0@rs-1-2", None, None).unwrap();
        transfer
            .send_recv(
                "zones/m-disk0@rs-1-2",
                "zones/s-disk0",
                Some("zones/m-disk0@rs-1-1"),
                None,
            )
            .unwrap();
        cluster.node("node02", |n| {
            assert_eq!(n.dataset("zones/s-disk0").unwrap().data, "v2");
            assert_eq!(n.snapshot_names("zones/s-disk0"), vec!["rs-1-1", "rs-1-2"]);
        });

        let err = transfer
            .send_recv("zones/m-disk0@rs-1-2", "zones/s-disk0", None, None)
            .unwrap_err();
        assert!(err.message().unwrap().contains("exists"));
    }

    #[test]
    fn destroy_rules() {
        let cluster = cluster();
        let host = cluster.host("node01", false);
        host.create_snapshot("zones/m-disk0@a", None, None).unwrap();
        host.create_snapshot("zones/m-disk0@b", None, None).unwrap();
        host.destroy("zones/m-disk0@a,b", false).unwrap();
        assert!(host.list_snapshots("zones/m-disk0").unwrap().is_empty());
        assert!(host.destroy("zones/m-disk0@a", false).is_err());

        assert!(host.destroy("zones/m-disk0", false).is_err());
        host.destroy("zones/m-disk0", true).unwrap();
        assert!(!host.dataset_exists("zones/m-disk0/child").unwrap());
    }

    #[test]
    fn vm_lifecycle_creates_and_removes_datasets() {
        let cluster = cluster();
        let host = cluster.host("node02", false);
        let vm = json!({
            "uuid": "s", "brand": "kvm", "zpool": "zones", "hostname": "web",
            "indestructible_zoneroot": true,
            "disks": [{"zfs_filesystem": "zones/s-disk0"}]
        });
        host.vm_create(&vm.to_string()).unwrap();
        assert!(host.dataset_exists("zones/s-disk0").unwrap());
        assert!(host.vm_create(&vm.to_string()).is_err());

        host.vm_start("s").unwrap();
        assert!(host.vm_start("s").is_err());
        host.vm_stop("s", false).unwrap();
        host.vm_stop("s", true).unwrap();

        assert!(host.vm_delete("s").is_err());
        host.vm_remove_indestructible("s").unwrap();
        host.vm_delete("s").unwrap();
        assert!(!host.dataset_exists("zones/s-disk0").unwrap());
        assert!(host.vm_json("s").unwrap_err().message().unwrap().contains("Cannot find VM"));
    }

    #[test]
    fn faults_and_reachability() {
        let cluster = cluster();
        let host = cluster.host("node01", true);
        cluster.fail_after("create_snapshot", "m-disk0", 1);
        host.create_snapshot("zones/m-disk0@a", None, None).unwrap();
        assert!(host.create_snapshot("zones/m-disk0@b", None, None).is_err());
        host.create_snapshot("zones/m-disk0@c", None, None).unwrap();

        cluster.set_reachable("node01", false);
        let err = host.hostname().unwrap_err();
        assert!(matches!(err, DriverError::Command { rc: 255, .. }));
        assert!(cluster.calls().contains(&"node01 hostname".to_owned()));
    }

    #[test]
    fn services_and_instances() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = cluster();
        let host = cluster.host("node02", false);
        let fmri = "svc:/application/esrep-sync:slave-s";

        assert!(!host.service_exists("application/esrep-sync").unwrap());
        assert!(!host.service_instance_exists(fmri).unwrap());

        let bundle = dir.path().join("bundle.xml");
        std::fs::write(&bundle, "<service_bundle><service name='application/esrep-sync' type='service'>").unwrap();
        host.service_validate(&bundle).unwrap();
        host.service_import("application/esrep-sync", &bundle).unwrap();

        let instance = dir.path().join("instance.xml");
        std::fs::write(&instance, "<instance name='slave-s' enabled='false'>").unwrap();
        host.service_instance_import("application/esrep-sync", &instance)
            .unwrap();
        assert_eq!(host.service_status(fmri, &["state"]).unwrap(), "disabled");
        host.service_enable(fmri).unwrap();
        assert_eq!(host.service_status(fmri, &["state"]).unwrap(), "online");

        host.service_instance_delete("application/esrep-sync", "slave-s")
            .unwrap();
        let err = host.service_status(fmri, &["state"]).unwrap_err();
        assert!(err.message().unwrap().contains("doesn't match any instances"));
    }

    #[test]
    fn file_streams_roundtrip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = cluster();
        let transfer = cluster.transfer("node02", Some("node01"));
        let file = dir.path().join("disk0.zfs");
        transfer
            .backup_to_file("zones/m-disk0", &file, Some("gzip"), None, None)
            .unwrap();
        assert!(file.exists());

        cluster.node("node01", |n| n.write("zones/m-disk0", "garbage"));
        transfer.restore_file(&file, "zones/m-disk0").unwrap();
        cluster.node("node01", |n| {
            assert_eq!(n.dataset("zones/m-disk0").unwrap().data, "v1");
        });
    }
}
