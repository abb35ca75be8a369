//! Dataset and file backups between a backup node and a VM host.

use esrep_core::backup::file_checksum;
use esrep_core::{Backup, DsCreate, DsDelete, DsRestore, FileCreate, FileDelete, FileRestore, Response};
use esrep_driver::{CancelToken, Drivers, MockCluster};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};

const SOURCE: &str = "zones/3c1a9f02-disk0";
const DESTINATION: &str = "backups/ds/3c1a9f02-disk0";

static NOW: AtomicI64 = AtomicI64::new(1_700_000_000);

fn cluster() -> MockCluster {
    let cluster = MockCluster::new();
    cluster.node("backup01", |n| {
        n.add_dataset("backups/ds", "");
    });
    cluster.node("node01", |n| {
        n.add_dataset(SOURCE, "v1");
    });
    cluster
}

/// Engine on the backup node for the VM host `node01`.
fn engine(cluster: &MockCluster) -> Backup {
    let drivers = Drivers::new(
        cluster.host("backup01", false),
        cluster.host("node01", true),
        cluster.transfer("backup01", Some("node01")),
    );
    Backup::new(drivers, CancelToken::new()).with_clock(|| NOW.fetch_add(1, Ordering::SeqCst))
}

fn create_request(snapshot: &str, metadata: Option<&Path>) -> DsCreate {
    DsCreate {
        snapshot: format!("{SOURCE}@{snapshot}"),
        destination: DESTINATION.to_owned(),
        name: "daily".to_owned(),
        metadata: metadata.map(Path::to_path_buf),
        json: metadata.map(|_| json!({"vm": "web01", "disk_id": 1})),
        fsfreeze: None,
    }
}

fn assert_ok(response: &Response) {
    assert!(
        response.success,
        "expected success, got rc={} msg={:?}",
        response.rc, response.msg
    );
}

#[test]
fn first_backup_is_a_full_stream() {
    let cluster = cluster();
    let dir = tempfile::tempdir().unwrap();
    let metadata = dir.path().join("web01/disk0/daily.json");

    let response = engine(&cluster).ds_create(create_request("is-100", Some(&metadata)));
    assert_ok(&response);
    assert_eq!(
        response.get("backup_snapshot"),
        Some(&json!(format!("{DESTINATION}@is-100")))
    );
    assert_eq!(response.get("backup_snapshot_size"), Some(&json!(2)));
    assert_eq!(response.get("last_snapshot_name"), Some(&json!("is-100")));
    assert_eq!(response.get("deleted_last_snapshot_names"), Some(&json!([])));
    assert_eq!(
        response.get("metadata_file"),
        Some(&json!(metadata.display().to_string()))
    );

    let stored: Value = serde_json::from_slice(&std::fs::read(&metadata).unwrap()).unwrap();
    assert_eq!(stored["vm"], "web01");

    cluster.node("backup01", |n| {
        assert_eq!(n.snapshot_names(DESTINATION), vec!["is-100"]);
        assert_eq!(n.property(DESTINATION, "readonly").as_deref(), Some("on"));
    });
    cluster.node("node01", |n| {
        let snapshot = n.dataset(SOURCE).unwrap().snapshot("is-100").unwrap();
        assert_eq!(snapshot.properties.get("es:bkpname").map(String::as_str), Some("daily"));
    });
}

#[test]
fn next_backup_is_incremental() {
    let cluster = cluster();
    assert_ok(&engine(&cluster).ds_create(create_request("is-100", None)));
    cluster.node("node01", |n| n.write(SOURCE, "v2-longer"));

    let response = engine(&cluster).ds_create(create_request("is-200", None));
    assert_ok(&response);
    assert_eq!(response.get("backup_snapshot_size"), Some(&json!(9)));
    assert_eq!(response.get("deleted_last_snapshot_names"), Some(&json!(["is-100"])));
    assert_eq!(response.get("update_snapshots"), Some(&json!([])));

    cluster.node("backup01", |n| {
        assert_eq!(n.snapshot_names(DESTINATION), vec!["is-100", "is-200"]);
        assert_eq!(n.dataset(DESTINATION).unwrap().data, "v2-longer");
    });
    // only the newest source snapshot is kept as the next incremental base
    cluster.node("node01", |n| assert_eq!(n.snapshot_names(SOURCE), vec!["is-200"]));
}

#[test]
fn lost_source_snapshot_archives_the_destination() {
    let cluster = cluster();
    assert_ok(&engine(&cluster).ds_create(create_request("is-100", None)));
    cluster.node("node01", |n| n.dataset_mut(SOURCE).unwrap().snapshots.clear());

    let response = engine(&cluster).ds_create(create_request("is-200", None));
    assert_ok(&response);

    let update = response.get("update_snapshots").and_then(Value::as_array).unwrap();
    assert_eq!(update.len(), 1);
    assert_eq!(update[0]["name"], json!(format!("{DESTINATION}@is-100")));
    let renamed = update[0]["new_name"].as_str().unwrap();
    assert!(renamed.starts_with(&format!("{DESTINATION}-arch-")));
    assert!(renamed.ends_with("@is-100"));

    cluster.node("backup01", |n| {
        assert_eq!(n.snapshot_names(DESTINATION), vec!["is-200"]);
        let archive = renamed.split('@').next().unwrap();
        assert_eq!(n.snapshot_names(archive), vec!["is-100"]);
    });
}

#[test]
fn shallow_destination_is_rejected() {
    let cluster = cluster();
    let mut request = create_request("is-100", None);
    request.destination = "backups/3c1a9f02-disk0".to_owned();

    let response = engine(&cluster).ds_create(request);
    assert_eq!(response.rc, 4);
    assert_eq!(response.msg.as_deref(), Some("Invalid destination dataset"));
}

#[test]
fn missing_backup_parent_is_a_dataset_error() {
    let cluster = cluster();
    let mut request = create_request("is-100", None);
    request.destination = "backups/other/3c1a9f02-disk0".to_owned();

    let response = engine(&cluster).ds_create(request);
    assert_eq!(response.rc, 4);
    assert_eq!(
        response.msg.as_deref(),
        Some("Invalid dataset (cannot open 'backups/other': dataset does not exist)")
    );
}

#[test]
fn unreachable_host_fails_before_any_snapshot() {
    let cluster = cluster();
    cluster.set_reachable("node01", false);

    let response = engine(&cluster).ds_create(create_request("is-100", None));
    assert_eq!(response.rc, 3);
    assert!(response
        .msg
        .as_deref()
        .unwrap()
        .starts_with("Remote host is unreachable"));
    assert!(!cluster.calls().iter().any(|c| c.contains("create_snapshot")));
}

#[test]
fn failed_transfer_drops_snapshot_and_metadata() {
    let cluster = cluster();
    let dir = tempfile::tempdir().unwrap();
    let metadata = dir.path().join("daily.json");
    cluster.fail_on("backup_dataset", DESTINATION);

    let response = engine(&cluster).ds_create(create_request("is-100", Some(&metadata)));
    assert_eq!(response.rc, 1);
    assert_eq!(response.get("metadata_file"), Some(&Value::Null));
    assert!(!metadata.exists());
    cluster.node("node01", |n| assert!(n.snapshot_names(SOURCE).is_empty()));
}

#[test]
fn delete_keeps_dataset_until_last_snapshot() {
    let cluster = cluster();
    let dir = tempfile::tempdir().unwrap();
    let metadata = dir.path().join("daily.json");
    assert_ok(&engine(&cluster).ds_create(create_request("is-100", Some(&metadata))));
    assert_ok(&engine(&cluster).ds_create(create_request("is-200", None)));

    let response = engine(&cluster).ds_delete(DsDelete {
        snapshots: vec![format!("{DESTINATION}@is-100")],
        metadata: Some(metadata.clone()),
        last_snapshots: Vec::new(),
    });
    assert_ok(&response);
    assert_eq!(
        response.get("deleted_snapshots"),
        Some(&json!([format!("{DESTINATION}@is-100")]))
    );
    assert_eq!(
        response.get("update_snapshots"),
        Some(&json!([{"name": format!("{DESTINATION}@is-200"), "written": 2}]))
    );
    assert_eq!(
        response.get("deleted_metadata_file"),
        Some(&json!(metadata.display().to_string()))
    );
    assert!(!metadata.exists());

    let response = engine(&cluster).ds_delete(DsDelete {
        snapshots: vec![format!("{DESTINATION}@is-200")],
        last_snapshots: vec![format!("{SOURCE}@is-200")],
        ..DsDelete::default()
    });
    assert_ok(&response);
    assert_eq!(response.get("update_snapshots"), Some(&json!([])));
    assert_eq!(response.get("deleted_last_snapshot_names"), Some(&json!(["is-200"])));
    assert_eq!(response.get("deleted_metadata_file"), Some(&Value::Null));

    cluster.node("backup01", |n| assert!(n.dataset(DESTINATION).is_none()));
    cluster.node("node01", |n| assert!(n.snapshot_names(SOURCE).is_empty()));
}

#[test]
fn restore_replaces_the_dataset() {
    let cluster = cluster();
    cluster.node("node01", |n| {
        n.add_dataset(&format!("{SOURCE}/data"), "child");
    });
    assert_ok(&engine(&cluster).ds_create(create_request("is-100", None)));
    cluster.node("node01", |n| n.write(SOURCE, "corrupted"));

    let response = engine(&cluster).ds_restore(DsRestore {
        snapshot: format!("{DESTINATION}@is-100"),
        destination: SOURCE.to_owned(),
    });
    assert_ok(&response);

    cluster.node("node01", |n| {
        assert_eq!(n.dataset(SOURCE).unwrap().data, "v1");
        assert!(n.snapshot_names(SOURCE).is_empty());
        // children move back under the restored dataset
        assert_eq!(n.dataset(&format!("{SOURCE}/data")).unwrap().data, "child");
        assert!(!n.datasets.keys().any(|k| k.contains("-esbackup-")));
    });
}

#[test]
fn failed_restore_puts_the_original_back() {
    let cluster = cluster();
    assert_ok(&engine(&cluster).ds_create(create_request("is-100", None)));
    cluster.node("node01", |n| n.write(SOURCE, "current"));
    cluster.fail_on("restore_dataset", SOURCE);

    let response = engine(&cluster).ds_restore(DsRestore {
        snapshot: format!("{DESTINATION}@is-100"),
        destination: SOURCE.to_owned(),
    });
    assert_eq!(response.rc, 1);

    cluster.node("node01", |n| {
        assert_eq!(n.dataset(SOURCE).unwrap().data, "current");
        assert_eq!(n.snapshot_names(SOURCE), vec!["is-100"]);
        assert!(!n.datasets.keys().any(|k| k.contains("-esbackup-")));
    });
}

#[test]
fn restore_of_unknown_snapshot_is_rejected() {
    let cluster = cluster();
    let response = engine(&cluster).ds_restore(DsRestore {
        snapshot: format!("{DESTINATION}@is-404"),
        destination: SOURCE.to_owned(),
    });
    assert_eq!(response.rc, 4);
    cluster.node("node01", |n| assert_eq!(n.dataset(SOURCE).unwrap().data, "v1"));
}

fn file_request(dir: &Path) -> FileCreate {
    FileCreate {
        source: SOURCE.to_owned(),
        filename: dir.join("web01/disk0/is-100.zfs"),
        metadata: Some(dir.join("web01/disk0/is-100.json")),
        json: Some(json!({"vm": "web01"})),
        fsfreeze: None,
    }
}

#[test]
fn file_backup_round_trip() {
    let cluster = cluster();
    let dir = tempfile::tempdir().unwrap();
    let request = file_request(dir.path());
    let filename = request.filename.clone();

    let response = engine(&cluster).file_create(request);
    assert_ok(&response);
    let checksum = file_checksum(&filename).unwrap();
    assert_eq!(response.get("checksum"), Some(&json!(checksum)));
    assert_eq!(
        response.get("size"),
        Some(&json!(std::fs::metadata(&filename).unwrap().len()))
    );
    assert_eq!(response.get("file"), Some(&json!(filename.display().to_string())));

    cluster.node("node01", |n| n.write(SOURCE, "overwritten"));
    let response = engine(&cluster).file_restore(FileRestore {
        destination: SOURCE.to_owned(),
        filename,
        checksum,
    });
    assert_ok(&response);
    cluster.node("node01", |n| {
        assert_eq!(n.dataset(SOURCE).unwrap().data, "v1");
        assert!(n.snapshot_names(SOURCE).is_empty());
    });
}

#[test]
fn file_backup_needs_the_backup_directory() {
    let cluster = cluster();
    let dir = tempfile::tempdir().unwrap();
    let mut request = file_request(dir.path());
    request.filename = dir.path().join("missing/web01/disk0/is-100.zfs");

    let response = engine(&cluster).file_create(request);
    assert_eq!(response.rc, 5);
    assert_eq!(response.msg.as_deref(), Some("Backup directory is not available"));
}

#[test]
fn failed_file_backup_leaves_nothing_behind() {
    let cluster = cluster();
    let dir = tempfile::tempdir().unwrap();
    let request = file_request(dir.path());
    let (filename, metadata) = (request.filename.clone(), request.metadata.clone().unwrap());
    cluster.fail_on("backup_to_file", SOURCE);

    let response = engine(&cluster).file_create(request);
    assert_eq!(response.rc, 1);
    assert!(!filename.exists());
    assert!(!metadata.exists());
}

#[test]
fn checksum_mismatch_leaves_dataset_alone() {
    let cluster = cluster();
    let dir = tempfile::tempdir().unwrap();
    let request = file_request(dir.path());
    let filename = request.filename.clone();
    assert_ok(&engine(&cluster).file_create(request));
    cluster.node("node01", |n| n.write(SOURCE, "current"));
    cluster.clear_calls();

    let response = engine(&cluster).file_restore(FileRestore {
        destination: SOURCE.to_owned(),
        filename,
        checksum: "0000000000000000000000000000000000000000".to_owned(),
    });
    assert_eq!(response.rc, 5);
    assert_eq!(response.msg.as_deref(), Some("Checksum mismatch"));
    cluster.node("node01", |n| assert_eq!(n.dataset(SOURCE).unwrap().data, "current"));
    assert!(!cluster.calls().iter().any(|c| c.contains("rename_dataset")));
}

#[test]
fn missing_backup_file_is_reported() {
    let cluster = cluster();
    let dir = tempfile::tempdir().unwrap();
    let filename = dir.path().join("gone.zfs");

    let response = engine(&cluster).file_restore(FileRestore {
        destination: SOURCE.to_owned(),
        filename: filename.clone(),
        checksum: String::new(),
    });
    assert_eq!(response.rc, 5);
    assert_eq!(
        response.msg,
        Some(format!("File \"{}\" is not available", filename.display()))
    );
}

#[test]
fn file_delete_reports_what_was_removed() {
    let cluster = cluster();
    let dir = tempfile::tempdir().unwrap();
    let kept = dir.path().join("a.zfs");
    let metadata = dir.path().join("a.json");
    std::fs::write(&kept, "x").unwrap();
    std::fs::write(&metadata, "{}").unwrap();

    let response = engine(&cluster).file_delete(FileDelete {
        filenames: vec![kept.clone()],
        metadata: Some(metadata.clone()),
    });
    assert_ok(&response);
    assert_eq!(
        response.get("deleted_files"),
        Some(&json!([kept.display().to_string()]))
    );
    assert_eq!(
        response.get("deleted_metadata_file"),
        Some(&json!(metadata.display().to_string()))
    );

    // a missing file stops the deletion; the response lists what is gone
    let first = dir.path().join("b.zfs");
    std::fs::write(&first, "x").unwrap();
    let response = engine(&cluster).file_delete(FileDelete {
        filenames: vec![first.clone(), dir.path().join("nope.zfs")],
        metadata: None,
    });
    assert_eq!(response.rc, 99);
    assert_eq!(
        response.get("deleted_files"),
        Some(&json!([first.display().to_string()]))
    );
    assert!(!first.exists());
}
