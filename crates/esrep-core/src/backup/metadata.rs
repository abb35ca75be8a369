//! JSON sidecar files written next to backups.

use crate::CoreError;
use serde_json::Value;
use std::fs::{DirBuilder, Permissions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::debug;

const BACKUP_DIR_MODE: u32 = 0o750;
const METADATA_MODE: u32 = 0o644;

/// Create `dir` and its missing parents with mode 0750.
pub fn create_backup_dir(dir: &Path) -> Result<(), CoreError> {
    if !dir.exists() {
        DirBuilder::new()
            .recursive(true)
            .mode(BACKUP_DIR_MODE)
            .create(dir)?;
    }
    Ok(())
}

/// Write `data` to `path` atomically, creating the parent directories.
pub fn store(path: &Path, data: &Value) -> Result<(), CoreError> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    create_backup_dir(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer(&mut tmp, data)?;
    tmp.flush()?;
    tmp.as_file()
        .set_permissions(Permissions::from_mode(METADATA_MODE))?;
    tmp.persist(path).map_err(|e| CoreError::Io(e.error))?;
    debug!("stored metadata in {}", path.display());
    Ok(())
}

/// Remove `path`, ignoring failures. Returns whether it was removed.
pub fn remove_silent(path: &Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => true,
        Err(e) => {
            debug!("could not remove {}: {e}", path.display());
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn store_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm/disk0/daily.json");

        store(&path, &json!({"hostname": "web01"})).unwrap();

        let written: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written["hostname"], "web01");
        let mode = std::fs::metadata(path.parent().unwrap())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o027, 0);
    }

    #[test]
    fn store_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");
        store(&path, &json!([1])).unwrap();
        store(&path, &json!([2])).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[2]");
    }

    #[test]
    fn remove_silent_reports_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.json");
        assert!(!remove_silent(&path));
        std::fs::write(&path, "{}").unwrap();
        assert!(remove_silent(&path));
        assert!(!path.exists());
    }
}
