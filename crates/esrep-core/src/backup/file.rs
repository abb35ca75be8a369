use super::{absolute, metadata, path_value, tolerate, Backup, FileCreate, FileDelete, FileRestore};
use crate::action::{into_fields, perform, Action, Fields};
use crate::{CoreError, Response};
use serde_json::json;
use sha1::{Digest, Sha1};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const CHECKSUM_BLOCK: usize = 64 * 1024;

/// Hex SHA-1 of a file's content.
pub fn file_checksum(path: &Path) -> Result<String, CoreError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; CHECKSUM_BLOCK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

impl Backup {
    /// Stream a dataset or snapshot from the VM host into a backup file.
    pub fn file_create(&mut self, request: FileCreate) -> Response {
        perform(
            self,
            "file_create",
            None,
            Action::plain(move |b: &mut Self| b.run_file_create(&request)),
        )
    }

    fn run_file_create(&mut self, request: &FileCreate) -> Result<Fields, CoreError> {
        let filename = absolute(&request.filename)?;
        // <backup dir>/<vm>/<disk>/<file>
        let backup_dir = filename.ancestors().nth(3).unwrap_or(Path::new("/"));
        if !backup_dir.is_dir() {
            return Err(CoreError::FileCheck(
                "Backup directory is not available".to_owned(),
            ));
        }
        self.check_host()?;
        if let Some(dir) = filename.parent() {
            metadata::create_backup_dir(dir)?;
        }

        if let (Some(path), Some(data)) = (&request.metadata, &request.json) {
            self.store_metadata(path, data)?;
        }

        let written = self
            .drivers
            .transfer
            .backup_to_file(
                &request.source,
                &filename,
                self.compression.as_deref(),
                self.limit.as_deref(),
                request.fsfreeze.as_deref(),
            )
            .map_err(CoreError::from)
            .and_then(|()| {
                let size = std::fs::metadata(&filename)?.len();
                Ok((size, file_checksum(&filename)?))
            });

        let (size, checksum) = match written {
            Ok(written) => written,
            Err(e) => {
                warn!("backup of {} into {} failed: {e}", request.source, filename.display());
                metadata::remove_silent(&filename);
                if let Some(path) = self.metadata_file.take() {
                    metadata::remove_silent(&path);
                }
                return Err(e);
            }
        };
        info!("backed up {} into {}", request.source, filename.display());

        Ok(into_fields(json!({
            "file": filename.display().to_string(),
            "size": size,
            "checksum": checksum,
            "metadata_file": path_value(self.metadata_file.as_deref()),
        })))
    }

    pub fn file_delete(&mut self, request: FileDelete) -> Response {
        perform(
            self,
            "file_delete",
            None,
            Action::compensated(
                move |b: &mut Self| b.run_file_delete(&request),
                Self::file_delete_cleanup,
            ),
        )
    }

    fn run_file_delete(&mut self, request: &FileDelete) -> Result<Fields, CoreError> {
        self.deleted_files.clear();
        for filename in &request.filenames {
            let filename = absolute(filename)?;
            std::fs::remove_file(&filename)?;
            self.deleted_files.push(filename);
        }

        if let Some(path) = &request.metadata {
            self.remove_metadata(path);
        }

        Ok(into_fields(json!({
            "deleted_files": self.deleted_file_names(),
            "deleted_metadata_file": path_value(self.deleted_metadata.as_deref()),
        })))
    }

    fn file_delete_cleanup(&mut self, fields: &mut Fields) -> Result<(), CoreError> {
        fields.insert("deleted_files".to_owned(), json!(self.deleted_file_names()));
        fields.insert(
            "deleted_metadata_file".to_owned(),
            path_value(self.deleted_metadata.as_deref()),
        );
        Ok(())
    }

    fn deleted_file_names(&self) -> Vec<String> {
        self.deleted_files
            .iter()
            .map(|f| f.display().to_string())
            .collect()
    }

    /// Restore a backup file over a dataset on the VM host after verifying
    /// its checksum.
    pub fn file_restore(&mut self, request: FileRestore) -> Response {
        perform(
            self,
            "file_restore",
            None,
            Action::plain(move |b: &mut Self| b.run_file_restore(&request)),
        )
    }

    fn run_file_restore(&mut self, request: &FileRestore) -> Result<Fields, CoreError> {
        let filename: &PathBuf = &request.filename;
        let destination = request.destination.as_str();
        if !filename.is_file() {
            return Err(CoreError::FileCheck(format!(
                "File \"{}\" is not available",
                filename.display()
            )));
        }
        self.check_host()?;

        if file_checksum(filename)? != request.checksum {
            return Err(CoreError::FileCheck("Checksum mismatch".to_owned()));
        }

        let archive = self.archive_and_create_empty(destination)?;
        let outcome = self.restore_into(&archive, destination, |drivers| {
            drivers.transfer.restore_file(filename, destination)
        });
        self.settle_restore(outcome, &archive, destination)?;

        let removed = self.drivers.remote.destroy_all_snapshots(destination);
        tolerate(removed, "removing received snapshots")?;
        info!("restored {} into {destination}", filename.display());
        Ok(Fields::new())
    }
}
