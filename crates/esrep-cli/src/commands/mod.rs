pub mod backup;
pub mod completions;
pub mod man_pages;
pub mod replication;

use serde_json::Value;
use std::io::Read;
use std::path::Path;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

/// JSON document from a file, or from stdin when the path is `-`.
pub fn read_json_input(path: &Path) -> Result<Value, String> {
    let content = if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .map_err(|e| format!("failed to read JSON from stdin: {e}"))?;
        buf
    } else {
        std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {e}", path.display()))?
    };
    serde_json::from_str(&content).map_err(|e| format!("invalid JSON in {}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm.json");
        std::fs::write(&path, r#"{"uuid": "abc", "disks": []}"#).unwrap();
        let value = read_json_input(&path).unwrap();
        assert_eq!(value["uuid"], "abc");
    }

    #[test]
    fn rejects_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = read_json_input(&path).unwrap_err();
        assert!(err.starts_with("invalid JSON in"), "{err}");
    }

    #[test]
    fn missing_file_is_reported() {
        let err = read_json_input(Path::new("/nonexistent/vm.json")).unwrap_err();
        assert!(err.contains("/nonexistent/vm.json"), "{err}");
    }
}
