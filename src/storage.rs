//! Crash-safe JSON persistence primitives.
//!
//! Every primitive reports failure as `false` / an empty value and logs the
//! cause; none of them return errors or panic. Callers decide whether a
//! failed write is fatal.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Atomically write `data` as pretty JSON to `path` (temp file + rename).
///
/// Readers never observe a partially written file: either the previous
/// content or the complete new content is visible.
pub fn save_json<T: Serialize + ?Sized>(data: &T, path: &Path) -> bool {
    let mut buf = match serde_json::to_string_pretty(data) {
        Ok(s) => s,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to serialize JSON");
            return false;
        }
    };
    buf.push('\n');

    let Some(tmp_path) = write_temp(path, &buf) else {
        return false;
    };
    commit_temp(&tmp_path, path)
}

/// Load a JSON object from `path`.
///
/// Returns an empty map when the file is missing, unreadable, corrupt, or not
/// a JSON object.
pub fn load_json(path: &Path) -> Map<String, Value> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "JSON file not readable");
            return Map::new();
        }
    };
    match serde_json::from_str::<Value>(&contents) {
        Ok(Value::Object(map)) => map,
        Ok(_) => {
            warn!(path = %path.display(), "JSON file does not contain an object");
            Map::new()
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt JSON file");
            Map::new()
        }
    }
}

/// Load and decode a typed JSON document, `None` on any failure.
pub fn load_typed<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let map = load_json(path);
    if map.is_empty() {
        return None;
    }
    match serde_json::from_value(Value::Object(map)) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "JSON file has unexpected shape");
            None
        }
    }
}

/// Append `record` as a single JSON line to `path`, creating parents as needed.
pub fn append_json_line<T: Serialize + ?Sized>(record: &T, path: &Path) -> bool {
    let mut line = match serde_json::to_string(record) {
        Ok(s) => s,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to serialize JSON line");
            return false;
        }
    };
    line.push('\n');

    if !ensure_parent(path) {
        return false;
    }
    let result = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| f.write_all(line.as_bytes()));
    match result {
        Ok(()) => true,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to append JSON line");
            false
        }
    }
}

/// Read every decodable JSON line from `path`. Malformed lines are skipped.
pub fn read_json_lines<T: DeserializeOwned>(path: &Path) -> Vec<T> {
    let Ok(contents) = fs::read_to_string(path) else {
        return Vec::new();
    };
    contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| match serde_json::from_str(l) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping malformed JSON line");
                None
            }
        })
        .collect()
}

fn ensure_parent(path: &Path) -> bool {
    let Some(parent) = path.parent() else {
        return true;
    };
    if parent.as_os_str().is_empty() {
        return true;
    }
    match fs::create_dir_all(parent) {
        Ok(()) => true,
        Err(e) => {
            warn!(path = %parent.display(), error = %e, "failed to create directory");
            false
        }
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "data".to_string());
    path.with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4().simple()))
}

/// First half of an atomic write: the sibling temp file, fully flushed.
fn write_temp(path: &Path, contents: &str) -> Option<PathBuf> {
    if !ensure_parent(path) {
        return None;
    }
    let tmp_path = temp_path_for(path);
    let result = fs::File::create(&tmp_path).and_then(|mut f| {
        f.write_all(contents.as_bytes())?;
        f.sync_all()
    });
    match result {
        Ok(()) => Some(tmp_path),
        Err(e) => {
            warn!(path = %tmp_path.display(), error = %e, "failed to write temp file");
            let _ = fs::remove_file(&tmp_path);
            None
        }
    }
}

/// Second half of an atomic write: rename the temp file over the target.
fn commit_temp(tmp_path: &Path, path: &Path) -> bool {
    match fs::rename(tmp_path, path) {
        Ok(()) => true,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to replace file");
            let _ = fs::remove_file(tmp_path);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn save_then_load_round_trips_objects() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        assert!(save_json(&json!({"a": 1, "b": "two"}), &path));

        let loaded = load_json(&path);
        assert_eq!(loaded.get("a"), Some(&json!(1)));
        assert_eq!(loaded.get("b"), Some(&json!("two")));
    }

    #[test]
    fn load_missing_file_returns_empty_map() {
        let dir = tempdir().unwrap();
        assert!(load_json(&dir.path().join("missing.json")).is_empty());
    }

    #[test]
    fn load_corrupt_file_returns_empty_map() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{\"a\": 1,").unwrap();
        assert!(load_json(&path).is_empty());
    }

    #[test]
    fn load_non_object_returns_empty_map() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("array.json");
        fs::write(&path, "[1, 2, 3]").unwrap();
        assert!(load_json(&path).is_empty());
    }

    #[test]
    fn interrupted_write_leaves_original_intact() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.json");
        assert!(save_json(&json!({"version": "old"}), &path));

        // Crash after the temp file is written but before the rename.
        let tmp = write_temp(&path, "{\"version\": \"new\", \"trunc").unwrap();
        assert!(tmp.exists());

        let loaded = load_json(&path);
        assert_eq!(loaded.get("version"), Some(&json!("old")));

        // A later complete save replaces the content in full.
        assert!(save_json(&json!({"version": "new"}), &path));
        assert_eq!(load_json(&path).get("version"), Some(&json!("new")));
    }

    #[test]
    fn save_leaves_no_temp_files_behind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("clean.json");
        assert!(save_json(&json!({"k": true}), &path));
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn save_into_unwritable_location_returns_false() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "not a dir").unwrap();
        // Parent is a regular file, so the directory cannot be created.
        assert!(!save_json(&json!({}), &blocker.join("child.json")));
    }

    #[test]
    fn append_and_read_json_lines() {
        #[derive(Debug, Serialize, Deserialize, PartialEq)]
        struct Line {
            n: u32,
        }

        let dir = tempdir().unwrap();
        let path = dir.path().join("logs").join("lines.jsonl");
        assert!(append_json_line(&Line { n: 1 }, &path));
        assert!(append_json_line(&Line { n: 2 }, &path));

        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"garbage\n").unwrap();

        let lines: Vec<Line> = read_json_lines(&path);
        assert_eq!(lines, vec![Line { n: 1 }, Line { n: 2 }]);
    }

    #[test]
    fn load_typed_decodes_or_returns_none() {
        #[derive(Debug, Deserialize)]
        struct Doc {
            name: String,
        }

        let dir = tempdir().unwrap();
        let good = dir.path().join("good.json");
        let bad = dir.path().join("bad.json");
        save_json(&json!({"name": "x"}), &good);
        save_json(&json!({"other": 1}), &bad);

        assert_eq!(load_typed::<Doc>(&good).unwrap().name, "x");
        assert!(load_typed::<Doc>(&bad).is_none());
    }
}
