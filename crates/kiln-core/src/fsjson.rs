//! Small JSON-file helpers shared by the settings and chat stores.

use std::fs;
use std::io;
use std::path::Path;

use serde_json::Value;

/// Load a JSON file, returning `default` when the file is missing.
///
/// A present-but-malformed file is an error; callers decide whether that
/// fails closed (overrides) or aborts (defaults).
pub(crate) fn load_json_file(path: &Path, default: Value) -> io::Result<Value> {
    match fs::read_to_string(path) {
        Ok(text) => serde_json::from_str(&text)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(default),
        Err(e) => Err(e),
    }
}

/// Atomically replace `path` with the pretty-printed JSON of `value`.
///
/// Writes to a sibling temp file first and renames over the target, so a
/// crashed writer never leaves a truncated file behind.
pub(crate) fn atomic_write_json(path: &Path, value: &Value) -> io::Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, text)?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let v = load_json_file(&dir.path().join("nope.json"), json!({})).unwrap();
        assert_eq!(v, json!({}));
    }

    #[test]
    fn atomic_write_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("x.json");
        atomic_write_json(&path, &json!({"a": 1})).unwrap();
        let v = load_json_file(&path, json!({})).unwrap();
        assert_eq!(v["a"], 1);
        // No temp residue.
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load_json_file(&path, json!({})).is_err());
    }
}
