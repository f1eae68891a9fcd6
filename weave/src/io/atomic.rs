//! Crash-safe file replacement.

use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use tempfile::NamedTempFile;

/// Replace `path` with `contents` via a synced temp file in the same
/// directory and a rename. Readers see either the old or the new file.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp = NamedTempFile::new_in(parent)
        .with_context(|| format!("create temp file in {}", parent.display()))?;
    tmp.write_all(contents.as_bytes())
        .with_context(|| format!("write temp file for {}", path.display()))?;
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("sync temp file for {}", path.display()))?;
    tmp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

/// Pretty JSON with a trailing newline, written atomically.
pub fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    buf.push('\n');
    write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_existing_file_and_leaves_no_temp() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json");
        fs::write(&path, "old").expect("seed");
        write_atomic(&path, "new").expect("write");
        assert_eq!(fs::read_to_string(&path).expect("read"), "new");
        let entries = fs::read_dir(temp.path()).expect("read dir").count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn creates_missing_parent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested/dir/metrics.json");
        write_json_atomic(&path, &serde_json::json!({"completed": 1})).expect("write");
        let raw = fs::read_to_string(&path).expect("read");
        assert!(raw.ends_with("}\n"));
    }
}
