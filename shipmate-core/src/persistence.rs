//! Atomic state-file helpers for the small JSON sidecar files the kernel
//! keeps next to the database (digest queue, router correction log).
//!
//! Writes go to a `.tmp` sibling and are renamed into place so a crash
//! mid-write never leaves a torn file.

use std::io;
use std::path::Path;

/// Serialize `data` to pretty JSON and atomically replace `path` with it.
/// Parent directories are created as needed.
pub fn save_json<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec_pretty(data).map_err(io::Error::other)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, &json)?;
    std::fs::rename(&tmp, path)
}

/// Load and deserialize JSON from `path`, or the type's default when the
/// file does not exist yet.
pub fn load_json_or_default<T>(path: &Path) -> io::Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    if !path.exists() {
        return Ok(T::default());
    }
    let data = std::fs::read_to_string(path)?;
    serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("queue.json");

        save_json(&path, &vec!["a".to_string(), "b".to_string()]).unwrap();
        let loaded: Vec<String> = load_json_or_default(&path).unwrap();
        assert_eq!(loaded, vec!["a", "b"]);
    }

    #[test]
    fn test_load_missing_returns_default() {
        let loaded: Vec<u32> =
            load_json_or_default(Path::new("/nonexistent/shipmate/queue.json")).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn test_no_tmp_file_left_behind() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.json");
        save_json(&path, &42u32).unwrap();
        assert!(!path.with_extension("tmp").exists());
    }
}
