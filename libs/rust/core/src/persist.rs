//! JSON artifact storage. Writes go through a temp file in the target directory
//! and are renamed into place, so a crash never leaves a half-written artifact.

use serde::{de::DeserializeOwned, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{MedFedError, Result};

pub fn save_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let tmp = NamedTempFile::new_in(parent)?;
    {
        let mut writer = BufWriter::new(tmp.as_file());
        serde_json::to_writer_pretty(&mut writer, value)?;
        writer.flush()?;
    }
    tmp.persist(path).map_err(|e| MedFedError::Persistence { path: path.display().to_string(), reason: e.to_string() })?;
    debug!(path=%path.display(), "artifact_saved");
    Ok(())
}

/// Loads an artifact. `Ok(None)` when the file does not exist.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() { return Ok(None); }
    let text = fs::read_to_string(path)?;
    let value = serde_json::from_str(&text)
        .map_err(|e| MedFedError::Persistence { path: path.display().to_string(), reason: e.to_string() })?;
    Ok(Some(value))
}

/// Loads an artifact, returning the default when it is absent or unreadable.
pub fn load_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    match load_json(path) {
        Ok(Some(v)) => v,
        Ok(None) => T::default(),
        Err(e) => {
            warn!(path=%path.display(), error=%e, "artifact_unreadable_starting_empty");
            T::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("w.json");
        let mut m = BTreeMap::new();
        m.insert("tfidf".to_string(), 0.5f64);
        save_json(&path, &m).unwrap();
        let back: BTreeMap<String, f64> = load_json(&path).unwrap().unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn corrupt_file_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{not json").unwrap();
        let v: Vec<u32> = load_or_default(&path);
        assert!(v.is_empty());
        assert!(load_json::<Vec<u32>>(&path).is_err());
    }
}
