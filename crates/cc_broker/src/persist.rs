//! Durable-write helpers.
//!
//! Every store in the broker persists by serializing the full in-memory
//! state and atomically replacing the target file (write to a sibling temp
//! path, then rename). A crash mid-write leaves the previous file intact.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let data = serde_json::to_vec_pretty(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Best-effort load: a missing file yields `None`; a corrupt file is logged
/// and treated as missing (in-memory state is authoritative).
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    if !path.exists() {
        return None;
    }
    match std::fs::read_to_string(path) {
        Ok(data) => match serde_json::from_str(&data) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to parse state file");
                None
            }
        },
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read state file");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn roundtrip_and_replace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut first = HashMap::new();
        first.insert("a".to_string(), 1u32);
        write_json_atomic(&path, &first).unwrap();
        assert_eq!(load_json::<HashMap<String, u32>>(&path).unwrap(), first);

        let mut second = HashMap::new();
        second.insert("b".to_string(), 2u32);
        write_json_atomic(&path, &second).unwrap();
        assert_eq!(load_json::<HashMap<String, u32>>(&path).unwrap(), second);
    }

    #[test]
    fn corrupt_file_is_treated_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load_json::<HashMap<String, u32>>(&path).is_none());
    }
}
