//! Session registry
//!
//! Maps a stable hash of a program's workflow files to the session that last
//! ran them, so a bare `--resume` can find "the previous run of this program".
//! Stored as `.sessions.json` next to the per-session checkpoint directories.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::error::{SessionError, SessionResult, StorageError};
use super::storage::Storage;

/// File name of the registry inside the checkpoints directory
pub const SESSIONS_FILE: &str = ".sessions.json";

/// Hash of the resolved, sorted, absolute workflow paths (16 hex chars)
pub fn workflow_set_hash(paths: &[PathBuf]) -> SessionResult<String> {
    let mut resolved = paths
        .iter()
        .map(|path| {
            path.canonicalize().map_err(|source| SessionError::Resolve {
                path: path.clone(),
                source,
            })
        })
        .collect::<SessionResult<Vec<_>>>()?;
    resolved.sort();

    let joined = resolved
        .iter()
        .map(|path| path.to_string_lossy())
        .collect::<Vec<_>>()
        .join("\n");
    let hash = blake3::hash(joined.as_bytes()).to_hex();
    Ok(hash.as_str()[..16].to_string())
}

/// Workflow-set hash → most recent session id
pub struct SessionRegistry {
    storage: Storage,
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl SessionRegistry {
    /// Open the registry under `checkpoints_dir`; a missing file is empty
    pub fn open(checkpoints_dir: &Path) -> SessionResult<Self> {
        let storage = Storage::new(checkpoints_dir.to_path_buf());
        let path = checkpoints_dir.join(SESSIONS_FILE);
        let entries = match storage.read_file(&path) {
            Ok(data) => serde_json::from_slice(&data).map_err(StorageError::from)?,
            Err(StorageError::PathNotFound(_)) => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            storage,
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Most recent session for a workflow-set hash
    pub fn lookup(&self, workflow_hash: &str) -> Option<String> {
        self.entries.lock().get(workflow_hash).cloned()
    }

    /// Remember `session_id` as the latest run of `workflow_hash`
    pub fn record(&self, workflow_hash: &str, session_id: &str) -> SessionResult<()> {
        let mut entries = self.entries.lock();
        entries.insert(workflow_hash.to_string(), session_id.to_string());
        self.storage.create_dir_all(self.storage.root())?;
        let json = serde_json::to_vec_pretty(&*entries).map_err(StorageError::from)?;
        self.storage.write_atomic(&self.path, &json)?;
        tracing::debug!(hash = workflow_hash, session = session_id, "session recorded");
        Ok(())
    }

    /// All entries
    pub fn entries(&self) -> BTreeMap<String, String> {
        self.entries.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_hash_ignores_path_order() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a.md");
        let b = temp.path().join("b.md");
        fs::write(&a, "# A\n").unwrap();
        fs::write(&b, "# B\n").unwrap();

        let forward = workflow_set_hash(&[a.clone(), b.clone()]).unwrap();
        let backward = workflow_set_hash(&[b.clone(), a.clone()]).unwrap();
        assert_eq!(forward, backward);
        assert_eq!(forward.len(), 16);
        assert_ne!(forward, workflow_set_hash(&[a]).unwrap());

        let missing = workflow_set_hash(&[temp.path().join("missing.md")]).unwrap_err();
        assert!(matches!(missing, SessionError::Resolve { .. }));
    }

    #[test]
    fn test_registry_persists_latest_session() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("checkpoints");

        let registry = SessionRegistry::open(&dir).unwrap();
        assert_eq!(registry.lookup("0123456789abcdef"), None);
        registry.record("0123456789abcdef", "first").unwrap();
        registry.record("0123456789abcdef", "second").unwrap();

        let reopened = SessionRegistry::open(&dir).unwrap();
        assert_eq!(reopened.lookup("0123456789abcdef").as_deref(), Some("second"));
        assert!(dir.join(SESSIONS_FILE).exists());
    }
}
