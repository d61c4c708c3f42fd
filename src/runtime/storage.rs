//! Filesystem layout helpers, atomic writes, and checkpoint blob stores
//!
//! Manages the .encore/ directory structure, ensures atomic writes via
//! temp files and renames, and provides the [`CheckpointStore`] seam with a
//! filesystem and an in-memory implementation.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use super::RuntimeConfig;
use super::checkpoint::CheckpointId;
use super::error::{StorageError, StorageResult};

/// Storage manager for runtime persistence
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Create a new storage manager
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Get the root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the config file path
    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Write data atomically to a file
    ///
    /// Creates a temporary file, writes the data, syncs, then renames
    pub fn write_atomic(&self, path: &Path, data: &[u8]) -> StorageResult<()> {
        let temp_path = path.with_extension("tmp");
        let failed = |detail: String| StorageError::AtomicWriteFailed {
            path: path.to_path_buf(),
            detail,
        };

        let mut file = File::create(&temp_path)
            .map_err(|e| failed(format!("create {:?}: {}", temp_path, e)))?;
        file.write_all(data)
            .map_err(|e| failed(format!("write: {}", e)))?;
        file.sync_all()
            .map_err(|e| failed(format!("sync: {}", e)))?;
        drop(file);

        fs::rename(&temp_path, path)
            .map_err(|e| failed(format!("rename from {:?}: {}", temp_path, e)))?;

        // Make the rename itself durable
        if let Some(parent) = path.parent() {
            let dir = OpenOptions::new().read(true).open(parent)?;
            dir.sync_all()?;
        }

        Ok(())
    }

    /// Read a file
    pub fn read_file(&self, path: &Path) -> StorageResult<Vec<u8>> {
        fs::read(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => StorageError::PathNotFound(path.to_path_buf()),
            _ => StorageError::Io(e),
        })
    }

    /// Create a directory and all parent directories
    pub fn create_dir_all(&self, path: &Path) -> StorageResult<()> {
        fs::create_dir_all(path)?;
        Ok(())
    }

    /// List entries in a directory; a missing directory is empty
    pub fn list_dir(&self, path: &Path) -> StorageResult<Vec<PathBuf>> {
        let read = match fs::read_dir(path) {
            Ok(read) => read,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for entry in read {
            entries.push(entry?.path());
        }
        Ok(entries)
    }
}

/// Initialize storage directories for a new runtime
pub fn init_storage(root: &Path) -> StorageResult<()> {
    let storage = Storage::new(root.to_path_buf());
    storage.create_dir_all(root)?;
    storage.create_dir_all(&root.join("checkpoints"))?;
    Ok(())
}

/// Write runtime configuration
pub fn write_config(config: &RuntimeConfig) -> StorageResult<()> {
    let storage = Storage::new(config.root.clone());
    let json = serde_json::to_vec_pretty(config)?;
    storage.write_atomic(&storage.config_path(), &json)
}

/// Load runtime configuration
pub fn load_config(root: &Path) -> StorageResult<RuntimeConfig> {
    let storage = Storage::new(root.to_path_buf());
    let data = storage.read_file(&storage.config_path())?;
    serde_json::from_slice(&data).map_err(|e| StorageError::ConfigError(e.to_string()))
}

/// Whether an execution id can be used verbatim as a directory name.
pub fn is_safe_execution_id(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Durable blob storage keyed by checkpoint id.
///
/// Listing is always ordered by the numeric counter, never by name.
pub trait CheckpointStore: Send + Sync {
    /// Store a blob, replacing any previous blob with the same id
    fn put(&self, id: &CheckpointId, blob: &[u8]) -> StorageResult<()>;

    /// Fetch a blob
    fn get(&self, id: &CheckpointId) -> StorageResult<Option<Vec<u8>>>;

    /// All checkpoint ids of an execution, oldest first
    fn list(&self, execution_id: &str) -> StorageResult<Vec<CheckpointId>>;

    /// Delete a blob; returns whether it existed
    fn delete(&self, id: &CheckpointId) -> StorageResult<bool>;

    /// Id with the highest counter
    fn latest(&self, execution_id: &str) -> StorageResult<Option<CheckpointId>> {
        Ok(self.list(execution_id)?.pop())
    }

    /// Delete all but the `keep_last` newest checkpoints; returns how many went
    fn prune(&self, execution_id: &str, keep_last: usize) -> StorageResult<usize> {
        let ids = self.list(execution_id)?;
        if ids.len() <= keep_last {
            return Ok(0);
        }
        let excess = ids.len() - keep_last;
        let mut removed = 0;
        for id in &ids[..excess] {
            if self.delete(id)? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Filesystem store: `{base}/{execution_id}/{execution_id}_ckpt_{counter}.blob`
#[derive(Debug, Clone)]
pub struct FilesystemCheckpointStore {
    storage: Storage,
    max_bytes: usize,
}

impl FilesystemCheckpointStore {
    /// Create a store rooted at `base`
    pub fn new(base: impl Into<PathBuf>, max_bytes: usize) -> Self {
        Self {
            storage: Storage::new(base.into()),
            max_bytes,
        }
    }

    /// Base directory
    pub fn base(&self) -> &Path {
        self.storage.root()
    }

    fn execution_dir(&self, execution_id: &str) -> StorageResult<PathBuf> {
        if !is_safe_execution_id(execution_id) {
            return Err(StorageError::UnsafeExecutionId(execution_id.to_string()));
        }
        Ok(self.storage.root().join(execution_id))
    }

    fn blob_path(&self, id: &CheckpointId) -> StorageResult<PathBuf> {
        Ok(self
            .execution_dir(id.execution_id())?
            .join(format!("{}.blob", id)))
    }
}

impl CheckpointStore for FilesystemCheckpointStore {
    fn put(&self, id: &CheckpointId, blob: &[u8]) -> StorageResult<()> {
        if blob.len() > self.max_bytes {
            return Err(StorageError::TooLarge {
                id: id.to_string(),
                size: blob.len(),
                limit: self.max_bytes,
            });
        }
        let dir = self.execution_dir(id.execution_id())?;
        self.storage.create_dir_all(&dir)?;
        self.storage.write_atomic(&self.blob_path(id)?, blob)
    }

    fn get(&self, id: &CheckpointId) -> StorageResult<Option<Vec<u8>>> {
        match self.storage.read_file(&self.blob_path(id)?) {
            Ok(data) => Ok(Some(data)),
            Err(StorageError::PathNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn list(&self, execution_id: &str) -> StorageResult<Vec<CheckpointId>> {
        let dir = self.execution_dir(execution_id)?;
        let mut ids: Vec<CheckpointId> = self
            .storage
            .list_dir(&dir)?
            .into_iter()
            .filter_map(|path| {
                let name = path.file_name()?.to_str()?;
                name.strip_suffix(".blob")?.parse::<CheckpointId>().ok()
            })
            .filter(|id| id.execution_id() == execution_id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn delete(&self, id: &CheckpointId) -> StorageResult<bool> {
        match fs::remove_file(self.blob_path(id)?) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory store for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    blobs: RwLock<BTreeMap<String, BTreeMap<u64, Vec<u8>>>>,
    max_bytes: Option<usize>,
}

impl MemoryCheckpointStore {
    /// Create an unbounded store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that rejects blobs above `max_bytes`
    pub fn with_limit(max_bytes: usize) -> Self {
        Self {
            blobs: RwLock::new(BTreeMap::new()),
            max_bytes: Some(max_bytes),
        }
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn put(&self, id: &CheckpointId, blob: &[u8]) -> StorageResult<()> {
        if let Some(limit) = self.max_bytes {
            if blob.len() > limit {
                return Err(StorageError::TooLarge {
                    id: id.to_string(),
                    size: blob.len(),
                    limit,
                });
            }
        }
        self.blobs
            .write()
            .entry(id.execution_id().to_string())
            .or_default()
            .insert(id.counter(), blob.to_vec());
        Ok(())
    }

    fn get(&self, id: &CheckpointId) -> StorageResult<Option<Vec<u8>>> {
        Ok(self
            .blobs
            .read()
            .get(id.execution_id())
            .and_then(|blobs| blobs.get(&id.counter()).cloned()))
    }

    fn list(&self, execution_id: &str) -> StorageResult<Vec<CheckpointId>> {
        Ok(self
            .blobs
            .read()
            .get(execution_id)
            .map(|blobs| {
                blobs
                    .keys()
                    .map(|counter| CheckpointId::new(execution_id, *counter))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn delete(&self, id: &CheckpointId) -> StorageResult<bool> {
        Ok(self
            .blobs
            .write()
            .get_mut(id.execution_id())
            .and_then(|blobs| blobs.remove(&id.counter()))
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_storage() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join(".encore");

        init_storage(&root).unwrap();

        assert!(root.join("checkpoints").exists());
    }

    #[test]
    fn test_write_and_read_config() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();
        init_storage(&root).unwrap();

        let config = RuntimeConfig {
            keep_last: 3,
            shutdown_when_idle: false,
            debug: true,
            ..RuntimeConfig::with_root(root.clone())
        };
        write_config(&config).unwrap();

        assert_eq!(load_config(&root).unwrap(), config);
    }

    #[test]
    fn test_atomic_write() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::new(temp.path().to_path_buf());
        let test_file = temp.path().join("test.dat");

        storage.write_atomic(&test_file, b"first").unwrap();
        storage.write_atomic(&test_file, b"second").unwrap();

        assert_eq!(storage.read_file(&test_file).unwrap(), b"second");
        assert!(!temp.path().join("test.tmp").exists());
    }

    #[test]
    fn filesystem_store_lists_numerically() {
        let temp = TempDir::new().unwrap();
        let store = FilesystemCheckpointStore::new(temp.path(), 1024);

        for counter in [1, 10, 2] {
            store
                .put(&CheckpointId::new("1000", counter), b"{}")
                .unwrap();
        }

        let counters: Vec<u64> = store
            .list("1000")
            .unwrap()
            .iter()
            .map(CheckpointId::counter)
            .collect();
        assert_eq!(counters, vec![1, 2, 10]);
        assert_eq!(
            store.latest("1000").unwrap().unwrap().to_string(),
            "1000_ckpt_10"
        );
        assert!(temp.path().join("1000/1000_ckpt_10.blob").exists());
    }

    #[test]
    fn filesystem_store_enforces_limits() {
        let temp = TempDir::new().unwrap();
        let store = FilesystemCheckpointStore::new(temp.path(), 4);

        let err = store
            .put(&CheckpointId::new("1000", 1), b"too large")
            .unwrap_err();
        assert!(matches!(err, StorageError::TooLarge { size: 9, limit: 4, .. }));

        let err = store.list("../escape").unwrap_err();
        assert!(matches!(err, StorageError::UnsafeExecutionId(_)));

        assert!(store.list("never-written").unwrap().is_empty());
        assert_eq!(store.get(&CheckpointId::new("1000", 7)).unwrap(), None);
    }

    #[test]
    fn prune_keeps_newest() {
        let store = MemoryCheckpointStore::new();
        for counter in 1..=12 {
            store
                .put(&CheckpointId::new("s_program", counter), b"x")
                .unwrap();
        }

        assert_eq!(store.prune("s_program", 3).unwrap(), 9);
        let counters: Vec<u64> = store
            .list("s_program")
            .unwrap()
            .iter()
            .map(CheckpointId::counter)
            .collect();
        assert_eq!(counters, vec![10, 11, 12]);
        assert!(store.delete(&CheckpointId::new("s_program", 12)).unwrap());
        assert!(!store.delete(&CheckpointId::new("s_program", 12)).unwrap());
    }
}
