use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors arising from example-database operations.
///
/// The engine itself only ever *tolerates* these: a database that loses or
/// duplicates entries degrades reuse, it never breaks a run. The variants
/// exist so harness code that owns the store can report persistence problems
/// properly.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// An I/O error while interacting with the underlying storage.
    #[error("database I/O error: {0}")]
    Io(String),

    /// The per-key index could not be written or re-serialized.
    #[error("database index error: {0}")]
    Index(String),
}

impl From<std::io::Error> for DatabaseError {
    fn from(err: std::io::Error) -> Self {
        DatabaseError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for DatabaseError {
    fn from(err: serde_json::Error) -> Self {
        DatabaseError::Index(format!("JSON operation error: {err}"))
    }
}

/// The sub-key under which a run's Pareto front is mirrored.
///
/// Derived from the caller's logical-test key and kept disjoint from every
/// other use of that key.
pub fn pareto_key(key: &[u8]) -> Vec<u8> {
    let mut derived = key.to_vec();
    derived.extend_from_slice(b".pareto");
    derived
}

/// A key → set-of-byte-buffers store shared across runs.
///
/// This is the only resource that outlives a runner invocation. Operations
/// are per-key and individually atomic enough; no multi-key transactionality
/// is assumed, and consumers re-validate everything they fetch rather than
/// trusting it.
pub trait ExampleDatabase {
    /// Adds `value` to the set stored under `key`. Idempotent.
    fn save(&mut self, key: &[u8], value: &[u8]) -> Result<(), DatabaseError>;

    /// Returns a finite snapshot of the set stored under `key`. A missing key
    /// yields an empty snapshot, not an error.
    fn fetch(&self, key: &[u8]) -> Result<Vec<Vec<u8>>, DatabaseError>;

    /// Removes `value` from the set under `key`. Removing a missing value is
    /// a no-op.
    fn delete(&mut self, key: &[u8], value: &[u8]) -> Result<(), DatabaseError>;

    /// Moves `value` from one key's set to another's.
    fn move_value(&mut self, src: &[u8], dst: &[u8], value: &[u8]) -> Result<(), DatabaseError> {
        if src == dst {
            return Ok(());
        }
        self.save(dst, value)?;
        self.delete(src, value)
    }
}

/// An in-memory implementation of [`ExampleDatabase`].
///
/// Offers no persistence across processes; suited to tests and to harnesses
/// that only want example diversity within a single session.
#[derive(Debug, Default)]
pub struct InMemoryDatabase {
    entries: HashMap<Vec<u8>, BTreeSet<Vec<u8>>>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExampleDatabase for InMemoryDatabase {
    fn save(&mut self, key: &[u8], value: &[u8]) -> Result<(), DatabaseError> {
        self.entries.entry(key.to_vec()).or_default().insert(value.to_vec());
        Ok(())
    }

    fn fetch(&self, key: &[u8]) -> Result<Vec<Vec<u8>>, DatabaseError> {
        Ok(self
            .entries
            .get(key)
            .map(|values| values.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn delete(&mut self, key: &[u8], value: &[u8]) -> Result<(), DatabaseError> {
        if let Some(values) = self.entries.get_mut(key) {
            values.remove(value);
            if values.is_empty() {
                self.entries.remove(key);
            }
        }
        Ok(())
    }
}

/// An on-disk implementation of [`ExampleDatabase`] storing each key's set as
/// a directory of content-addressed files.
///
/// Layout: one subdirectory per key (hex MD5 of the key bytes), one file per
/// value (hex MD5 of the value bytes), plus a JSON index mapping filename to
/// value length. The index makes listing cheap and catches truncated blobs;
/// when it is missing or corrupt it is rebuilt from the directory contents
/// rather than failing the caller.
pub struct DirectoryDatabase {
    root: PathBuf,
}

impl DirectoryDatabase {
    const INDEX_FILENAME: &'static str = "index.json";

    /// Creates the root directory if needed and opens the store.
    pub fn new(root: PathBuf) -> Result<Self, DatabaseError> {
        if !root.exists() {
            fs::create_dir_all(&root).map_err(|e| {
                DatabaseError::Io(format!("failed to create database directory {root:?}: {e}"))
            })?;
        } else if !root.is_dir() {
            return Err(DatabaseError::Io(format!(
                "database path {root:?} exists but is not a directory"
            )));
        }
        Ok(Self { root })
    }

    fn key_dir(&self, key: &[u8]) -> PathBuf {
        self.root.join(format!("{:x}", md5::compute(key)))
    }

    fn value_filename(value: &[u8]) -> String {
        format!("{:x}", md5::compute(value))
    }

    fn index_path(dir: &Path) -> PathBuf {
        dir.join(Self::INDEX_FILENAME)
    }

    fn write_index(dir: &Path, index: &HashMap<String, usize>) -> Result<(), DatabaseError> {
        let file = File::create(Self::index_path(dir)).map_err(|e| {
            DatabaseError::Io(format!("failed to create index file in {dir:?}: {e}"))
        })?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, index)?;
        Ok(())
    }

    /// Loads the key's index, rebuilding it from the directory listing when
    /// it is absent or unreadable.
    fn load_index(dir: &Path) -> Result<HashMap<String, usize>, DatabaseError> {
        let index_path = Self::index_path(dir);
        if index_path.is_file() {
            if let Ok(file) = File::open(&index_path) {
                if let Ok(index) = serde_json::from_reader(BufReader::new(file)) {
                    return Ok(index);
                }
            }
            log::warn!("rebuilding corrupt database index at {index_path:?}");
        }
        let mut rebuilt = HashMap::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name == Self::INDEX_FILENAME || name.starts_with('.') {
                continue;
            }
            rebuilt.insert(name.to_string(), entry.metadata()?.len() as usize);
        }
        Ok(rebuilt)
    }
}

impl ExampleDatabase for DirectoryDatabase {
    fn save(&mut self, key: &[u8], value: &[u8]) -> Result<(), DatabaseError> {
        let dir = self.key_dir(key);
        fs::create_dir_all(&dir)
            .map_err(|e| DatabaseError::Io(format!("failed to create key directory {dir:?}: {e}")))?;
        let filename = Self::value_filename(value);
        let path = dir.join(&filename);
        let mut file = File::create(&path)
            .map_err(|e| DatabaseError::Io(format!("failed to create value file {path:?}: {e}")))?;
        file.write_all(value)
            .map_err(|e| DatabaseError::Io(format!("failed to write value file {path:?}: {e}")))?;

        let mut index = Self::load_index(&dir)?;
        index.insert(filename, value.len());
        Self::write_index(&dir, &index)
    }

    fn fetch(&self, key: &[u8]) -> Result<Vec<Vec<u8>>, DatabaseError> {
        let dir = self.key_dir(key);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let index = Self::load_index(&dir)?;
        let mut values = Vec::with_capacity(index.len());
        for (filename, expected_len) in &index {
            // Tolerate entries that vanished or were truncated since the
            // index was written; consumers re-validate anyway.
            let Ok(bytes) = fs::read(dir.join(filename)) else {
                continue;
            };
            if bytes.len() != *expected_len {
                log::warn!("skipping truncated database entry {filename} under {dir:?}");
                continue;
            }
            values.push(bytes);
        }
        values.sort();
        Ok(values)
    }

    fn delete(&mut self, key: &[u8], value: &[u8]) -> Result<(), DatabaseError> {
        let dir = self.key_dir(key);
        if !dir.is_dir() {
            return Ok(());
        }
        let filename = Self::value_filename(value);
        let path = dir.join(&filename);
        if path.is_file() {
            fs::remove_file(&path)
                .map_err(|e| DatabaseError::Io(format!("failed to delete value file {path:?}: {e}")))?;
        }
        let mut index = Self::load_index(&dir)?;
        if index.remove(&filename).is_some() {
            Self::write_index(&dir, &index)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn exercise_roundtrip(db: &mut dyn ExampleDatabase) {
        db.save(b"key", b"alpha").unwrap();
        db.save(b"key", b"beta").unwrap();
        db.save(b"key", b"alpha").unwrap(); // idempotent
        let mut values = db.fetch(b"key").unwrap();
        values.sort();
        assert_eq!(values, vec![b"alpha".to_vec(), b"beta".to_vec()]);

        db.delete(b"key", b"alpha").unwrap();
        assert_eq!(db.fetch(b"key").unwrap(), vec![b"beta".to_vec()]);

        // Deleting something absent is a no-op.
        db.delete(b"key", b"gamma").unwrap();
        db.delete(b"other", b"alpha").unwrap();
        assert_eq!(db.fetch(b"key").unwrap().len(), 1);
    }

    #[test]
    fn in_memory_roundtrip() {
        let mut db = InMemoryDatabase::new();
        exercise_roundtrip(&mut db);
        assert!(db.fetch(b"missing").unwrap().is_empty());
    }

    #[test]
    fn in_memory_move_value() {
        let mut db = InMemoryDatabase::new();
        db.save(b"src", b"v").unwrap();
        db.move_value(b"src", b"dst", b"v").unwrap();
        assert!(db.fetch(b"src").unwrap().is_empty());
        assert_eq!(db.fetch(b"dst").unwrap(), vec![b"v".to_vec()]);
    }

    #[test]
    fn directory_roundtrip() {
        let dir = tempdir().unwrap();
        let mut db = DirectoryDatabase::new(dir.path().to_path_buf()).unwrap();
        exercise_roundtrip(&mut db);
        dir.close().unwrap();
    }

    #[test]
    fn directory_persists_across_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut db = DirectoryDatabase::new(dir.path().to_path_buf()).unwrap();
            db.save(b"key", &[0, 1, 2]).unwrap();
        }
        let db = DirectoryDatabase::new(dir.path().to_path_buf()).unwrap();
        assert_eq!(db.fetch(b"key").unwrap(), vec![vec![0, 1, 2]]);
        dir.close().unwrap();
    }

    #[test]
    fn directory_rejects_file_as_root() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("not_a_dir");
        File::create(&file_path).unwrap();
        let result = DirectoryDatabase::new(file_path);
        assert!(matches!(result, Err(DatabaseError::Io(_))));
        dir.close().unwrap();
    }

    #[test]
    fn directory_rebuilds_corrupt_index() {
        let dir = tempdir().unwrap();
        let mut db = DirectoryDatabase::new(dir.path().to_path_buf()).unwrap();
        db.save(b"key", b"value").unwrap();
        let key_dir = db.key_dir(b"key");
        fs::write(key_dir.join(DirectoryDatabase::INDEX_FILENAME), b"{ not json").unwrap();

        let reopened = DirectoryDatabase::new(dir.path().to_path_buf()).unwrap();
        assert_eq!(reopened.fetch(b"key").unwrap(), vec![b"value".to_vec()]);
        dir.close().unwrap();
    }

    #[test]
    fn keys_are_disjoint() {
        let mut db = InMemoryDatabase::new();
        db.save(b"key", b"primary").unwrap();
        db.save(&pareto_key(b"key"), b"front").unwrap();
        assert_eq!(db.fetch(b"key").unwrap(), vec![b"primary".to_vec()]);
        assert_eq!(db.fetch(&pareto_key(b"key")).unwrap(), vec![b"front".to_vec()]);
    }

    #[test]
    fn pareto_key_is_a_stable_derivation() {
        assert_eq!(pareto_key(b"t"), b"t.pareto".to_vec());
        assert_ne!(pareto_key(b"t"), pareto_key(b"u"));
    }
}
