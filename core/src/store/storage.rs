//! Persistent flag storage capability.
//!
//! The store process is the only component issuing direct writes; everything
//! else reaches persisted state through it. The `Storage` trait is the
//! injected capability boundary: `FileStorage` backs the daemon with a JSON
//! document on disk, `MemoryStorage` backs tests, and `UnavailableStorage`
//! simulates a broken host storage layer for fallback tests.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------------
// Storage errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum StorageError {
    /// Filesystem I/O error.
    Io(std::io::Error),
    /// The backing document exists but could not be parsed.
    Corrupt { path: PathBuf, detail: String },
    /// The storage layer is not usable at all.
    Unavailable(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Io(e) => write!(f, "storage I/O error: {}", e),
            StorageError::Corrupt { path, detail } => {
                write!(f, "corrupt flag document {}: {}", path.display(), detail)
            }
            StorageError::Unavailable(msg) => write!(f, "storage unavailable: {}", msg),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e)
    }
}

// ---------------------------------------------------------------------------
// Storage trait
// ---------------------------------------------------------------------------

/// Key-value persistence for boolean flags.
pub trait Storage: Send {
    /// Read one key. `Ok(None)` means the key has never been written.
    fn get(&self, key: &str) -> Result<Option<bool>, StorageError>;

    /// Write one key. Each write is a single atomic operation from the
    /// consumer's point of view; concurrent writers serialize as last-write-wins.
    fn set(&mut self, key: &str, value: bool) -> Result<(), StorageError>;

    /// Read the full document.
    fn load_all(&self) -> Result<BTreeMap<String, bool>, StorageError>;
}

// ---------------------------------------------------------------------------
// FileStorage
// ---------------------------------------------------------------------------

/// JSON-document storage: the whole flag map lives in one file, rewritten
/// atomically (tmp + rename) on every set.
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: &Path) -> Self {
        FileStorage {
            path: path.to_path_buf(),
        }
    }

    fn read_document(&self) -> Result<BTreeMap<String, bool>, StorageError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&content).map_err(|e| StorageError::Corrupt {
            path: self.path.clone(),
            detail: e.to_string(),
        })
    }

    fn write_document(&self, doc: &BTreeMap<String, bool>) -> Result<(), StorageError> {
        let json = serde_json::to_string_pretty(doc).map_err(|e| StorageError::Corrupt {
            path: self.path.clone(),
            detail: e.to_string(),
        })?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<bool>, StorageError> {
        Ok(self.read_document()?.get(key).copied())
    }

    fn set(&mut self, key: &str, value: bool) -> Result<(), StorageError> {
        let mut doc = self.read_document()?;
        doc.insert(key.to_string(), value);
        self.write_document(&doc)
    }

    fn load_all(&self) -> Result<BTreeMap<String, bool>, StorageError> {
        self.read_document()
    }
}

// ---------------------------------------------------------------------------
// MemoryStorage
// ---------------------------------------------------------------------------

/// In-memory storage for tests. Clones share the same underlying map, so a
/// test can keep a handle while the store owns another.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Default)]
struct MemoryInner {
    data: BTreeMap<String, bool>,
    write_count: u64,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage::default()
    }

    /// Pre-populate a key, as if a previous run had persisted it.
    pub fn seed(&self, key: &str, value: bool) {
        self.inner.lock().unwrap().data.insert(key.to_string(), value);
    }

    /// Number of writes issued since creation.
    pub fn write_count(&self) -> u64 {
        self.inner.lock().unwrap().write_count
    }

    /// Current persisted value of a key.
    pub fn stored(&self, key: &str) -> Option<bool> {
        self.inner.lock().unwrap().data.get(key).copied()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<bool>, StorageError> {
        Ok(self.inner.lock().unwrap().data.get(key).copied())
    }

    fn set(&mut self, key: &str, value: bool) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        inner.data.insert(key.to_string(), value);
        inner.write_count += 1;
        Ok(())
    }

    fn load_all(&self) -> Result<BTreeMap<String, bool>, StorageError> {
        Ok(self.inner.lock().unwrap().data.clone())
    }
}

// ---------------------------------------------------------------------------
// UnavailableStorage
// ---------------------------------------------------------------------------

/// Storage that fails every operation. Used to test default fallback.
pub struct UnavailableStorage;

impl Storage for UnavailableStorage {
    fn get(&self, _key: &str) -> Result<Option<bool>, StorageError> {
        Err(StorageError::Unavailable("test double".into()))
    }

    fn set(&mut self, _key: &str, _value: bool) -> Result<(), StorageError> {
        Err(StorageError::Unavailable("test double".into()))
    }

    fn load_all(&self) -> Result<BTreeMap<String, bool>, StorageError> {
        Err(StorageError::Unavailable("test double".into()))
    }
}
