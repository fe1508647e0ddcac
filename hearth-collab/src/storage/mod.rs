//! Blob persistence.
//!
//! Every component persists through the [`BlobStore`] trait: a flat map from
//! UTF-8 keys to opaque bytes. Keys follow one layout:
//!
//! ```text
//! images/folders       folder tree of the images class
//! images/<id>          one uploaded image
//! characters/<id>      one character bag
//! maps/<id>            one encoded scene
//! session/currentMap   map shown to guests
//! auth/password        SHA-256 digest of the admin password
//! ```
//!
//! Calls are synchronous and made while the owning component holds its
//! lock, so a store only has to be safe for concurrent use, not ordered.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("write rejected")]
    WriteRejected,
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

pub trait BlobStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), StoreError>;

    fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key)?.is_some())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError>;

    /// Write `sets` and drop `removes` together. Backends that can batch
    /// apply both atomically.
    fn write_batch(&self, sets: &[(String, Vec<u8>)], removes: &[String]) -> Result<(), StoreError> {
        for (key, value) in sets {
            self.set(key, value)?;
        }
        for key in removes {
            self.remove(key)?;
        }
        Ok(())
    }
}
