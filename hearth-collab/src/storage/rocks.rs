//! RocksDB-backed blob store.
//!
//! All blobs live in one column family, `blobs`, keyed by their UTF-8 key.
//! Values are already LZ4-framed by the codecs, but RocksDB's own LZ4 block
//! compression stays on for the folder listings and small bags that
//! compress well across keys.

use std::path::{Path, PathBuf};

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode, IteratorMode,
    Options, SingleThreaded, WriteBatch, WriteOptions,
};

use super::{BlobStore, StoreError};

const CF_BLOBS: &str = "blobs";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("hearth_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

pub struct RocksStore {
    /// Column families are fixed at open, so single-threaded mode suffices
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store, creating the database if it doesn't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf = ColumnFamilyDescriptor::new(CF_BLOBS, Self::cf_options(&config));
        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(&db_opts, &config.path, vec![cf])?;

        log::info!("Opened blob store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);
        opts
    }

    /// Force a flush of the memtables.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(CF_BLOBS)
            .ok_or_else(|| StoreError::Database(format!("Column family '{CF_BLOBS}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }
}

impl BlobStore for RocksStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf()?;
        Ok(self.db.get_cf(&cf, key.as_bytes())?)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let cf = self.cf()?;
        self.db.put_cf_opt(&cf, key.as_bytes(), value, &self.write_options())?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let cf = self.cf()?;
        self.db.delete_cf_opt(&cf, key.as_bytes(), &self.write_options())?;
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let cf = self.cf()?;
        if !self.db.key_may_exist_cf(&cf, key.as_bytes()) {
            return Ok(false);
        }
        Ok(self.db.get_pinned_cf(&cf, key.as_bytes())?.is_some())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf()?;
        let mut keys = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let key = String::from_utf8(key.into_vec()).map_err(|e| StoreError::InvalidKey(e.to_string()))?;
            keys.push(key);
        }
        Ok(keys)
    }

    fn write_batch(&self, sets: &[(String, Vec<u8>)], removes: &[String]) -> Result<(), StoreError> {
        let cf = self.cf()?;
        let mut batch = WriteBatch::default();
        for (key, value) in sets {
            batch.put_cf(&cf, key.as_bytes(), value);
        }
        for key in removes {
            batch.delete_cf(&cf, key.as_bytes());
        }
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
