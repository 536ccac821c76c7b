//! LMDB-backed record store.
//!
//! Uses the heed crate (Rust bindings for LMDB). The environment holds two
//! named databases:
//!
//! - `records`: fund code -> JSON encoded [`Record`]
//! - `meta`: envelope entries, `schema_version` and `recency`
//!
//! # Thread Safety
//!
//! LMDB provides ACID transactions. Every trait method runs in its own
//! transaction: read transactions for `get`, `keys`, `len` and the meta
//! reads, write transactions for everything else. Transactions are never
//! held across an `.await`.

use std::path::{Path, PathBuf};

use heed::types::{Bytes, DecodeIgnore, SerdeJson, Str};
use heed::{Database, Env, EnvOpenOptions};
use quickfund_core::{FundCode, QuickFundError, QuickFundResult, Record, StorageError};

use super::recency::RecencySnapshot;
use super::traits::RecordStore;

const RECORDS_DB: &str = "records";
const META_DB: &str = "meta";
const SCHEMA_VERSION_KEY: &str = "schema_version";
const RECENCY_KEY: &str = "recency";

/// Error type for opening the LMDB store.
#[derive(Debug, thiserror::Error)]
pub enum LmdbStoreError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open a named database within the environment.
    #[error("Failed to open database {name}: {reason}")]
    DbOpen { name: &'static str, reason: String },

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbStoreError> for QuickFundError {
    fn from(e: LmdbStoreError) -> Self {
        QuickFundError::Storage(StorageError::Open {
            path: String::new(),
            reason: e.to_string(),
        })
    }
}

fn read_err(key: &str, e: impl ToString) -> QuickFundError {
    StorageError::Read {
        key: key.to_string(),
        reason: e.to_string(),
    }
    .into()
}

fn write_err(key: &str, e: impl ToString) -> QuickFundError {
    StorageError::Write {
        key: key.to_string(),
        reason: e.to_string(),
    }
    .into()
}

/// Durable record store in an LMDB environment.
///
/// # Example
///
/// ```ignore
/// use quickfund_storage::cache::LmdbRecordStore;
///
/// let store = LmdbRecordStore::open("/tmp/quickfund", 64)?;
/// store.put(&record)?;
/// assert!(store.contains(&record.code)?);
/// ```
pub struct LmdbRecordStore {
    env: Env,
    records: Database<Str, SerdeJson<Record>>,
    meta: Database<Str, Bytes>,
    path: PathBuf,
}

impl LmdbRecordStore {
    /// Open or create the store under `path`.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `map_size_mb` - Maximum size of the environment in megabytes
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the
    /// environment or its databases cannot be opened.
    pub fn open<P: AsRef<Path>>(path: P, map_size_mb: usize) -> Result<Self, LmdbStoreError> {
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment is opened once per directory per process
        // and the files are not modified by anything but this store.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size_mb * 1024 * 1024)
                .max_dbs(2)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbStoreError::EnvOpen(e.to_string()))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        let records = env
            .create_database(&mut wtxn, Some(RECORDS_DB))
            .map_err(|e| LmdbStoreError::DbOpen {
                name: RECORDS_DB,
                reason: e.to_string(),
            })?;

        let meta = env
            .create_database(&mut wtxn, Some(META_DB))
            .map_err(|e| LmdbStoreError::DbOpen {
                name: META_DB,
                reason: e.to_string(),
            })?;

        wtxn.commit()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        tracing::debug!(path = %path.as_ref().display(), map_size_mb, "opened LMDB record store");

        Ok(Self {
            env,
            records,
            meta,
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_meta(&self, key: &str) -> QuickFundResult<Option<Vec<u8>>> {
        let rtxn = self.env.read_txn().map_err(|e| read_err(key, e))?;
        let value = self
            .meta
            .get(&rtxn, key)
            .map_err(|e| read_err(key, e))?
            .map(<[u8]>::to_vec);
        Ok(value)
    }

    fn write_meta(&self, key: &str, bytes: &[u8]) -> QuickFundResult<()> {
        let mut wtxn = self.env.write_txn().map_err(|e| write_err(key, e))?;
        self.meta
            .put(&mut wtxn, key, bytes)
            .map_err(|e| write_err(key, e))?;
        wtxn.commit().map_err(|e| write_err(key, e))
    }
}

impl RecordStore for LmdbRecordStore {
    fn get(&self, code: &FundCode) -> QuickFundResult<Option<Record>> {
        let rtxn = self.env.read_txn().map_err(|e| read_err(code.as_str(), e))?;
        self.records
            .get(&rtxn, code.as_str())
            .map_err(|e| read_err(code.as_str(), e))
    }

    fn put(&self, record: &Record) -> QuickFundResult<()> {
        let key = record.code.as_str();
        let mut wtxn = self.env.write_txn().map_err(|e| write_err(key, e))?;
        self.records
            .put(&mut wtxn, key, record)
            .map_err(|e| write_err(key, e))?;
        wtxn.commit().map_err(|e| write_err(key, e))
    }

    fn delete(&self, code: &FundCode) -> QuickFundResult<bool> {
        let key = code.as_str();
        let mut wtxn = self.env.write_txn().map_err(|e| write_err(key, e))?;
        let removed = self
            .records
            .delete(&mut wtxn, key)
            .map_err(|e| write_err(key, e))?;
        wtxn.commit().map_err(|e| write_err(key, e))?;
        Ok(removed)
    }

    fn contains(&self, code: &FundCode) -> QuickFundResult<bool> {
        let rtxn = self.env.read_txn().map_err(|e| read_err(code.as_str(), e))?;
        let found = self
            .records
            .remap_data_type::<DecodeIgnore>()
            .get(&rtxn, code.as_str())
            .map_err(|e| read_err(code.as_str(), e))?;
        Ok(found.is_some())
    }

    fn keys(&self) -> QuickFundResult<Vec<FundCode>> {
        let rtxn = self.env.read_txn().map_err(|e| read_err(RECORDS_DB, e))?;
        let iter = self
            .records
            .remap_data_type::<DecodeIgnore>()
            .iter(&rtxn)
            .map_err(|e| read_err(RECORDS_DB, e))?;

        let mut keys = Vec::new();
        for entry in iter {
            let (key, ()) = entry.map_err(|e| read_err(RECORDS_DB, e))?;
            match FundCode::parse(key) {
                Ok(code) => keys.push(code),
                Err(e) => tracing::warn!(key, error = %e, "skipping malformed key in record store"),
            }
        }
        Ok(keys)
    }

    fn len(&self) -> QuickFundResult<usize> {
        let rtxn = self.env.read_txn().map_err(|e| read_err(RECORDS_DB, e))?;
        let len = self
            .records
            .len(&rtxn)
            .map_err(|e| read_err(RECORDS_DB, e))?;
        Ok(len as usize)
    }

    fn clear(&self) -> QuickFundResult<()> {
        let mut wtxn = self.env.write_txn().map_err(|e| write_err(RECORDS_DB, e))?;
        self.records
            .clear(&mut wtxn)
            .map_err(|e| write_err(RECORDS_DB, e))?;
        self.meta
            .clear(&mut wtxn)
            .map_err(|e| write_err(META_DB, e))?;
        wtxn.commit().map_err(|e| write_err(RECORDS_DB, e))
    }

    fn schema_version(&self) -> QuickFundResult<Option<String>> {
        match self.read_meta(SCHEMA_VERSION_KEY)? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| read_err(SCHEMA_VERSION_KEY, e)),
            None => Ok(None),
        }
    }

    fn set_schema_version(&self, version: &str) -> QuickFundResult<()> {
        self.write_meta(SCHEMA_VERSION_KEY, version.as_bytes())
    }

    fn load_recency(&self) -> QuickFundResult<Option<RecencySnapshot<FundCode>>> {
        match self.read_meta(RECENCY_KEY)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| {
                    StorageError::Serialization {
                        key: RECENCY_KEY.to_string(),
                        reason: e.to_string(),
                    }
                    .into()
                }),
            None => Ok(None),
        }
    }

    fn save_recency(&self, snapshot: &RecencySnapshot<FundCode>) -> QuickFundResult<()> {
        let bytes = serde_json::to_vec(snapshot).map_err(|e| StorageError::Serialization {
            key: RECENCY_KEY.to_string(),
            reason: e.to_string(),
        })?;
        self.write_meta(RECENCY_KEY, &bytes)
    }
}
