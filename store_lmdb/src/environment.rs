//! LMDB environment setup and the [`KvBackend`] implementation.

use std::ops::Bound;
use std::path::Path;

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use tracing::info;

use idnet_store::{BatchOp, KvBackend, StoreError};

use crate::LmdbError;

const DATABASE_NAME: &str = "kv";
const MAX_DBS: u32 = 4;

/// Default map size: 1 GiB.
pub const DEFAULT_MAP_SIZE: usize = 1024 * 1024 * 1024;

/// Wraps the LMDB environment and its single key-value database.
pub struct LmdbBackend {
    env: Env,
    db: Database<Bytes, Bytes>,
}

impl LmdbBackend {
    /// Open or create an LMDB environment at `path`.
    pub fn open(path: &Path, map_size: usize) -> Result<Self, LmdbError> {
        std::fs::create_dir_all(path)?;
        // SAFETY: the environment is opened once per process per path; the
        // node never opens the same directory twice concurrently.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(MAX_DBS)
                .open(path)?
        };
        let mut wtxn = env.write_txn()?;
        let db: Database<Bytes, Bytes> = env.create_database(&mut wtxn, Some(DATABASE_NAME))?;
        wtxn.commit()?;
        info!(path = %path.display(), map_size, "opened LMDB environment");
        Ok(Self { env, db })
    }

    fn collect<'t, I>(iter: I) -> Result<Vec<(Vec<u8>, Vec<u8>)>, LmdbError>
    where
        I: Iterator<Item = heed::Result<(&'t [u8], &'t [u8])>>,
    {
        let mut entries = Vec::new();
        for item in iter {
            let (k, v) = item?;
            entries.push((k.to_vec(), v.to_vec()));
        }
        Ok(entries)
    }
}

impl KvBackend for LmdbBackend {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut wtxn = self.env.write_txn().map_err(LmdbError::from)?;
        self.db.put(&mut wtxn, key, value).map_err(LmdbError::from)?;
        wtxn.commit().map_err(LmdbError::from)?;
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let rtxn = self.env.read_txn().map_err(LmdbError::from)?;
        let value = self.db.get(&rtxn, key).map_err(LmdbError::from)?;
        Ok(value.map(|v| v.to_vec()))
    }

    fn delete(&self, key: &[u8]) -> Result<bool, StoreError> {
        let mut wtxn = self.env.write_txn().map_err(LmdbError::from)?;
        let existed = self.db.delete(&mut wtxn, key).map_err(LmdbError::from)?;
        wtxn.commit().map_err(LmdbError::from)?;
        Ok(existed)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let rtxn = self.env.read_txn().map_err(LmdbError::from)?;
        let iter = self.db.prefix_iter(&rtxn, prefix).map_err(LmdbError::from)?;
        Ok(Self::collect(iter)?)
    }

    fn scan_range(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let rtxn = self.env.read_txn().map_err(LmdbError::from)?;
        let bounds = (Bound::Included(start), Bound::Excluded(end));
        let iter = self.db.range(&rtxn, &bounds).map_err(LmdbError::from)?;
        Ok(Self::collect(iter)?)
    }

    fn write_batch(&self, ops: &[BatchOp]) -> Result<(), StoreError> {
        let mut wtxn = self.env.write_txn().map_err(LmdbError::from)?;
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    self.db.put(&mut wtxn, key, value).map_err(LmdbError::from)?;
                }
                BatchOp::Delete { key } => {
                    self.db.delete(&mut wtxn, key).map_err(LmdbError::from)?;
                }
            }
        }
        wtxn.commit().map_err(LmdbError::from)?;
        Ok(())
    }
}
