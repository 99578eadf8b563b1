//! Nullable store: thread-safe in-memory key-value backend for testing.

use idnet_store::{BatchOp, KvBackend, StoreError};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// An ordered in-memory [`KvBackend`].
///
/// Writes can be made to fail on demand to exercise error paths.
#[derive(Default)]
pub struct NullBackend {
    entries: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    fail_writes: AtomicBool,
    /// Writes still allowed before every write fails.
    write_budget: Mutex<Option<usize>>,
}

impl NullBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write (put, delete, batch) fail.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
        *self.write_budget.lock() = None;
    }

    /// Let the next `writes` writes succeed, then fail every write until
    /// `fail_writes(false)`. A batch counts as one write.
    pub fn fail_writes_after(&self, writes: usize) {
        *self.write_budget.lock() = Some(writes);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys under `prefix`.
    pub fn count_prefix(&self, prefix: &[u8]) -> usize {
        self.entries
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .count()
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("writes disabled".into()));
        }
        if let Some(budget) = self.write_budget.lock().as_mut() {
            if *budget == 0 {
                return Err(StoreError::Backend("write budget exhausted".into()));
            }
            *budget -= 1;
        }
        Ok(())
    }
}

impl KvBackend for NullBackend {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.check_writable()?;
        self.entries
            .lock()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn delete(&self, key: &[u8]) -> Result<bool, StoreError> {
        self.check_writable()?;
        Ok(self.entries.lock().remove(key).is_some())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        Ok(self
            .entries
            .lock()
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn scan_range(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        if start >= end {
            return Ok(Vec::new());
        }
        Ok(self
            .entries
            .lock()
            .range(start.to_vec()..end.to_vec())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write_batch(&self, ops: &[BatchOp]) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut entries = self.entries.lock();
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    entries.insert(key.clone(), value.clone());
                }
                BatchOp::Delete { key } => {
                    entries.remove(key);
                }
            }
        }
        Ok(())
    }
}
