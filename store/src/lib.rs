//! Durable collections for idnet nodes.
//!
//! Every record lives in one flat key space provided by a [`KvBackend`]
//! (LMDB in production, in-memory for testing). Keys are namespaced as
//! `{nodeId}:{storeName}:{collection}:{key}` so several nodes can share a
//! backend and short-lived operational state stays apart from the audit log.
//!
//! Each collection has exactly one owning component; nothing else writes
//! to it.

pub mod deferred;
pub mod dedup;
pub mod error;
pub mod inbound;
pub mod message_log;
pub mod namespace;
pub mod pending;
pub mod task_queue;

pub use deferred::{DeferredMessage, DeferredStore};
pub use dedup::{DedupRecord, DedupStore};
pub use error::StoreError;
pub use inbound::{InboundRawStore, RawInbound};
pub use message_log::{Direction, LogEntry, MessageLog};
pub use namespace::{Namespace, StoreName};
pub use pending::{PendingOutboundMessage, PendingSendStore};
pub use task_queue::{PersistedTask, TaskQueueStore};

/// One write in an atomic batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// Ordered byte-keyed storage.
///
/// Keys compare bytewise; `scan_range` and `scan_prefix` return entries in
/// key order.
pub trait KvBackend: Send + Sync {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Returns whether the key existed.
    fn delete(&self, key: &[u8]) -> Result<bool, StoreError>;

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;

    /// Entries with `start <= key < end`.
    fn scan_range(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;

    /// Apply all operations atomically.
    fn write_batch(&self, ops: &[BatchOp]) -> Result<(), StoreError>;
}

/// Smallest byte string greater than every string starting with `prefix`.
/// Returns `None` when the prefix is all `0xFF`.
pub fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.pop() {
        if last < 0xFF {
            upper.push(last + 1);
            return Some(upper);
        }
    }
    None
}
