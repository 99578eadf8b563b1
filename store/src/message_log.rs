//! Append-only audit log of inbound and outbound messages.
//!
//! Entries are keyed `len ++ request_id ++ seq (u64 BE)` in the audit
//! store. `seq` comes from a persisted counter that only moves forward,
//! so a request's history reads back in append order across restarts and
//! regardless of the wall clock.

use std::sync::Arc;

use idnet_types::{MsgId, NodeId, RequestId, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::namespace::{push_component, Namespace, StoreName};
use crate::{BatchOp, KvBackend, StoreError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub direction: Direction,
    pub message_type: String,
    pub request_id: RequestId,
    /// Sender for inbound entries, receiver for outbound ones.
    pub peer: NodeId,
    pub msg_id: MsgId,
    /// The message body as JSON.
    pub body: Vec<u8>,
    pub logged_at: Timestamp,
}

pub struct MessageLog {
    backend: Arc<dyn KvBackend>,
    ns: Namespace,
    counter_key: Vec<u8>,
    /// Next sequence number; `None` until read from the backend.
    next_seq: Mutex<Option<u64>>,
}

impl MessageLog {
    pub fn new(backend: Arc<dyn KvBackend>, node_id: &NodeId) -> Self {
        Self {
            backend,
            ns: Namespace::new(node_id, StoreName::Audit, "messages"),
            counter_key: Namespace::new(node_id, StoreName::Audit, "message_seq").key(b"next"),
            next_seq: Mutex::new(None),
        }
    }

    fn request_prefix(&self, request_id: &RequestId) -> Vec<u8> {
        let mut suffix = Vec::new();
        push_component(&mut suffix, request_id.as_str());
        self.ns.key(&suffix)
    }

    fn load_counter(&self) -> Result<u64, StoreError> {
        match self.backend.get(&self.counter_key)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StoreError::Corruption("message log counter".into()))?;
                Ok(u64::from_be_bytes(raw))
            }
            None => Ok(0),
        }
    }

    pub fn append(&self, entry: &LogEntry) -> Result<(), StoreError> {
        self.append_with(std::slice::from_ref(entry), Vec::new())
    }

    /// Append `entries` in order, committing `extra` in the same atomic
    /// batch. `extra` must target this log's backend.
    pub fn append_with(&self, entries: &[LogEntry], extra: Vec<BatchOp>) -> Result<(), StoreError> {
        let mut next_seq = self.next_seq.lock();
        let mut seq = match *next_seq {
            Some(seq) => seq,
            None => self.load_counter()?,
        };
        let mut ops = extra;
        for entry in entries {
            let mut key = self.request_prefix(&entry.request_id);
            key.extend_from_slice(&seq.to_be_bytes());
            ops.push(BatchOp::Put {
                key,
                value: bincode::serialize(entry)?,
            });
            seq += 1;
        }
        ops.push(BatchOp::Put {
            key: self.counter_key.clone(),
            value: seq.to_be_bytes().to_vec(),
        });
        self.backend.write_batch(&ops)?;
        *next_seq = Some(seq);
        Ok(())
    }

    /// Every entry logged for `request_id`, in append order.
    pub fn history(&self, request_id: &RequestId) -> Result<Vec<LogEntry>, StoreError> {
        self.backend
            .scan_prefix(&self.request_prefix(request_id))?
            .into_iter()
            .map(|(_, v)| bincode::deserialize(&v).map_err(StoreError::from))
            .collect()
    }
}
