//! Dedup timeouts, owned by the Inbound Receive Pipeline.

use std::sync::Arc;

use idnet_types::{MsgId, NodeId, Timestamp};
use serde::{Deserialize, Serialize};

use crate::namespace::{compound_key, Namespace, StoreName};
use crate::{KvBackend, StoreError};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupRecord {
    pub sender: NodeId,
    pub msg_id: MsgId,
    pub expires_at: Timestamp,
}

pub struct DedupStore {
    backend: Arc<dyn KvBackend>,
    ns: Namespace,
}

impl DedupStore {
    pub fn new(backend: Arc<dyn KvBackend>, node_id: &NodeId) -> Self {
        Self {
            backend,
            ns: Namespace::new(node_id, StoreName::Ops, "dedup_timeouts"),
        }
    }

    fn key(&self, sender: &NodeId, msg_id: &MsgId) -> Vec<u8> {
        self.ns.key(&compound_key(&[sender.as_str(), msg_id.as_str()]))
    }

    pub fn put(&self, record: &DedupRecord) -> Result<(), StoreError> {
        let bytes = bincode::serialize(record)?;
        self.backend
            .put(&self.key(&record.sender, &record.msg_id), &bytes)
    }

    pub fn delete(&self, sender: &NodeId, msg_id: &MsgId) -> Result<bool, StoreError> {
        self.backend.delete(&self.key(sender, msg_id))
    }

    pub fn all(&self) -> Result<Vec<DedupRecord>, StoreError> {
        self.backend
            .scan_prefix(self.ns.prefix())?
            .into_iter()
            .map(|(_, v)| bincode::deserialize(&v).map_err(StoreError::from))
            .collect()
    }
}
