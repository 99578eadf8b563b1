//! Raw inbound messages awaiting processing, owned by the Inbound Receive
//! Pipeline. A record lives from receipt until the message has been handed
//! to the height gate or rejected; whatever is left at startup is replayed.

use std::sync::Arc;

use idnet_types::{MsgId, NodeId, Timestamp};
use serde::{Deserialize, Serialize};

use crate::namespace::{compound_key, Namespace, StoreName};
use crate::{KvBackend, StoreError};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawInbound {
    pub sender: NodeId,
    pub msg_id: MsgId,
    pub bytes: Vec<u8>,
    pub received_at: Timestamp,
}

pub struct InboundRawStore {
    backend: Arc<dyn KvBackend>,
    ns: Namespace,
}

impl InboundRawStore {
    pub fn new(backend: Arc<dyn KvBackend>, node_id: &NodeId) -> Self {
        Self {
            backend,
            ns: Namespace::new(node_id, StoreName::Ops, "inbound_raw"),
        }
    }

    fn key(&self, sender: &NodeId, msg_id: &MsgId) -> Vec<u8> {
        self.ns.key(&compound_key(&[sender.as_str(), msg_id.as_str()]))
    }

    pub fn put(&self, raw: &RawInbound) -> Result<(), StoreError> {
        let bytes = bincode::serialize(raw)?;
        self.backend.put(&self.key(&raw.sender, &raw.msg_id), &bytes)
    }

    pub fn delete(&self, sender: &NodeId, msg_id: &MsgId) -> Result<bool, StoreError> {
        self.backend.delete(&self.key(sender, msg_id))
    }

    /// Unprocessed messages, oldest receipt first.
    pub fn all(&self) -> Result<Vec<RawInbound>, StoreError> {
        let mut raws = self
            .backend
            .scan_prefix(self.ns.prefix())?
            .into_iter()
            .map(|(_, v)| bincode::deserialize(&v).map_err(StoreError::from))
            .collect::<Result<Vec<RawInbound>, _>>()?;
        raws.sort_by_key(|r| r.received_at);
        Ok(raws)
    }
}
