//! Deferred messages, owned by the Ledger-Height Gate.
//!
//! Keys are `height (u64 BE) ++ sender ++ msg_id`, with both ids length
//! prefixed, so a height interval is a single ordered range scan and two
//! senders may reuse a message id.

use std::sync::Arc;

use idnet_types::{Height, MsgId, NodeId};
use serde::{Deserialize, Serialize};

use crate::namespace::{compound_key, Namespace, StoreName};
use crate::{prefix_upper_bound, KvBackend, StoreError};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredMessage {
    pub expected_height: Height,
    pub sender: NodeId,
    pub msg_id: MsgId,
    /// The validated message in whatever form the gate's owner re-reads.
    pub raw_message: Vec<u8>,
}

pub struct DeferredStore {
    backend: Arc<dyn KvBackend>,
    ns: Namespace,
}

impl DeferredStore {
    pub fn new(backend: Arc<dyn KvBackend>, node_id: &NodeId) -> Self {
        Self {
            backend,
            ns: Namespace::new(node_id, StoreName::Ops, "deferred"),
        }
    }

    fn key(&self, height: Height, sender: &NodeId, msg_id: &MsgId) -> Vec<u8> {
        let mut suffix = height.to_be_bytes().to_vec();
        suffix.extend_from_slice(&compound_key(&[sender.as_str(), msg_id.as_str()]));
        self.ns.key(&suffix)
    }

    pub fn put(&self, message: &DeferredMessage) -> Result<(), StoreError> {
        let bytes = bincode::serialize(message)?;
        self.backend
            .put(&self.key(message.expected_height, &message.sender, &message.msg_id), &bytes)
    }

    pub fn delete(&self, height: Height, sender: &NodeId, msg_id: &MsgId) -> Result<bool, StoreError> {
        self.backend.delete(&self.key(height, sender, msg_id))
    }

    /// Messages with `after < expected_height <= up_to`, in height order.
    pub fn range(&self, after: Height, up_to: Height) -> Result<Vec<DeferredMessage>, StoreError> {
        if up_to <= after {
            return Ok(Vec::new());
        }
        let start = self.ns.key(&(after + 1).to_be_bytes());
        let end = match up_to.checked_add(1) {
            Some(next) => self.ns.key(&next.to_be_bytes()),
            None => prefix_upper_bound(self.ns.prefix())
                .ok_or_else(|| StoreError::Corruption("unbounded namespace".into()))?,
        };
        self.decode_all(self.backend.scan_range(&start, &end)?)
    }

    pub fn all(&self) -> Result<Vec<DeferredMessage>, StoreError> {
        self.decode_all(self.backend.scan_prefix(self.ns.prefix())?)
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        Ok(self.backend.scan_prefix(self.ns.prefix())?.len())
    }

    fn decode_all(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<Vec<DeferredMessage>, StoreError> {
        entries
            .into_iter()
            .map(|(_, v)| bincode::deserialize(&v).map_err(StoreError::from))
            .collect()
    }
}
