//! Pending outbound sends, owned by the Outbound Send Manager.
//!
//! A record exists from the moment a send begins until it is acknowledged
//! or abandoned, so an interrupted send can be resumed after a restart.

use std::sync::Arc;

use idnet_types::{MsgId, NodeId, Timestamp};
use serde::{Deserialize, Serialize};

use crate::namespace::{Namespace, StoreName};
use crate::{BatchOp, KvBackend, StoreError};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOutboundMessage {
    pub msg_id: MsgId,
    /// The node the envelope is signed as.
    pub sender: NodeId,
    pub receiver: NodeId,
    pub destination_address: String,
    /// The sealed envelope, ready for the transport.
    pub payload: Vec<u8>,
    /// First attempt; the retry ceiling is measured from here.
    pub send_start_time: Timestamp,
}

pub struct PendingSendStore {
    backend: Arc<dyn KvBackend>,
    ns: Namespace,
}

impl PendingSendStore {
    pub fn new(backend: Arc<dyn KvBackend>, node_id: &NodeId) -> Self {
        Self {
            backend,
            ns: Namespace::new(node_id, StoreName::Ops, "pending_sends"),
        }
    }

    pub fn put(&self, pending: &PendingOutboundMessage) -> Result<(), StoreError> {
        let bytes = bincode::serialize(pending)?;
        self.backend
            .put(&self.ns.key(pending.msg_id.as_str().as_bytes()), &bytes)
    }

    /// Batch operations that persist every record in `pending`, for a
    /// caller that commits them together with other writes.
    pub fn put_ops(&self, pending: &[PendingOutboundMessage]) -> Result<Vec<BatchOp>, StoreError> {
        pending
            .iter()
            .map(|p| {
                Ok(BatchOp::Put {
                    key: self.ns.key(p.msg_id.as_str().as_bytes()),
                    value: bincode::serialize(p)?,
                })
            })
            .collect()
    }

    pub fn get(&self, msg_id: &MsgId) -> Result<Option<PendingOutboundMessage>, StoreError> {
        match self.backend.get(&self.ns.key(msg_id.as_str().as_bytes()))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn delete(&self, msg_id: &MsgId) -> Result<bool, StoreError> {
        self.backend.delete(&self.ns.key(msg_id.as_str().as_bytes()))
    }

    /// Every still-pending send, for resumption at startup.
    pub fn all(&self) -> Result<Vec<PendingOutboundMessage>, StoreError> {
        self.backend
            .scan_prefix(self.ns.prefix())?
            .into_iter()
            .map(|(_, v)| bincode::deserialize(&v).map_err(StoreError::from))
            .collect()
    }
}
