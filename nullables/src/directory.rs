//! Nullable ledger directory: keys, addresses and proxies set by the test.

use idnet_protocol::{DirectoryError, NodeDirectory};
use idnet_types::{NodeId, PublicKey};
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Default)]
pub struct NullDirectory {
    keys: RwLock<HashMap<NodeId, PublicKey>>,
    addresses: RwLock<HashMap<NodeId, String>>,
    proxies: RwLock<HashMap<NodeId, NodeId>>,
}

impl NullDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node: &NodeId, key: PublicKey, address: impl Into<String>) {
        self.keys.write().insert(node.clone(), key);
        self.addresses
            .write()
            .insert(node.clone(), address.into());
    }

    /// Put `node` behind `proxy`.
    pub fn set_proxy(&self, node: &NodeId, proxy: &NodeId) {
        self.proxies
            .write()
            .insert(node.clone(), proxy.clone());
    }

    /// Record a key rotation.
    pub fn rotate_key(&self, node: &NodeId, key: PublicKey) {
        self.keys.write().insert(node.clone(), key);
    }
}

impl NodeDirectory for NullDirectory {
    fn public_key(&self, node: &NodeId) -> Result<PublicKey, DirectoryError> {
        self.keys
            .read()
            .get(node)
            .cloned()
            .ok_or_else(|| DirectoryError::UnknownKey(node.clone()))
    }

    fn address(&self, node: &NodeId) -> Result<String, DirectoryError> {
        self.addresses
            .read()
            .get(node)
            .cloned()
            .ok_or_else(|| DirectoryError::UnknownAddress(node.clone()))
    }

    fn proxy_for(&self, node: &NodeId) -> Option<NodeId> {
        self.proxies.read().get(node).cloned()
    }
}
