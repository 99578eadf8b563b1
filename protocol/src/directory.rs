//! On-ledger node directory lookups used for sealing and verification.

use idnet_types::{NodeId, PublicKey};

use crate::error::DirectoryError;

/// How a message reaches its receiver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Route {
    Direct {
        receiver: NodeId,
        receiver_key: PublicKey,
    },
    ViaProxy {
        receiver: NodeId,
        receiver_key: PublicKey,
        proxy: NodeId,
        proxy_key: PublicKey,
    },
}

impl Route {
    pub fn receiver(&self) -> &NodeId {
        match self {
            Route::Direct { receiver, .. } | Route::ViaProxy { receiver, .. } => receiver,
        }
    }

    /// The node the transport actually connects to.
    pub fn next_hop(&self) -> &NodeId {
        match self {
            Route::Direct { receiver, .. } => receiver,
            Route::ViaProxy { proxy, .. } => proxy,
        }
    }
}

/// Public keys, addresses and proxy assignments as recorded on the ledger.
pub trait NodeDirectory: Send + Sync {
    fn public_key(&self, node: &NodeId) -> Result<PublicKey, DirectoryError>;

    fn address(&self, node: &NodeId) -> Result<String, DirectoryError>;

    /// The proxy fronting `node`, if any.
    fn proxy_for(&self, node: &NodeId) -> Option<NodeId>;

    /// Resolve the route and next-hop address for `receiver`.
    fn route(&self, receiver: &NodeId) -> Result<(Route, String), DirectoryError> {
        let receiver_key = self.public_key(receiver)?;
        match self.proxy_for(receiver) {
            Some(proxy) => {
                let proxy_key = self.public_key(&proxy)?;
                let address = self.address(&proxy)?;
                Ok((
                    Route::ViaProxy {
                        receiver: receiver.clone(),
                        receiver_key,
                        proxy,
                        proxy_key,
                    },
                    address,
                ))
            }
            None => {
                let address = self.address(receiver)?;
                Ok((
                    Route::Direct {
                        receiver: receiver.clone(),
                        receiver_key,
                    },
                    address,
                ))
            }
        }
    }
}
