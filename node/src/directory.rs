//! Node directory built from the configured peer list.
//!
//! Stands in for the on-ledger registry of node keys, addresses and
//! proxies until a ledger client provides one.

use std::collections::HashMap;

use idnet_protocol::{DirectoryError, NodeDirectory};
use idnet_types::{NodeId, PublicKey};

use crate::config::PeerConfig;
use crate::NodeError;

struct Entry {
    key: PublicKey,
    address: String,
    proxy: Option<NodeId>,
}

pub struct StaticDirectory {
    entries: HashMap<NodeId, Entry>,
}

impl StaticDirectory {
    pub fn from_peers(peers: &[PeerConfig]) -> Result<Self, NodeError> {
        let mut entries = HashMap::with_capacity(peers.len());
        for peer in peers {
            let bytes = hex::decode(&peer.public_key).map_err(|e| {
                NodeError::Config(format!("peer {}: public key is not hex: {e}", peer.node_id))
            })?;
            let key: [u8; 32] = bytes.try_into().map_err(|_| {
                NodeError::Config(format!("peer {}: public key must be 32 bytes", peer.node_id))
            })?;
            let previous = entries.insert(
                peer.node_id.clone(),
                Entry {
                    key: PublicKey(key),
                    address: peer.address.clone(),
                    proxy: peer.proxy.clone(),
                },
            );
            if previous.is_some() {
                return Err(NodeError::Config(format!("peer {} listed twice", peer.node_id)));
            }
        }
        for (node, entry) in &entries {
            if let Some(proxy) = &entry.proxy {
                if !entries.contains_key(proxy) {
                    return Err(NodeError::Config(format!(
                        "peer {node}: proxy {proxy} is not a listed peer"
                    )));
                }
            }
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl NodeDirectory for StaticDirectory {
    fn public_key(&self, node: &NodeId) -> Result<PublicKey, DirectoryError> {
        self.entries
            .get(node)
            .map(|entry| entry.key.clone())
            .ok_or_else(|| DirectoryError::UnknownKey(node.clone()))
    }

    fn address(&self, node: &NodeId) -> Result<String, DirectoryError> {
        self.entries
            .get(node)
            .map(|entry| entry.address.clone())
            .ok_or_else(|| DirectoryError::UnknownAddress(node.clone()))
    }

    fn proxy_for(&self, node: &NodeId) -> Option<NodeId> {
        self.entries.get(node).and_then(|entry| entry.proxy.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idnet_protocol::Route;

    fn peer(id: &str, byte: u8, proxy: Option<&str>) -> PeerConfig {
        PeerConfig {
            node_id: NodeId::new(id),
            public_key: hex::encode([byte; 32]),
            address: format!("{id}.example:7700"),
            proxy: proxy.map(NodeId::new),
        }
    }

    #[test]
    fn routes_through_configured_proxy() {
        let directory =
            StaticDirectory::from_peers(&[peer("idp-2", 2, Some("proxy-1")), peer("proxy-1", 9, None)])
                .unwrap();
        let (route, address) = directory.route(&NodeId::new("idp-2")).unwrap();
        assert_eq!(address, "proxy-1.example:7700");
        assert!(matches!(route, Route::ViaProxy { proxy, .. } if proxy == NodeId::new("proxy-1")));
        assert_eq!(directory.public_key(&NodeId::new("idp-2")).unwrap(), PublicKey([2; 32]));
    }

    #[test]
    fn rejects_bad_keys_duplicates_and_dangling_proxies() {
        let mut short = peer("a", 1, None);
        short.public_key = "abcd".into();
        assert!(StaticDirectory::from_peers(&[short]).is_err());
        assert!(StaticDirectory::from_peers(&[peer("a", 1, None), peer("a", 2, None)]).is_err());
        assert!(StaticDirectory::from_peers(&[peer("a", 1, Some("ghost"))]).is_err());
    }

    #[test]
    fn unknown_node_is_a_lookup_error() {
        let directory = StaticDirectory::from_peers(&[]).unwrap();
        assert!(directory.is_empty());
        assert!(matches!(
            directory.route(&NodeId::new("nobody")),
            Err(DirectoryError::UnknownKey(_))
        ));
    }
}
