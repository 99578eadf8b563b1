//! Key namespacing: `{nodeId}:{storeName}:{collection}:{key}`.

use idnet_types::NodeId;
use std::fmt;

/// Separates short-lived operational state from long-term audit records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreName {
    Ops,
    Audit,
}

impl StoreName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreName::Ops => "ops",
            StoreName::Audit => "audit",
        }
    }
}

impl fmt::Display for StoreName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The key prefix for one collection of one node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Namespace {
    prefix: Vec<u8>,
}

impl Namespace {
    pub fn new(node_id: &NodeId, store: StoreName, collection: &str) -> Self {
        let prefix = format!("{node_id}:{store}:{collection}:").into_bytes();
        Self { prefix }
    }

    /// Prefix shared by every key in this collection.
    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    pub fn key(&self, suffix: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.prefix.len() + suffix.len());
        key.extend_from_slice(&self.prefix);
        key.extend_from_slice(suffix);
        key
    }

    /// Strip the namespace prefix from a full key.
    pub fn suffix<'a>(&self, key: &'a [u8]) -> Option<&'a [u8]> {
        key.strip_prefix(self.prefix.as_slice())
    }
}

/// Append one length-prefixed id to `key`.
///
/// Each component is self-delimiting, so no id can be read as the prefix
/// of another and a prefix scan over one id never reaches a longer one.
pub(crate) fn push_component(key: &mut Vec<u8>, part: &str) {
    key.extend_from_slice(&(part.len() as u32).to_be_bytes());
    key.extend_from_slice(part.as_bytes());
}

/// Join id parts as length-prefixed components.
pub(crate) fn compound_key(parts: &[&str]) -> Vec<u8> {
    let mut key = Vec::with_capacity(parts.iter().map(|p| p.len() + 4).sum());
    for part in parts {
        push_component(&mut key, part);
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        let ns = Namespace::new(&NodeId::new("idp-1"), StoreName::Ops, "pending_sends");
        assert_eq!(ns.key(b"m1"), b"idp-1:ops:pending_sends:m1".to_vec());
        assert_eq!(ns.suffix(b"idp-1:ops:pending_sends:m1"), Some(&b"m1"[..]));
        assert_eq!(ns.suffix(b"idp-2:ops:pending_sends:m1"), None);
    }

    #[test]
    fn compound_keys_separate_parts() {
        assert_eq!(compound_key(&["a", "bc"]), b"\0\0\0\x01a\0\0\0\x02bc".to_vec());
        assert_ne!(compound_key(&["ab", "c"]), compound_key(&["a", "bc"]));
        assert_ne!(compound_key(&["a\0b", "c"]), compound_key(&["a", "b\0c"]));
    }

    #[test]
    fn component_is_never_a_prefix_of_a_longer_id() {
        let short = compound_key(&["r1"]);
        let long = compound_key(&["r1\0x"]);
        assert!(!long.starts_with(&short));
    }
}
