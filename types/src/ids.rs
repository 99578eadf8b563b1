//! Identifier newtypes.
//!
//! Node, request and worker ids are opaque strings assigned outside this
//! node (on-ledger registration, the requester, the worker process).
//! Message and correlation ids are generated locally.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A ledger block height.
pub type Height = u64;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Identity of a network participant (RP, IdP, AS or proxy).
    NodeId
);

string_id!(
    /// Logical request id; all tasks sharing one run strictly in order.
    RequestId
);

string_id!(
    /// Identity of a worker process connected to a coordinator.
    WorkerId
);

string_id!(
    /// Sender-assigned message id, unique per sender.
    MsgId
);

impl MsgId {
    /// Generate a fresh, locally unique message id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }
}

/// Matches a remote job's result back to the waiting caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_msg_ids_are_unique() {
        let a = MsgId::generate();
        let b = MsgId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn string_ids_display_verbatim() {
        let node = NodeId::new("idp-1");
        assert_eq!(node.to_string(), "idp-1");
        assert_eq!(RequestId::from("r1").as_str(), "r1");
    }

    #[test]
    fn correlation_id_serde_roundtrip() {
        let id = CorrelationId::generate();
        let json = serde_json::to_string(&id).unwrap();
        let back: CorrelationId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
