//! Fundamental types for idnet nodes.
//!
//! This crate defines the identifiers and key material shared across every
//! other crate in the workspace: node/message/request ids, ledger heights,
//! Ed25519 key types, and millisecond timestamps.

pub mod ids;
pub mod keys;
pub mod time;

pub use ids::{CorrelationId, Height, MsgId, NodeId, RequestId, WorkerId};
pub use keys::{KeyPair, PrivateKey, PublicKey, Signature};
pub use time::{Clock, SystemClock, Timestamp};
