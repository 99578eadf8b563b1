//! Protocol message types for idnet node-to-node communication.
//!
//! The meaning of each message belongs to the role-specific handlers; this
//! crate only fixes their shape, the request id they are ordered by, and the
//! ledger height they depend on.

pub mod schema;
pub mod types;

pub use schema::{SchemaError, SchemaRegistry, Validate};
pub use types::{
    ConsentRequest, ConsentResponse, ConsentStatus, DataRequest, DataResponse, ErrorResponse,
    MessageType, ProtocolMessage, RequestClosed,
};
