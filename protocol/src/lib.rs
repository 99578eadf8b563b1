//! Wire protocol: envelope encoding, compression, sealing and versioning.
//!
//! Outbound: a [`ProtocolMessage`](idnet_messages::ProtocolMessage) is
//! encoded by [`codec`], signed into an [`Envelope`], and sealed by
//! [`secure`] into an [`EncryptedEnvelope`] (wrapped once more for a
//! proxy when the recipient sits behind one). Inbound reverses the steps.

pub mod codec;
pub mod directory;
pub mod envelope;
pub mod error;
pub mod secure;
pub mod version;

pub use codec::{CodecConfig, CompressionAlgorithm, EncodedPayload};
pub use directory::{NodeDirectory, Route};
pub use envelope::{EncryptedEnvelope, Envelope, ProxyEnvelope, SealedBody};
pub use error::{CodecError, DirectoryError, Layer, SealError};
pub use secure::{open, open_layers, seal, Keyring, Opened, OpenedEnvelope};
pub use version::PROTOCOL_VERSION;
