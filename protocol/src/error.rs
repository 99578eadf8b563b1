use idnet_messages::SchemaError;
use idnet_types::NodeId;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("message serialization failed: {0}")]
    Serialize(String),

    #[error("payload too large: {size} > {max}")]
    TooLarge { size: usize, max: usize },

    #[error("{algorithm:?} compression failed: {reason}")]
    Compression {
        algorithm: crate::CompressionAlgorithm,
        reason: String,
    },

    #[error("{algorithm:?} decompression failed: {reason}")]
    Decompression {
        algorithm: crate::CompressionAlgorithm,
        reason: String,
    },

    #[error("schema validation failed: {0}")]
    Schema(#[from] SchemaError),
}

/// Which sealing layer a failure was detected on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Layer {
    /// The signed application envelope.
    Envelope,
    /// The proxy re-wrapping layer.
    Proxy,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layer::Envelope => f.write_str("envelope"),
            Layer::Proxy => f.write_str("proxy"),
        }
    }
}

/// Integrity failures while sealing or opening. Every variant is fatal for
/// the message it concerns.
#[derive(Debug, Error)]
pub enum SealError {
    #[error("signature mismatch on {layer} layer")]
    SignatureMismatch { layer: Layer },

    #[error("protocol version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u16, found: u16 },

    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("decryption failed: {0}")]
    Decryption(#[from] idnet_crypto::CryptoError),

    #[error("no public key on ledger for signer {0}")]
    UnknownSigner(NodeId),

    #[error("sender mismatch: transport says {transport}, envelope says {envelope}")]
    SenderMismatch { transport: NodeId, envelope: NodeId },

    #[error("proxied message for {0}, which this node does not hold keys for")]
    NotAddressedToUs(NodeId),

    #[error("directory lookup failed: {0}")]
    Directory(#[from] DirectoryError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("no public key registered for {0}")]
    UnknownKey(NodeId),

    #[error("no address registered for {0}")]
    UnknownAddress(NodeId),
}
