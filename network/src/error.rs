use idnet_protocol::{CodecError, DirectoryError, SealError};
use idnet_store::StoreError;
use thiserror::Error;

/// Failures of a single delivery attempt. All of them are retried.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection to {address} failed: {reason}")]
    Connect { address: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no acknowledgement within {0:?}")]
    AckTimeout(std::time::Duration),

    #[error("receiver refused frame: {0}")]
    Refused(String),

    #[error("frame too large: {size} > {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("frame encoding error: {0}")]
    Encoding(String),
}

impl From<bincode::Error> for TransportError {
    fn from(e: bincode::Error) -> Self {
        TransportError::Encoding(e.to_string())
    }
}

/// Failures that prevent a send from starting at all.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("receiver lookup failed: {0}")]
    Directory(#[from] DirectoryError),

    #[error("encoding failed: {0}")]
    Codec(#[from] CodecError),

    #[error("sealing failed: {0}")]
    Seal(#[from] SealError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("no signing keys held for sender {0}")]
    UnknownSender(idnet_types::NodeId),

    #[error("send manager is shutting down")]
    ShuttingDown,
}

/// Failures of an inbound message.
#[derive(Debug, Error)]
pub enum ReceiveError {
    /// Durable state could not be written; the frame is not acknowledged.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("undecodable envelope: {0}")]
    Undecodable(String),

    #[error("integrity check failed: {0}")]
    Seal(#[from] SealError),

    #[error("payload rejected: {0}")]
    Codec(#[from] CodecError),

    #[error("downstream handoff failed: {0}")]
    Handoff(String),
}

impl ReceiveError {
    /// Integrity failures are final for the message: never retried.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            ReceiveError::Undecodable(_) | ReceiveError::Seal(_) | ReceiveError::Codec(_)
        )
    }
}
