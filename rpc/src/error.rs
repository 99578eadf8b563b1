//! RPC error types.

use idnet_types::WorkerId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("malformed frame: {0}")]
    Frame(#[from] serde_json::Error),

    #[error("worker {0} is already connected")]
    DuplicateWorker(WorkerId),

    #[error("channel closed")]
    Closed,

    #[error("server error: {0}")]
    Server(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for RpcError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        RpcError::WebSocket(e.to_string())
    }
}
