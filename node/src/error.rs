use thiserror::Error;

use crate::dispatcher::DispatchError;
use crate::gate::GateError;
use crate::queue::QueueError;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("config error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(#[from] idnet_store::StoreError),

    #[error("send error: {0}")]
    Send(#[from] idnet_network::SendError),

    #[error("receive error: {0}")]
    Receive(#[from] idnet_network::ReceiveError),

    #[error("height gate error: {0}")]
    Gate(#[from] GateError),

    #[error("task queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("worker RPC error: {0}")]
    Rpc(#[from] idnet_rpc::RpcError),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("node already started")]
    AlreadyStarted,
}
