//! Task argument shapes and callback keys shared by the node, its workers
//! and the handlers registered on both.
//!
//! Arguments are bincode so they survive the task store and the trip to a
//! worker unchanged. Inbound messages carry their validated JSON body and
//! are re-read through the schema registry by the handler.

use idnet_messages::schema::MAX_TEXT_LEN;
use idnet_messages::{ErrorResponse, MessageType, ProtocolMessage, SchemaError, SchemaRegistry};
use idnet_network::ReceivedMessage;
use idnet_types::{Height, MsgId, NodeId, RequestId};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::registry::{CallbackError, CallbackRegistry, TaskOutcome};

/// Callback run when a transaction for a request is confirmed on the ledger.
pub const TX_CONFIRMED_CALLBACK: &str = "ledger.tx_confirmed";

/// Finish hook that reports a failed inbound task back to its sender.
pub const NOTIFY_FAILURE_HOOK: &str = "inbound.notify_failure";

/// `ErrorResponse.code` for an inbound message whose handler failed.
pub const TASK_FAILED_CODE: u32 = 50_000;

/// Callback key for inbound messages of `message_type`.
pub fn inbound_callback(message_type: MessageType) -> String {
    format!("inbound.{}", message_type.as_str())
}

/// Arguments of an inbound message task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundTask {
    pub msg_id: MsgId,
    pub sender: NodeId,
    pub receiver: NodeId,
    pub via_proxy: bool,
    pub message_type: MessageType,
    pub body: Vec<u8>,
}

impl InboundTask {
    pub fn from_received(received: &ReceivedMessage) -> Result<Self, serde_json::Error> {
        Ok(Self {
            msg_id: received.msg_id.clone(),
            sender: received.sender.clone(),
            receiver: received.receiver.clone(),
            via_proxy: received.via_proxy,
            message_type: received.message.message_type(),
            body: received.message.to_json()?,
        })
    }

    /// Task source key: one per (sender, message id).
    pub fn source_key(&self) -> String {
        format!(
            "inbound:{}:{}:{}",
            self.sender.as_str().len(),
            self.sender,
            self.msg_id
        )
    }

    pub fn message(&self, schemas: &SchemaRegistry) -> Result<ProtocolMessage, SchemaError> {
        schemas.validate(self.message_type, &self.body)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Arguments of a [`TX_CONFIRMED_CALLBACK`] task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTask {
    pub request_id: RequestId,
    pub height: Height,
    pub tx_hash: String,
}

impl LedgerTask {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// The error report owed to the sender of a failed inbound task, as
/// `(recipient, reporter, message)`. Successful tasks, tasks that are not
/// inbound messages and failed error reports themselves yield `None`.
pub fn failure_report(outcome: &TaskOutcome) -> Option<(NodeId, NodeId, ProtocolMessage)> {
    let error = outcome.result.as_ref().err()?;
    let task = InboundTask::from_bytes(&outcome.args).ok()?;
    if task.message_type == MessageType::ErrorResponse {
        return None;
    }
    let mut message = error.to_string();
    if message.len() > MAX_TEXT_LEN {
        let mut end = MAX_TEXT_LEN;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
    }
    let report = ErrorResponse {
        request_id: outcome.request_id.clone(),
        reporter: task.receiver.clone(),
        code: TASK_FAILED_CODE,
        message,
    };
    Some((task.sender, task.receiver, report.into()))
}

/// Handlers that only record what arrived. Role-specific handlers replace
/// them by registering the same keys afterwards.
pub fn register_logging_handlers(registry: &mut CallbackRegistry) {
    for message_type in MessageType::ALL {
        registry.register(inbound_callback(message_type), |args: Vec<u8>| async move {
            let task = InboundTask::from_bytes(&args).map_err(|e| CallbackError::new(e.to_string()))?;
            let message = task
                .message(&SchemaRegistry::all())
                .map_err(|e| CallbackError::new(e.to_string()))?;
            info!(
                msg_id = %task.msg_id,
                sender = %task.sender,
                receiver = %task.receiver,
                via_proxy = task.via_proxy,
                message_type = %task.message_type,
                request_id = %message.request_id(),
                "inbound message handled"
            );
            Ok::<_, CallbackError>(Vec::new())
        });
    }
    registry.register(TX_CONFIRMED_CALLBACK, |args: Vec<u8>| async move {
        let task = LedgerTask::from_bytes(&args).map_err(|e| CallbackError::new(e.to_string()))?;
        info!(
            request_id = %task.request_id,
            height = task.height,
            tx_hash = %task.tx_hash,
            "transaction confirmed"
        );
        Ok::<_, CallbackError>(Vec::new())
    });
}
