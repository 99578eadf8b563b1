//! Inbound Receive Pipeline.
//!
//! Receipt (synchronous with the transport): deduplicate on
//! `(sender, msg_id)`, persist the raw frame, acknowledge. Processing
//! (spawned, after the ack): open and verify the sealed layers, decode,
//! schema-validate, append to the audit log and hand the message to the
//! [`MessageSink`]. Integrity failures discard the message for good.
//!
//! The raw frame stays persisted until the hand-off succeeded or the
//! message was rejected, so [`InboundPipeline::recover`] can replay
//! anything a crash interrupted.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use idnet_messages::{ProtocolMessage, SchemaRegistry};
use idnet_protocol::{codec, open_layers, EncryptedEnvelope, Keyring, NodeDirectory};
use idnet_store::{Direction, InboundRawStore, LogEntry, MessageLog, RawInbound};
use idnet_types::{Clock, MsgId, NodeId};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::dedup::DedupTable;
use crate::frame::WireFrame;
use crate::metrics::NetworkMetrics;
use crate::transport::FrameHandler;
use crate::ReceiveError;

/// A message that passed every inbound check.
#[derive(Clone, Debug, PartialEq)]
pub struct ReceivedMessage {
    pub msg_id: MsgId,
    pub sender: NodeId,
    /// This node, or the node it represents as a proxy.
    pub receiver: NodeId,
    pub via_proxy: bool,
    pub message: ProtocolMessage,
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandoffError(pub String);

/// Next stage after validation (the ledger-height gate).
pub trait MessageSink: Send + Sync {
    fn deliver(&self, message: ReceivedMessage) -> Result<(), HandoffError>;
}

pub struct InboundPipeline {
    this: Weak<Self>,
    keyring: Keyring,
    directory: Arc<dyn NodeDirectory>,
    schemas: SchemaRegistry,
    dedup: Arc<DedupTable>,
    raw: InboundRawStore,
    log: Arc<MessageLog>,
    sink: Arc<dyn MessageSink>,
    clock: Arc<dyn Clock>,
    metrics: Arc<NetworkMetrics>,
}

/// Counts from [`InboundPipeline::recover`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub dedup_restored: usize,
    pub dedup_expired: usize,
    pub replayed: usize,
}

impl InboundPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        keyring: Keyring,
        directory: Arc<dyn NodeDirectory>,
        schemas: SchemaRegistry,
        dedup: Arc<DedupTable>,
        raw: InboundRawStore,
        log: Arc<MessageLog>,
        sink: Arc<dyn MessageSink>,
        clock: Arc<dyn Clock>,
        metrics: Arc<NetworkMetrics>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            keyring,
            directory,
            schemas,
            dedup,
            raw,
            log,
            sink,
            clock,
            metrics,
        })
    }

    /// Receipt half of the pipeline. `Ok` means the frame may be
    /// acknowledged: it is either a duplicate or durably stored.
    pub fn receive(&self, frame: WireFrame) -> Result<(), ReceiveError> {
        if !self.dedup.try_insert(&frame.sender, &frame.msg_id)? {
            self.metrics.inbound_duplicates.inc();
            debug!(sender = %frame.sender, msg_id = %frame.msg_id, "duplicate dropped");
            return Ok(());
        }

        let raw = RawInbound {
            sender: frame.sender,
            msg_id: frame.msg_id,
            bytes: frame.payload,
            received_at: self.clock.now(),
        };
        if let Err(e) = self.raw.put(&raw) {
            // Not acknowledged, so the sender will redeliver; let it through.
            self.dedup.forget(&raw.sender, &raw.msg_id);
            return Err(e.into());
        }
        self.metrics.inbound_received.inc();

        if let Some(this) = self.this.upgrade() {
            tokio::spawn(async move { this.process(raw) });
        }
        Ok(())
    }

    /// Reload dedup entries and replay unprocessed raw messages in receipt
    /// order. Call once at startup, before the transport accepts frames.
    pub fn recover(&self) -> Result<RecoveryStats, ReceiveError> {
        let (dedup_restored, dedup_expired) = self.dedup.restore()?;
        let pending = self.raw.all()?;
        let replayed = pending.len();
        for raw in pending {
            self.process(raw);
        }
        let stats = RecoveryStats {
            dedup_restored,
            dedup_expired,
            replayed,
        };
        info!(?stats, "inbound pipeline recovered");
        Ok(stats)
    }

    fn process(&self, raw: RawInbound) {
        match self.validate(&raw) {
            Ok(received) => {
                if let Err(e) = self.append_log(&received) {
                    error!(
                        msg_id = %raw.msg_id,
                        error = %e,
                        "audit log write failed, message kept for replay"
                    );
                    return;
                }
                let request_id = received.message.request_id().clone();
                if let Err(e) = self.sink.deliver(received) {
                    error!(
                        msg_id = %raw.msg_id,
                        request_id = %request_id,
                        error = %e,
                        "hand-off failed, message kept for replay"
                    );
                    return;
                }
                debug!(
                    sender = %raw.sender,
                    msg_id = %raw.msg_id,
                    request_id = %request_id,
                    "inbound message accepted"
                );
            }
            Err(e) => {
                self.metrics.inbound_rejected.inc();
                warn!(
                    sender = %raw.sender,
                    msg_id = %raw.msg_id,
                    integrity = e.is_integrity(),
                    error = %e,
                    "inbound message rejected"
                );
            }
        }
        if let Err(e) = self.raw.delete(&raw.sender, &raw.msg_id) {
            warn!(msg_id = %raw.msg_id, error = %e, "failed to drop processed raw message");
        }
    }

    fn validate(&self, raw: &RawInbound) -> Result<ReceivedMessage, ReceiveError> {
        let sealed = EncryptedEnvelope::from_bytes(&raw.bytes)
            .map_err(|e| ReceiveError::Undecodable(e.to_string()))?;
        let opened = open_layers(&sealed, &self.keyring, &raw.sender, self.directory.as_ref())?;
        let message = codec::decode(&opened.envelope.encoded(), &self.schemas)?;
        Ok(ReceivedMessage {
            msg_id: raw.msg_id.clone(),
            sender: opened.sender,
            receiver: opened.receiver,
            via_proxy: opened.via_proxy,
            message,
        })
    }

    fn append_log(&self, received: &ReceivedMessage) -> Result<(), ReceiveError> {
        let body = received
            .message
            .to_json()
            .map_err(|e| ReceiveError::Handoff(e.to_string()))?;
        self.log.append(&LogEntry {
            direction: Direction::Inbound,
            message_type: received.message.message_type().as_str().to_string(),
            request_id: received.message.request_id().clone(),
            peer: received.sender.clone(),
            msg_id: received.msg_id.clone(),
            body,
            logged_at: self.clock.now(),
        })?;
        Ok(())
    }
}

#[async_trait]
impl FrameHandler for InboundPipeline {
    async fn on_frame(&self, frame: WireFrame) -> Result<(), ReceiveError> {
        self.receive(frame)
    }
}
