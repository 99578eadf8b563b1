//! Outbound Send Manager.
//!
//! Fans a message out to its receivers. Each send gets its own message id,
//! a persisted pending record and a retry loop that runs until the
//! receiver acknowledges or the retry ceiling passes. An abandoned send is
//! dropped and counted; nothing else is notified. Pending records left by
//! a crash are resumed at startup with fresh backoff, keeping their
//! original start time for the ceiling.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use idnet_messages::ProtocolMessage;
use idnet_protocol::codec::{self, CodecConfig};
use idnet_protocol::{seal, Keyring, NodeDirectory};
use idnet_store::{Direction, LogEntry, MessageLog, PendingOutboundMessage, PendingSendStore};
use idnet_types::{Clock, MsgId, NodeId};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::backoff::RetryPolicy;
use crate::frame::WireFrame;
use crate::metrics::NetworkMetrics;
use crate::transport::Transport;
use crate::SendError;

/// What `on_success` learns about a completed delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub msg_id: MsgId,
    pub receiver: NodeId,
    pub address: String,
    pub attempts: u32,
    pub elapsed: Duration,
}

pub type OnDelivered = Arc<dyn Fn(Delivery) + Send + Sync>;

#[derive(Clone, Debug, Default)]
pub struct OutboundConfig {
    pub retry: RetryPolicy,
    pub codec: CodecConfig,
}

pub struct OutboundManager {
    keyring: Keyring,
    directory: Arc<dyn NodeDirectory>,
    transport: Arc<dyn Transport>,
    pending: PendingSendStore,
    log: Arc<MessageLog>,
    clock: Arc<dyn Clock>,
    metrics: Arc<NetworkMetrics>,
    config: OutboundConfig,
    shutdown: watch::Sender<bool>,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl OutboundManager {
    /// `pending` and `log` must live on the same backend; a send commits
    /// to both in one batch.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        keyring: Keyring,
        directory: Arc<dyn NodeDirectory>,
        transport: Arc<dyn Transport>,
        pending: PendingSendStore,
        log: Arc<MessageLog>,
        clock: Arc<dyn Clock>,
        metrics: Arc<NetworkMetrics>,
        config: OutboundConfig,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            keyring,
            directory,
            transport,
            pending,
            log,
            clock,
            metrics,
            config,
            shutdown,
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        })
    }

    /// Send `message` as `sender` to every receiver.
    ///
    /// All receivers are resolved and sealed, and every pending record and
    /// log entry is committed in one batch, before anything is dispatched.
    /// A lookup or write failure sends nothing and leaves nothing behind.
    /// Returns one message id per receiver, in order.
    pub fn send(
        self: &Arc<Self>,
        receivers: &[NodeId],
        message: &ProtocolMessage,
        sender: &NodeId,
        on_success: Option<OnDelivered>,
    ) -> Result<Vec<MsgId>, SendError> {
        if *self.shutdown.borrow() {
            return Err(SendError::ShuttingDown);
        }
        let keys = self
            .keyring
            .get(sender)
            .ok_or_else(|| SendError::UnknownSender(sender.clone()))?;
        let encoded = codec::encode(message, &self.config.codec)?;
        let body = message
            .to_json()
            .map_err(|e| SendError::Codec(idnet_protocol::CodecError::Serialize(e.to_string())))?;

        let now = self.clock.now();
        let mut prepared = Vec::with_capacity(receivers.len());
        for receiver in receivers {
            let (route, address) = self.directory.route(receiver)?;
            let sealed = seal(&encoded, &route, sender, keys)?;
            prepared.push(PendingOutboundMessage {
                msg_id: MsgId::generate(),
                sender: sender.clone(),
                receiver: receiver.clone(),
                destination_address: address,
                payload: sealed.to_bytes()?,
                send_start_time: now,
            });
        }

        let entries: Vec<LogEntry> = prepared
            .iter()
            .map(|pending| LogEntry {
                direction: Direction::Outbound,
                message_type: message.message_type().as_str().to_string(),
                request_id: message.request_id().clone(),
                peer: pending.receiver.clone(),
                msg_id: pending.msg_id.clone(),
                body: body.clone(),
                logged_at: now,
            })
            .collect();
        self.log
            .append_with(&entries, self.pending.put_ops(&prepared)?)?;

        let mut ids = Vec::with_capacity(prepared.len());
        for pending in prepared {
            debug!(
                msg_id = %pending.msg_id,
                receiver = %pending.receiver,
                request_id = %message.request_id(),
                "outbound send started"
            );
            ids.push(pending.msg_id.clone());
            self.spawn_delivery(pending, on_success.clone());
        }
        Ok(ids)
    }

    /// Resume every persisted send. Returns how many were resumed; sends
    /// already past their ceiling are abandoned instead.
    pub fn resume_pending(self: &Arc<Self>) -> Result<usize, SendError> {
        let now = self.clock.now();
        let mut resumed = 0;
        for pending in self.pending.all()? {
            if pending.send_start_time.elapsed_since(now) >= self.config.retry.max_elapsed {
                warn!(
                    msg_id = %pending.msg_id,
                    receiver = %pending.receiver,
                    "pending send expired while stopped, abandoning"
                );
                self.pending.delete(&pending.msg_id)?;
                self.metrics.outbound_abandoned.inc();
                continue;
            }
            self.spawn_delivery(pending, None);
            resumed += 1;
        }
        if resumed > 0 {
            info!(resumed, "resumed pending outbound sends");
        }
        Ok(resumed)
    }

    /// Stop scheduling retries. Attempts already on the wire finish; their
    /// records stay persisted for the next start.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until no delivery loop is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn spawn_delivery(
        self: &Arc<Self>,
        pending: PendingOutboundMessage,
        on_success: Option<OnDelivered>,
    ) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.metrics.outbound_pending.inc();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.deliver(pending, on_success).await;
            this.metrics.outbound_pending.dec();
            if this.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                this.idle.notify_waiters();
            }
        });
    }

    async fn deliver(&self, pending: PendingOutboundMessage, on_success: Option<OnDelivered>) {
        let mut backoff = self.config.retry.backoff();
        let mut shutdown = self.shutdown.subscribe();
        let mut attempts = 0u32;
        loop {
            if *shutdown.borrow() {
                debug!(msg_id = %pending.msg_id, "shutdown, leaving send pending");
                return;
            }
            attempts += 1;
            let frame = WireFrame {
                sender: pending.sender.clone(),
                msg_id: pending.msg_id.clone(),
                payload: pending.payload.clone(),
            };
            let error = match self.transport.send(&pending.destination_address, frame).await {
                Ok(()) => {
                    self.complete(&pending, attempts, on_success.as_ref());
                    return;
                }
                Err(e) => e,
            };

            let elapsed = pending.send_start_time.elapsed_since(self.clock.now());
            let Some(delay) = backoff.next_delay(elapsed) else {
                warn!(
                    msg_id = %pending.msg_id,
                    receiver = %pending.receiver,
                    attempts,
                    error = %error,
                    "retry ceiling reached, abandoning send"
                );
                if let Err(e) = self.pending.delete(&pending.msg_id) {
                    warn!(msg_id = %pending.msg_id, error = %e, "failed to drop abandoned send");
                }
                self.metrics.outbound_abandoned.inc();
                return;
            };
            debug!(
                msg_id = %pending.msg_id,
                attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "delivery failed, retrying"
            );
            self.metrics.outbound_retries.inc();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    fn complete(
        &self,
        pending: &PendingOutboundMessage,
        attempts: u32,
        on_success: Option<&OnDelivered>,
    ) {
        if let Err(e) = self.pending.delete(&pending.msg_id) {
            warn!(msg_id = %pending.msg_id, error = %e, "failed to drop delivered send");
        }
        self.metrics.outbound_delivered.inc();
        debug!(msg_id = %pending.msg_id, receiver = %pending.receiver, attempts, "delivered");
        if let Some(callback) = on_success {
            callback(Delivery {
                msg_id: pending.msg_id.clone(),
                receiver: pending.receiver.clone(),
                address: pending.destination_address.clone(),
                attempts,
                elapsed: pending.send_start_time.elapsed_since(self.clock.now()),
            });
        }
    }
}
