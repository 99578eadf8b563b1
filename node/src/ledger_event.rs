//! Ledger events and their routing into the gate and the task queue.
//!
//! The blockchain client is outside this crate; it only has to push
//! [`LedgerEvent`]s into the node's event channel.

use std::sync::Arc;

use idnet_types::{Height, RequestId};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::gate::HeightGate;
use crate::queue::{TaskSpec, TaskSubmitter};
use crate::tasks::{LedgerTask, TX_CONFIRMED_CALLBACK};
use crate::NodeError;

/// Channel capacity for ledger events.
pub const LEDGER_EVENT_CAPACITY: usize = 1024;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    /// A new block was committed at `height`.
    NewBlock { height: Height },
    /// A transaction for `request_id` was confirmed in the block at `height`.
    TransactionConfirmed {
        request_id: RequestId,
        height: Height,
        tx_hash: String,
    },
}

impl LedgerEvent {
    pub fn height(&self) -> Height {
        match self {
            LedgerEvent::NewBlock { height } => *height,
            LedgerEvent::TransactionConfirmed { height, .. } => *height,
        }
    }
}

pub struct LedgerEventRouter {
    gate: Arc<HeightGate>,
    submitter: Arc<dyn TaskSubmitter>,
}

impl LedgerEventRouter {
    pub fn new(gate: Arc<HeightGate>, submitter: Arc<dyn TaskSubmitter>) -> Self {
        Self { gate, submitter }
    }

    /// Every event raises the gate's height first, so messages parked for
    /// that height are queued ahead of the event's own task.
    pub fn handle(&self, event: LedgerEvent) -> Result<(), NodeError> {
        self.gate.on_new_block(event.height())?;
        match event {
            LedgerEvent::NewBlock { height } => {
                debug!(height, "new block");
            }
            LedgerEvent::TransactionConfirmed {
                request_id,
                height,
                tx_hash,
            } => {
                let args = LedgerTask {
                    request_id: request_id.clone(),
                    height,
                    tx_hash,
                }
                .to_bytes()
                .map_err(|e| NodeError::Encoding(e.to_string()))?;
                let seq = self
                    .submitter
                    .enqueue(&request_id, TaskSpec::new(TX_CONFIRMED_CALLBACK, args))?;
                debug!(%request_id, height, seq, "transaction confirmation queued");
            }
        }
        Ok(())
    }

    /// Drain `events` until the channel closes or shutdown is signalled.
    pub fn spawn(
        self: Arc<Self>,
        mut events: mpsc::Receiver<LedgerEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = shutdown.recv() => {
                        info!("ledger event pump shutting down");
                        break;
                    }
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                if let Err(e) = self.handle(event.clone()) {
                    error!(?event, error = %e, "ledger event handling failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NodeMetrics;
    use crate::queue::QueueError;
    use idnet_nullables::NullBackend;
    use idnet_store::{DeferredStore, KvBackend};
    use idnet_types::NodeId;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(RequestId, TaskSpec)>>);

    impl TaskSubmitter for Recorder {
        fn enqueue(&self, request_id: &RequestId, spec: TaskSpec) -> Result<u64, QueueError> {
            self.0.lock().push((request_id.clone(), spec));
            Ok(0)
        }
    }

    fn router() -> (Arc<LedgerEventRouter>, Arc<HeightGate>, Arc<Recorder>) {
        let backend: Arc<dyn KvBackend> = Arc::new(NullBackend::new());
        let recorder = Arc::new(Recorder::default());
        let gate = Arc::new(HeightGate::new(
            5,
            DeferredStore::new(backend, &NodeId::new("rp-1")),
            recorder.clone(),
            Arc::new(NodeMetrics::new()),
        ));
        let router = Arc::new(LedgerEventRouter::new(gate.clone(), recorder.clone()));
        (router, gate, recorder)
    }

    #[test]
    fn confirmation_raises_height_and_queues_task() {
        let (router, gate, recorder) = router();
        router
            .handle(LedgerEvent::TransactionConfirmed {
                request_id: RequestId::new("r1"),
                height: 9,
                tx_hash: "cafe".into(),
            })
            .unwrap();
        assert_eq!(gate.latest_height(), 9);

        let tasks = recorder.0.lock();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].0, RequestId::new("r1"));
        assert_eq!(tasks[0].1.callback, TX_CONFIRMED_CALLBACK);
        let task = LedgerTask::from_bytes(&tasks[0].1.args).unwrap();
        assert_eq!(task.tx_hash, "cafe");
    }

    #[tokio::test]
    async fn pump_stops_on_shutdown() {
        let (router, gate, _) = router();
        let (tx, rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = router.spawn(rx, shutdown_rx);

        tx.send(LedgerEvent::NewBlock { height: 12 }).await.unwrap();
        while gate.latest_height() != 12 {
            tokio::task::yield_now().await;
        }
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
