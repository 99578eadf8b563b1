//! The idnet node: wires the transport, the height gate, the task queue and
//! the dispatcher around one durable backend, and owns their lifecycle.
//!
//! ```text
//! transport ─▶ InboundPipeline ─▶ HeightGate ─▶ TaskQueue ─▶ Dispatcher
//!                                     ▲              ▲          │
//! ledger events ─▶ LedgerEventRouter ─┴──────────────┘          ├─ local
//!                                                               └─ WorkerPool ─▶ workers
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use idnet_messages::{ProtocolMessage, SchemaRegistry};
use idnet_network::{
    DedupTable, FrameHandler, InboundPipeline, OnDelivered, OutboundConfig, OutboundManager,
    Transport,
};
use idnet_protocol::{CodecConfig, Keyring, NodeDirectory};
use idnet_rpc::WorkerHub;
use idnet_store::{
    DedupStore, DeferredStore, InboundRawStore, KvBackend, LogEntry, MessageLog,
    PendingSendStore, TaskQueueStore,
};
use idnet_types::{Clock, Height, KeyPair, MsgId, NodeId, RequestId};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{ExecutionMode, NodeConfig, SchedulingPolicyKind};
use crate::dispatcher::Dispatcher;
use crate::gate::HeightGate;
use crate::ledger_event::{LedgerEvent, LedgerEventRouter, LEDGER_EVENT_CAPACITY};
use crate::metrics::{serve_metrics, NodeMetrics};
use crate::queue::{QueueEvent, TaskQueue};
use crate::registry::{CallbackRegistry, TaskOutcome};
use crate::shutdown::ShutdownController;
use crate::tasks::{failure_report, NOTIFY_FAILURE_HOOK};
use crate::worker_pool::{LeastOutstanding, RoundRobin, SchedulingPolicy, WorkerPool};
use crate::NodeError;

/// How long `stop` waits for running tasks and background loops.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything the node needs from outside the config file.
pub struct NodeDeps {
    pub keys: Arc<KeyPair>,
    /// Nodes this node fronts as a proxy, with their key pairs.
    pub represented: Vec<(NodeId, Arc<KeyPair>)>,
    pub backend: Arc<dyn KvBackend>,
    pub directory: Arc<dyn NodeDirectory>,
    pub transport: Arc<dyn Transport>,
    pub clock: Arc<dyn Clock>,
    /// Latest ledger height known at startup.
    pub initial_height: Height,
}

/// Local addresses bound by [`IdentityNode::start`].
#[derive(Clone, Copy, Debug, Default)]
pub struct BoundAddrs {
    pub transport: Option<SocketAddr>,
    pub worker_rpc: Option<SocketAddr>,
    pub metrics: Option<SocketAddr>,
}

pub struct IdentityNode {
    config: NodeConfig,
    metrics: Arc<NodeMetrics>,
    shutdown: Arc<ShutdownController>,
    log: Arc<MessageLog>,
    outbound: Arc<OutboundManager>,
    inbound: Arc<InboundPipeline>,
    gate: Arc<HeightGate>,
    queue: Arc<TaskQueue>,
    pool: Option<Arc<WorkerPool>>,
    router: Arc<LedgerEventRouter>,
    ledger_tx: mpsc::Sender<LedgerEvent>,
    ledger_rx: Mutex<Option<mpsc::Receiver<LedgerEvent>>>,
    started: AtomicBool,
    bound: Mutex<BoundAddrs>,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl IdentityNode {
    pub fn new(
        config: NodeConfig,
        mut registry: CallbackRegistry,
        deps: NodeDeps,
    ) -> Result<Self, NodeError> {
        config.validate()?;
        let node_id = config.node_id.clone();
        let backend = deps.backend;
        let clock = deps.clock;
        let metrics = Arc::new(NodeMetrics::new());

        let keyring = deps
            .represented
            .into_iter()
            .fold(Keyring::new(node_id.clone(), deps.keys), |ring, (id, keys)| {
                ring.with_represented(id, keys)
            });
        let log = Arc::new(MessageLog::new(backend.clone(), &node_id));
        let outbound = OutboundManager::new(
            keyring.clone(),
            deps.directory.clone(),
            deps.transport,
            PendingSendStore::new(backend.clone(), &node_id),
            log.clone(),
            clock.clone(),
            metrics.network.clone(),
            OutboundConfig {
                retry: config.retry.policy(),
                codec: CodecConfig {
                    compression_threshold: config.compression_threshold,
                    ..CodecConfig::default()
                },
            },
        );
        if config.notify_failures {
            register_failure_notifier(&mut registry, outbound.clone());
        }
        let registry = Arc::new(registry);

        let pool = match config.mode {
            ExecutionMode::Standalone => None,
            ExecutionMode::Coordinator => {
                let policy: Box<dyn SchedulingPolicy> = match config.scheduling_policy {
                    SchedulingPolicyKind::LeastOutstanding => Box::new(LeastOutstanding),
                    SchedulingPolicyKind::RoundRobin => Box::new(RoundRobin::default()),
                };
                Some(WorkerPool::new(
                    policy,
                    config.worker_call_timeout(),
                    clock.clone(),
                    metrics.clone(),
                ))
            }
        };
        let dispatcher = match &pool {
            Some(pool) => Dispatcher::remote(pool.clone()),
            None => Dispatcher::local(registry.clone()),
        };

        let queue = TaskQueue::new(
            TaskQueueStore::new(backend.clone(), &node_id),
            Arc::new(dispatcher),
            registry,
            clock.clone(),
            metrics.clone(),
        );
        let mut gate = HeightGate::new(
            deps.initial_height,
            DeferredStore::new(backend.clone(), &node_id),
            queue.clone(),
            metrics.clone(),
        );
        if config.notify_failures {
            gate = gate.with_failure_hook(NOTIFY_FAILURE_HOOK);
        }
        let gate = Arc::new(gate);
        let router = Arc::new(LedgerEventRouter::new(gate.clone(), queue.clone()));

        let dedup = DedupTable::new(
            DedupStore::new(backend.clone(), &node_id),
            config.dedup_ttl(),
            clock.clone(),
        );
        let inbound = InboundPipeline::new(
            keyring,
            deps.directory,
            SchemaRegistry::all(),
            dedup,
            InboundRawStore::new(backend, &node_id),
            log.clone(),
            gate.clone(),
            clock,
            metrics.network.clone(),
        );

        let (ledger_tx, ledger_rx) = mpsc::channel(LEDGER_EVENT_CAPACITY);
        Ok(Self {
            config,
            metrics,
            shutdown: Arc::new(ShutdownController::new()),
            log,
            outbound,
            inbound,
            gate,
            queue,
            pool,
            router,
            ledger_tx,
            ledger_rx: Mutex::new(Some(ledger_rx)),
            started: AtomicBool::new(false),
            bound: Mutex::new(BoundAddrs::default()),
            task_handles: Mutex::new(Vec::new()),
        })
    }

    /// Recover persisted state, then start accepting work.
    ///
    /// Recovery runs bottom-up: task queues first, so anything the gate or
    /// the inbound replay enqueues lands behind the recovered tasks, then
    /// parked messages, then unprocessed inbound messages, then pending
    /// outbound sends. Listeners are bound only after that.
    pub async fn start(&self) -> Result<BoundAddrs, NodeError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(NodeError::AlreadyStarted);
        }
        info!(
            node_id = %self.config.node_id,
            mode = ?self.config.mode,
            listen_addr = %self.config.listen_addr,
            "idnet node starting"
        );

        let tasks = self.queue.recover()?;
        let released = self.gate.recover()?;
        let inbound = self.inbound.recover()?;
        let resumed = self.outbound.resume_pending()?;
        info!(
            tasks,
            released,
            replayed = inbound.replayed,
            dedup_restored = inbound.dedup_restored,
            resumed,
            latest_height = self.gate.latest_height(),
            "recovery complete"
        );

        let mut bound = BoundAddrs::default();
        let mut handles = Vec::new();

        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        bound.transport = Some(listener.local_addr()?);
        let handler: Arc<dyn FrameHandler> = self.inbound.clone();
        handles.push(tokio::spawn(idnet_network::serve(
            listener,
            handler,
            self.shutdown.subscribe(),
        )));

        if let Some(pool) = &self.pool {
            let listener = TcpListener::bind(&self.config.worker_rpc_addr).await?;
            bound.worker_rpc = Some(listener.local_addr()?);
            let hub: Arc<dyn WorkerHub> = pool.clone();
            let shutdown = self.shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                if let Err(e) = idnet_rpc::serve(listener, hub, shutdown).await {
                    error!(error = %e, "worker endpoint failed");
                }
            }));
        }

        if self.config.enable_metrics {
            let listener = TcpListener::bind(&self.config.metrics_addr).await?;
            bound.metrics = Some(listener.local_addr()?);
            let metrics = self.metrics.clone();
            let shutdown = self.shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                if let Err(e) = serve_metrics(listener, metrics, shutdown).await {
                    error!(error = %e, "metrics endpoint failed");
                }
            }));
        }

        if let Some(rx) = self.ledger_rx.lock().take() {
            handles.push(self.router.clone().spawn(rx, self.shutdown.subscribe()));
        }

        self.task_handles.lock().extend(handles);
        *self.bound.lock() = bound;
        info!(?bound, "idnet node started");
        Ok(bound)
    }

    /// Stop accepting work and let running tasks finish.
    ///
    /// Pending outbound sends, queued tasks and parked messages stay
    /// persisted for the next start.
    pub async fn stop(&self) -> Result<(), NodeError> {
        info!(node_id = %self.config.node_id, "idnet node stopping");
        self.shutdown.shutdown();
        self.outbound.shutdown();
        if let Some(pool) = &self.pool {
            pool.close();
        }
        self.queue.stop();

        let handles: Vec<JoinHandle<()>> = self.task_handles.lock().drain(..).collect();
        let wait_all = async {
            self.queue.wait_idle().await;
            self.outbound.wait_idle().await;
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, wait_all).await.is_err() {
            warn!(
                "shutdown timeout ({:?}), some tasks may still be running",
                SHUTDOWN_TIMEOUT
            );
        }
        info!(node_id = %self.config.node_id, "idnet node stopped");
        Ok(())
    }

    /// Send `message` from this node to every receiver.
    pub fn send(
        &self,
        receivers: &[NodeId],
        message: &ProtocolMessage,
        on_success: Option<OnDelivered>,
    ) -> Result<Vec<MsgId>, NodeError> {
        self.send_as(&self.config.node_id, receivers, message, on_success)
    }

    /// Send as `sender`, which must be this node or one it represents.
    pub fn send_as(
        &self,
        sender: &NodeId,
        receivers: &[NodeId],
        message: &ProtocolMessage,
        on_success: Option<OnDelivered>,
    ) -> Result<Vec<MsgId>, NodeError> {
        Ok(self.outbound.send(receivers, message, sender, on_success)?)
    }

    /// Handle a ledger event inline.
    pub fn on_ledger_event(&self, event: LedgerEvent) -> Result<(), NodeError> {
        self.router.handle(event)
    }

    /// Channel for a ledger client to push events into; drained once the
    /// node has started.
    pub fn ledger_events(&self) -> mpsc::Sender<LedgerEvent> {
        self.ledger_tx.clone()
    }

    pub fn subscribe_queue_events(&self) -> broadcast::Receiver<QueueEvent> {
        self.queue.subscribe()
    }

    /// Inbound and outbound messages logged for `request_id`, in order.
    pub fn history(&self, request_id: &RequestId) -> Result<Vec<LogEntry>, NodeError> {
        Ok(self.log.history(request_id)?)
    }

    pub fn node_id(&self) -> &NodeId {
        &self.config.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<NodeMetrics> {
        &self.metrics
    }

    pub fn shutdown_controller(&self) -> &Arc<ShutdownController> {
        &self.shutdown
    }

    pub fn inbound(&self) -> &Arc<InboundPipeline> {
        &self.inbound
    }

    pub fn outbound(&self) -> &Arc<OutboundManager> {
        &self.outbound
    }

    pub fn gate(&self) -> &Arc<HeightGate> {
        &self.gate
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn worker_pool(&self) -> Option<&Arc<WorkerPool>> {
        self.pool.as_ref()
    }

    pub fn bound_addrs(&self) -> BoundAddrs {
        *self.bound.lock()
    }
}

/// Report failed inbound tasks to whoever sent the message.
fn register_failure_notifier(registry: &mut CallbackRegistry, outbound: Arc<OutboundManager>) {
    registry.register_hook(NOTIFY_FAILURE_HOOK, move |outcome: &TaskOutcome| {
        let Some((recipient, reporter, report)) = failure_report(outcome) else {
            return;
        };
        match outbound.send(std::slice::from_ref(&recipient), &report, &reporter, None) {
            Ok(_) => info!(
                request_id = %outcome.request_id,
                %recipient,
                callback = %outcome.callback,
                "task failure reported to sender"
            ),
            Err(e) => warn!(
                request_id = %outcome.request_id,
                %recipient,
                error = %e,
                "failed to report task failure"
            ),
        }
    });
}
