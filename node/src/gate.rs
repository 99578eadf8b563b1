//! Ledger-Height Gate.
//!
//! A message whose expected height is above the latest confirmed height is
//! parked in the deferred store and released into the task queue by the
//! first block that reaches it. The height check, the persist of a parked
//! message and the release scan all run under one lock, so a message is
//! either parked before a block's scan or sees that block's height, never
//! both and never neither.
//!
//! Every task the gate enqueues carries its message's source key, so a
//! message released twice (a parked record whose delete failed, or an
//! inbound replay after a crash) still runs once.

use std::sync::Arc;

use idnet_network::{HandoffError, MessageSink, ReceivedMessage};
use idnet_store::{DeferredMessage, DeferredStore, StoreError};
use idnet_types::{Height, RequestId};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::metrics::NodeMetrics;
use crate::queue::{QueueError, TaskSpec, TaskSubmitter};
use crate::tasks::{inbound_callback, InboundTask};

#[derive(Debug, Error)]
pub enum GateError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("task queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("task encoding failed: {0}")]
    Encoding(String),
}

impl From<bincode::Error> for GateError {
    fn from(e: bincode::Error) -> Self {
        GateError::Encoding(e.to_string())
    }
}

impl From<serde_json::Error> for GateError {
    fn from(e: serde_json::Error) -> Self {
        GateError::Encoding(e.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateDecision {
    /// Enqueued for processing now.
    Proceed,
    /// Parked until its height arrives.
    Deferred,
    /// No handler is registered for the message type; dropped.
    Unhandled,
}

pub struct HeightGate {
    latest: Mutex<Height>,
    deferred: DeferredStore,
    submitter: Arc<dyn TaskSubmitter>,
    metrics: Arc<NodeMetrics>,
    failure_hook: Option<String>,
}

impl HeightGate {
    pub fn new(
        initial_height: Height,
        deferred: DeferredStore,
        submitter: Arc<dyn TaskSubmitter>,
        metrics: Arc<NodeMetrics>,
    ) -> Self {
        metrics.latest_height.set(initial_height as i64);
        Self {
            latest: Mutex::new(initial_height),
            deferred,
            submitter,
            metrics,
            failure_hook: None,
        }
    }

    /// Attach finish hook `key` to every task this gate enqueues.
    pub fn with_failure_hook(mut self, key: impl Into<String>) -> Self {
        self.failure_hook = Some(key.into());
        self
    }

    pub fn latest_height(&self) -> Height {
        *self.latest.lock()
    }

    pub fn deferred_count(&self) -> Result<usize, GateError> {
        Ok(self.deferred.count()?)
    }

    /// Enqueue `received` now, or park it when it depends on a height not
    /// yet seen.
    pub fn submit(&self, received: ReceivedMessage) -> Result<GateDecision, GateError> {
        let task = InboundTask::from_received(&received)?;
        let request_id = received.message.request_id().clone();

        if let Some(expected) = received.message.expected_height() {
            let latest = self.latest.lock();
            if expected > *latest {
                self.deferred.put(&DeferredMessage {
                    expected_height: expected,
                    sender: received.sender.clone(),
                    msg_id: received.msg_id.clone(),
                    raw_message: task.to_bytes()?,
                })?;
                self.metrics.deferred_messages.inc();
                debug!(
                    msg_id = %received.msg_id,
                    %request_id,
                    expected_height = expected,
                    latest_height = *latest,
                    "message deferred"
                );
                return Ok(GateDecision::Deferred);
            }
        }
        self.enqueue(&request_id, &task)
    }

    /// Raise the latest height and release every message parked for
    /// `(previous, height]`. A height at or below the current one releases
    /// nothing. Returns the number released.
    pub fn on_new_block(&self, height: Height) -> Result<usize, GateError> {
        let mut latest = self.latest.lock();
        if height <= *latest {
            debug!(height, latest_height = *latest, "stale block height ignored");
            return Ok(0);
        }
        let previous = *latest;
        let ready = self.deferred.range(previous, height)?;
        *latest = height;
        self.metrics.latest_height.set(height as i64);
        let released = self.release_all(ready);
        if released > 0 {
            info!(height, previous, released, "deferred messages released");
        }
        Ok(released)
    }

    /// Release anything parked at or below the latest height. Covers a
    /// crash between a block's scan and its deletes. Call once at startup.
    pub fn recover(&self) -> Result<usize, GateError> {
        let latest = self.latest.lock();
        let ready = self.deferred.range(0, *latest)?;
        let released = self.release_all(ready);
        let parked = self.deferred.count()?;
        self.metrics.deferred_messages.set(parked as i64);
        info!(latest_height = *latest, released, parked, "height gate recovered");
        Ok(released)
    }

    /// Caller holds the height lock.
    fn release_all(&self, ready: Vec<DeferredMessage>) -> usize {
        let mut released = 0;
        for message in ready {
            match self.release(&message) {
                Ok(()) => released += 1,
                Err(e) => {
                    // Left in the store; `recover` retries it on the next
                    // start and the queue drops it if it was enqueued.
                    error!(
                        msg_id = %message.msg_id,
                        sender = %message.sender,
                        expected_height = message.expected_height,
                        error = %e,
                        "failed to release deferred message"
                    );
                }
            }
        }
        released
    }

    fn release(&self, message: &DeferredMessage) -> Result<(), GateError> {
        match InboundTask::from_bytes(&message.raw_message) {
            Ok(task) => match task.message(&idnet_messages::SchemaRegistry::all()) {
                Ok(decoded) => {
                    self.enqueue(decoded.request_id(), &task)?;
                }
                Err(e) => warn!(msg_id = %message.msg_id, error = %e, "dropping unreadable deferred message"),
            },
            Err(e) => warn!(msg_id = %message.msg_id, error = %e, "dropping corrupt deferred message"),
        }
        self.deferred
            .delete(message.expected_height, &message.sender, &message.msg_id)?;
        self.metrics.deferred_messages.dec();
        self.metrics.deferred_released.inc();
        Ok(())
    }

    fn enqueue(&self, request_id: &RequestId, task: &InboundTask) -> Result<GateDecision, GateError> {
        let mut spec = TaskSpec::new(inbound_callback(task.message_type), task.to_bytes()?)
            .source(task.source_key());
        if let Some(hook) = &self.failure_hook {
            spec = spec.on_finish(hook.clone());
        }
        match self.submitter.enqueue(request_id, spec) {
            Ok(_) => Ok(GateDecision::Proceed),
            Err(QueueError::Duplicate(_)) => {
                debug!(msg_id = %task.msg_id, sender = %task.sender, %request_id, "message already queued or handled");
                Ok(GateDecision::Proceed)
            }
            Err(QueueError::UnknownCallback(callback)) => {
                warn!(msg_id = %task.msg_id, %request_id, %callback, "no handler for message type, dropped");
                Ok(GateDecision::Unhandled)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl MessageSink for HeightGate {
    fn deliver(&self, message: ReceivedMessage) -> Result<(), HandoffError> {
        self.submit(message)
            .map(|_| ())
            .map_err(|e| HandoffError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;
    use crate::queue::TaskQueue;
    use crate::registry::CallbackRegistry;
    use idnet_messages::{DataRequest, MessageType, ProtocolMessage};
    use idnet_nullables::{NullBackend, NullClock};
    use idnet_store::{KvBackend, TaskQueueStore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use idnet_types::{MsgId, NodeId};
    use proptest::prelude::*;

    #[derive(Default)]
    struct RecordingSubmitter {
        tasks: Mutex<Vec<(RequestId, InboundTask)>>,
        specs: Mutex<Vec<TaskSpec>>,
        refuse: std::sync::atomic::AtomicBool,
    }

    impl RecordingSubmitter {
        fn msg_ids(&self) -> Vec<String> {
            self.tasks
                .lock()
                .iter()
                .map(|(_, task)| task.msg_id.to_string())
                .collect()
        }
    }

    impl TaskSubmitter for RecordingSubmitter {
        fn enqueue(&self, request_id: &RequestId, spec: TaskSpec) -> Result<u64, QueueError> {
            if self.refuse.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(QueueError::UnknownCallback(spec.callback));
            }
            let task = InboundTask::from_bytes(&spec.args).unwrap();
            self.specs.lock().push(spec);
            let mut tasks = self.tasks.lock();
            tasks.push((request_id.clone(), task));
            Ok(tasks.len() as u64)
        }
    }

    fn gate_on(
        backend: Arc<NullBackend>,
        initial: Height,
    ) -> (Arc<HeightGate>, Arc<RecordingSubmitter>) {
        let submitter = Arc::new(RecordingSubmitter::default());
        let gate = Arc::new(HeightGate::new(
            initial,
            DeferredStore::new(backend as Arc<dyn KvBackend>, &NodeId::new("as-1")),
            submitter.clone(),
            Arc::new(NodeMetrics::new()),
        ));
        (gate, submitter)
    }

    fn received(msg_id: &str, expected_height: Option<Height>) -> ReceivedMessage {
        ReceivedMessage {
            msg_id: MsgId::new(msg_id),
            sender: NodeId::new("rp-1"),
            receiver: NodeId::new("as-1"),
            via_proxy: false,
            message: ProtocolMessage::from(DataRequest {
                request_id: RequestId::new(format!("req-{msg_id}")),
                requester: NodeId::new("rp-1"),
                service_id: "bank_statement".into(),
                request_params: "{}".into(),
                expected_height,
            }),
        }
    }

    #[test]
    fn reached_or_missing_height_proceeds() {
        let (gate, submitter) = gate_on(Arc::new(NullBackend::new()), 90);
        assert_eq!(gate.submit(received("a", Some(90))).unwrap(), GateDecision::Proceed);
        assert_eq!(gate.submit(received("b", None)).unwrap(), GateDecision::Proceed);
        assert_eq!(submitter.msg_ids(), ["a", "b"]);
        let (request_id, _) = submitter.tasks.lock()[0].clone();
        assert_eq!(request_id, RequestId::new("req-a"));
    }

    #[test]
    fn future_height_waits_for_its_block_and_runs_once() {
        let (gate, submitter) = gate_on(Arc::new(NullBackend::new()), 90);
        assert_eq!(gate.submit(received("m", Some(100))).unwrap(), GateDecision::Deferred);
        assert_eq!(gate.deferred_count().unwrap(), 1);

        assert_eq!(gate.on_new_block(99).unwrap(), 0);
        assert!(submitter.msg_ids().is_empty());

        assert_eq!(gate.on_new_block(101).unwrap(), 1);
        assert_eq!(submitter.msg_ids(), ["m"]);
        assert_eq!(gate.deferred_count().unwrap(), 0);

        assert_eq!(gate.on_new_block(101).unwrap(), 0);
        assert_eq!(gate.on_new_block(150).unwrap(), 0);
        assert_eq!(submitter.msg_ids(), ["m"]);
    }

    #[test]
    fn tasks_carry_the_message_source_and_failure_hook() {
        let submitter = Arc::new(RecordingSubmitter::default());
        let gate = HeightGate::new(
            0,
            DeferredStore::new(Arc::new(NullBackend::new()) as Arc<dyn KvBackend>, &NodeId::new("as-1")),
            submitter.clone(),
            Arc::new(NodeMetrics::new()),
        )
        .with_failure_hook("notify");
        gate.submit(received("m", None)).unwrap();

        let specs = submitter.specs.lock();
        let task = InboundTask::from_bytes(&specs[0].args).unwrap();
        assert_eq!(specs[0].source, Some(task.source_key()));
        assert_eq!(specs[0].on_finish.as_deref(), Some("notify"));
    }

    /// A gate and a real task queue whose data request handler counts runs.
    fn queued_gate_on(
        deferred: Arc<NullBackend>,
        tasks: Arc<NullBackend>,
        initial: Height,
        runs: Arc<AtomicUsize>,
    ) -> (HeightGate, Arc<TaskQueue>) {
        let mut registry = CallbackRegistry::new();
        registry.register(inbound_callback(MessageType::DataRequest), move |_| {
            let runs = runs.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(Vec::new())
            }
        });
        let registry = Arc::new(registry);
        let queue = TaskQueue::new(
            TaskQueueStore::new(tasks as Arc<dyn KvBackend>, &NodeId::new("as-1")),
            Arc::new(Dispatcher::local(registry.clone())),
            registry,
            Arc::new(NullClock::default()),
            Arc::new(NodeMetrics::new()),
        );
        let gate = HeightGate::new(
            initial,
            DeferredStore::new(deferred as Arc<dyn KvBackend>, &NodeId::new("as-1")),
            queue.clone(),
            Arc::new(NodeMetrics::new()),
        );
        (gate, queue)
    }

    #[tokio::test]
    async fn release_whose_cleanup_failed_runs_once_across_restart() {
        let deferred = Arc::new(NullBackend::new());
        let tasks = Arc::new(NullBackend::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let (gate, queue) = queued_gate_on(deferred.clone(), tasks.clone(), 10, runs.clone());
        gate.submit(received("m", Some(20))).unwrap();
        deferred.fail_writes(true);
        // Enqueued, but the parked record could not be deleted.
        assert_eq!(gate.on_new_block(20).unwrap(), 0);
        deferred.fail_writes(false);
        queue.wait_idle().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(gate.deferred_count().unwrap(), 1);
        drop(gate);

        let (gate, queue) = queued_gate_on(deferred, tasks, 20, runs.clone());
        queue.recover().unwrap();
        assert_eq!(gate.recover().unwrap(), 1);
        queue.wait_idle().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(gate.deferred_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn replayed_message_still_queued_is_not_enqueued_again() {
        let backend = Arc::new(NullBackend::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let (gate, queue) = queued_gate_on(backend.clone(), backend, 0, runs.clone());

        assert_eq!(gate.submit(received("m", None)).unwrap(), GateDecision::Proceed);
        assert_eq!(gate.submit(received("m", None)).unwrap(), GateDecision::Proceed);
        assert_eq!(queue.pending_count(&RequestId::new("req-m")), 1);
        queue.wait_idle().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stale_block_does_not_lower_height() {
        let (gate, _) = gate_on(Arc::new(NullBackend::new()), 50);
        gate.on_new_block(40).unwrap();
        assert_eq!(gate.latest_height(), 50);
    }

    #[test]
    fn parked_messages_survive_a_restart() {
        let backend = Arc::new(NullBackend::new());
        let (gate, _) = gate_on(backend.clone(), 10);
        gate.submit(received("early", Some(20))).unwrap();
        gate.submit(received("late", Some(40))).unwrap();
        drop(gate);

        // The node comes back at height 30.
        let (gate, submitter) = gate_on(backend, 30);
        assert_eq!(gate.recover().unwrap(), 1);
        assert_eq!(submitter.msg_ids(), ["early"]);
        assert_eq!(gate.deferred_count().unwrap(), 1);

        gate.on_new_block(40).unwrap();
        assert_eq!(submitter.msg_ids(), ["early", "late"]);
    }

    #[test]
    fn unhandled_type_is_dropped_not_failed() {
        let (gate, submitter) = gate_on(Arc::new(NullBackend::new()), 0);
        submitter.refuse.store(true, std::sync::atomic::Ordering::SeqCst);
        assert_eq!(gate.submit(received("x", None)).unwrap(), GateDecision::Unhandled);
    }

    #[test]
    fn failed_persist_surfaces_to_the_pipeline() {
        let backend = Arc::new(NullBackend::new());
        let (gate, _) = gate_on(backend.clone(), 0);
        backend.fail_writes(true);
        assert!(gate.deliver(received("x", Some(5))).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_blocks_and_arrivals_release_each_message_once() {
        let (gate, submitter) = gate_on(Arc::new(NullBackend::new()), 0);
        let mut handles = Vec::new();
        for i in 0..200u64 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                gate.submit(received(&format!("m{i}"), Some(i % 50 + 1))).unwrap();
            }));
        }
        for height in 1..=50u64 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                gate.on_new_block(height).unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        gate.on_new_block(50).unwrap();

        let mut ids = submitter.msg_ids();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 200);
        assert_eq!(submitter.msg_ids().len(), 200);
        assert_eq!(gate.deferred_count().unwrap(), 0);
    }

    proptest! {
        #[test]
        fn every_message_released_exactly_once_and_never_early(
            initial in 0u64..20,
            expected in proptest::collection::vec(proptest::option::of(0u64..60), 1..30),
            blocks in proptest::collection::vec(0u64..60, 0..20),
        ) {
            let (gate, submitter) = gate_on(Arc::new(NullBackend::new()), initial);
            for (i, height) in expected.iter().enumerate() {
                gate.submit(received(&format!("m{i}"), *height)).unwrap();
            }
            let mut highest = initial;
            for block in &blocks {
                gate.on_new_block(*block).unwrap();
                highest = highest.max(*block);
                for (_, task) in submitter.tasks.lock().iter() {
                    let i: usize = task.msg_id.as_str()[1..].parse().unwrap();
                    prop_assert!(expected[i].unwrap_or(0) <= highest, "{} released early", task.msg_id);
                }
            }

            let released = submitter.msg_ids();
            let mut unique = released.clone();
            unique.sort();
            unique.dedup();
            prop_assert_eq!(unique.len(), released.len());

            let due = expected.iter().filter(|h| h.unwrap_or(0) <= highest).count();
            prop_assert_eq!(released.len(), due);
            prop_assert_eq!(gate.deferred_count().unwrap(), expected.len() - due);
        }
    }
}
