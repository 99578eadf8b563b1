//! Request Task Queue.
//!
//! One FIFO list per request id. Only the head of a list runs, and it stays
//! at the head (and in the store) until its execution has fully finished,
//! so a crash re-runs it after restart. Completion is uniform: success,
//! callback error, dispatcher error or panic all run the finish hook, drop
//! the record, clear the running marker and move on to the next task.
//!
//! A task may name its source, e.g. the inbound message it came from. A
//! source already queued, or already finished within the retention
//! window, is not enqueued again, so replaying an input after a crash
//! cannot run its work twice.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use idnet_store::{PersistedTask, StoreError, TaskQueueStore};
use idnet_types::{Clock, RequestId, Timestamp};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, error, info, warn};

use crate::dispatcher::{Dispatcher, Job};
use crate::metrics::NodeMetrics;
use crate::registry::{CallbackRegistry, TaskOutcome};

const EVENT_CAPACITY: usize = 256;

/// How long a finished source is remembered.
pub const COMPLETED_SOURCE_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("no callback registered for `{0}`")]
    UnknownCallback(String),

    #[error("no finish hook registered for `{0}`")]
    UnknownHook(String),

    #[error("task from `{0}` already queued or finished")]
    Duplicate(String),

    #[error("task queue is stopping")]
    Stopped,
}

/// What to run for a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskSpec {
    pub callback: String,
    pub args: Vec<u8>,
    pub on_finish: Option<String>,
    pub source: Option<String>,
}

impl TaskSpec {
    pub fn new(callback: impl Into<String>, args: Vec<u8>) -> Self {
        Self {
            callback: callback.into(),
            args,
            on_finish: None,
            source: None,
        }
    }

    pub fn on_finish(mut self, hook: impl Into<String>) -> Self {
        self.on_finish = Some(hook.into());
        self
    }

    /// Name the input this task came from; see [`QueueError::Duplicate`].
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Entry point for components that produce work (the height gate, ledger
/// event handling).
pub trait TaskSubmitter: Send + Sync {
    /// Returns the task's sequence number, or [`QueueError::Duplicate`]
    /// when the spec's source was seen before.
    fn enqueue(&self, request_id: &RequestId, spec: TaskSpec) -> Result<u64, QueueError>;
}

/// Queue lifecycle notifications. Delivered at most once, without
/// blocking the queue; a lagging subscriber loses events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueueEvent {
    TaskStarted { request_id: RequestId, seq: u64 },
    TaskFinished { request_id: RequestId, seq: u64, success: bool },
    QueueDrained { request_id: RequestId },
}

#[derive(Default)]
struct QueueState {
    tasks: VecDeque<PersistedTask>,
    running: bool,
}

pub struct TaskQueue {
    this: Weak<Self>,
    store: TaskQueueStore,
    queues: Mutex<HashMap<RequestId, QueueState>>,
    /// Sources of every task currently queued. Guarded by `queues`.
    queued_sources: Mutex<HashSet<String>>,
    next_seq: AtomicU64,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<CallbackRegistry>,
    events: broadcast::Sender<QueueEvent>,
    clock: Arc<dyn Clock>,
    metrics: Arc<NodeMetrics>,
    stopping: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl TaskQueue {
    pub fn new(
        store: TaskQueueStore,
        dispatcher: Arc<Dispatcher>,
        registry: Arc<CallbackRegistry>,
        clock: Arc<dyn Clock>,
        metrics: Arc<NodeMetrics>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            store,
            queues: Mutex::new(HashMap::new()),
            queued_sources: Mutex::new(HashSet::new()),
            next_seq: AtomicU64::new(0),
            dispatcher,
            registry,
            events,
            clock,
            metrics,
            stopping: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        })
    }

    /// Persist a task and append it to its request's list. Starts the task
    /// at once when the list was empty.
    pub fn enqueue(&self, request_id: &RequestId, spec: TaskSpec) -> Result<u64, QueueError> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }
        if !self.registry.contains(&spec.callback) {
            return Err(QueueError::UnknownCallback(spec.callback));
        }
        if let Some(hook) = &spec.on_finish {
            if self.registry.hook(hook).is_none() {
                return Err(QueueError::UnknownHook(hook.clone()));
            }
        }

        let (seq, start) = {
            let mut queues = self.queues.lock();
            let mut sources = self.queued_sources.lock();
            if let Some(source) = &spec.source {
                if sources.contains(source) || self.store.is_done(source)? {
                    debug!(%request_id, source = %source, "task source already seen, skipped");
                    return Err(QueueError::Duplicate(source.clone()));
                }
            }
            let task = PersistedTask {
                request_id: request_id.clone(),
                seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
                callback: spec.callback,
                args: spec.args,
                enqueued_at: self.clock.now(),
                on_finish: spec.on_finish,
                source: spec.source,
            };
            self.store.put(&task)?;
            if let Some(source) = &task.source {
                sources.insert(source.clone());
            }
            let seq = task.seq;
            let state = queues.entry(request_id.clone()).or_default();
            state.tasks.push_back(task);
            let start = state.tasks.len() == 1;
            self.metrics.active_queues.set(queues.len() as i64);
            (seq, start)
        };
        self.metrics.tasks_enqueued.inc();
        debug!(%request_id, seq, "task enqueued");
        if start {
            self.execute_head(request_id);
        }
        Ok(seq)
    }

    /// Start the head of `request_id`'s list unless a task of that request
    /// is already running.
    pub fn execute_head(&self, request_id: &RequestId) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        let task = {
            let mut queues = self.queues.lock();
            let Some(state) = queues.get_mut(request_id) else {
                return;
            };
            if state.running {
                return;
            }
            let Some(head) = state.tasks.front() else {
                return;
            };
            state.running = true;
            head.clone()
        };
        let Some(this) = self.this.upgrade() else {
            return;
        };
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            this.run(task).await;
            if this.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                this.idle.notify_waiters();
            }
        });
    }

    /// Reload every persisted queue and start each head. Call once at
    /// startup, before anything is enqueued. Returns the number of tasks
    /// restored.
    pub fn recover(&self) -> Result<usize, QueueError> {
        let cutoff = Timestamp::from_millis(
            self.clock
                .now()
                .as_millis()
                .saturating_sub(COMPLETED_SOURCE_RETENTION.as_millis() as u64),
        );
        let pruned = self.store.prune_done(cutoff)?;
        if pruned > 0 {
            debug!(pruned, "expired completed task sources");
        }
        let persisted = self.store.load_all()?;
        let mut restored = 0;
        let mut request_ids = Vec::with_capacity(persisted.len());
        {
            let mut queues = self.queues.lock();
            let mut sources = self.queued_sources.lock();
            for (request_id, tasks) in persisted {
                if let Some(last) = tasks.last() {
                    self.next_seq.fetch_max(last.seq + 1, Ordering::SeqCst);
                }
                let state = queues.entry(request_id.clone()).or_default();
                if !state.tasks.is_empty() {
                    continue;
                }
                restored += tasks.len();
                sources.extend(tasks.iter().filter_map(|t| t.source.clone()));
                state.tasks = tasks.into();
                request_ids.push(request_id);
            }
            self.metrics.active_queues.set(queues.len() as i64);
        }
        for request_id in &request_ids {
            self.execute_head(request_id);
        }
        if restored > 0 {
            info!(restored, queues = request_ids.len(), "task queues recovered");
        }
        Ok(restored)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Refuse new tasks and stop starting queued ones. Running tasks
    /// finish; everything else stays persisted.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    /// Wait until no task is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Tasks queued for `request_id`, including a running head.
    pub fn pending_count(&self, request_id: &RequestId) -> usize {
        self.queues
            .lock()
            .get(request_id)
            .map_or(0, |state| state.tasks.len())
    }

    pub fn is_running(&self, request_id: &RequestId) -> bool {
        self.queues
            .lock()
            .get(request_id)
            .is_some_and(|state| state.running)
    }

    pub fn active_queues(&self) -> usize {
        self.queues.lock().len()
    }

    async fn run(&self, task: PersistedTask) {
        let _ = self.events.send(QueueEvent::TaskStarted {
            request_id: task.request_id.clone(),
            seq: task.seq,
        });
        let started = Instant::now();
        let result = self
            .dispatcher
            .dispatch(Job {
                request_id: task.request_id.clone(),
                callback: task.callback.clone(),
                args: task.args.clone(),
            })
            .await;
        self.metrics
            .task_duration_ms
            .observe(started.elapsed().as_secs_f64() * 1000.0);

        let outcome = TaskOutcome {
            request_id: task.request_id.clone(),
            seq: task.seq,
            callback: task.callback.clone(),
            args: task.args.clone(),
            result,
        };
        match &outcome.result {
            Ok(_) => {
                self.metrics.tasks_completed.inc();
                debug!(request_id = %task.request_id, seq = task.seq, "task completed");
            }
            Err(e) => {
                self.metrics.tasks_failed.inc();
                warn!(
                    request_id = %task.request_id,
                    seq = task.seq,
                    callback = %task.callback,
                    error = %e,
                    "task failed"
                );
            }
        }
        if let Some(key) = &task.on_finish {
            self.run_hook(key, &outcome);
        }
        self.complete(&task, outcome.is_success());
    }

    fn run_hook(&self, key: &str, outcome: &TaskOutcome) {
        let Some(hook) = self.registry.hook(key) else {
            warn!(request_id = %outcome.request_id, hook = key, "finish hook not registered");
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| hook(outcome))).is_err() {
            error!(request_id = %outcome.request_id, seq = outcome.seq, hook = key, "finish hook panicked");
        }
    }

    fn complete(&self, task: &PersistedTask, success: bool) {
        if let Err(e) = self.store.finish(task, self.clock.now()) {
            error!(request_id = %task.request_id, seq = task.seq, error = %e, "failed to delete finished task");
        }
        let drained = {
            let mut queues = self.queues.lock();
            if let Some(source) = &task.source {
                self.queued_sources.lock().remove(source);
            }
            let drained = match queues.get_mut(&task.request_id) {
                Some(state) => {
                    if state.tasks.front().is_some_and(|head| head.seq == task.seq) {
                        state.tasks.pop_front();
                    }
                    state.running = false;
                    state.tasks.is_empty()
                }
                None => true,
            };
            if drained {
                queues.remove(&task.request_id);
                // Under the lock: a concurrent enqueue must not lose its record.
                if let Err(e) = self.store.delete_queue(&task.request_id) {
                    error!(request_id = %task.request_id, error = %e, "failed to delete drained queue");
                }
            }
            self.metrics.active_queues.set(queues.len() as i64);
            drained
        };

        let _ = self.events.send(QueueEvent::TaskFinished {
            request_id: task.request_id.clone(),
            seq: task.seq,
            success,
        });
        if drained {
            debug!(request_id = %task.request_id, "queue drained");
            let _ = self.events.send(QueueEvent::QueueDrained {
                request_id: task.request_id.clone(),
            });
        } else {
            self.execute_head(&task.request_id);
        }
    }
}

impl TaskSubmitter for TaskQueue {
    fn enqueue(&self, request_id: &RequestId, spec: TaskSpec) -> Result<u64, QueueError> {
        TaskQueue::enqueue(self, request_id, spec)
    }
}
