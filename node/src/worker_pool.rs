//! Coordinator-side pool of connected workers.
//!
//! Each remote call gets a correlation id and waits on a oneshot channel
//! until the worker returns a result, the call times out, or the worker
//! disconnects. A lost worker's calls fail with
//! [`DispatchError::WorkerLost`] and are not reassigned.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use idnet_rpc::{InFlightJob, JobMetadata, JobOutcome, JobRequest, RpcError, WorkerHub};
use idnet_types::{Clock, CorrelationId, WorkerId};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::dispatcher::{DispatchError, Job};
use crate::metrics::NodeMetrics;

/// A connected worker as seen by a [`SchedulingPolicy`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerLoad {
    pub worker_id: WorkerId,
    pub outstanding: usize,
}

/// Picks the worker for the next call. `workers` is sorted by worker id.
pub trait SchedulingPolicy: Send + Sync {
    fn select(&self, workers: &[WorkerLoad]) -> Option<WorkerId>;
}

/// Fewest outstanding calls; ties go to the lowest worker id.
#[derive(Debug, Default)]
pub struct LeastOutstanding;

impl SchedulingPolicy for LeastOutstanding {
    fn select(&self, workers: &[WorkerLoad]) -> Option<WorkerId> {
        workers
            .iter()
            .min_by_key(|w| w.outstanding)
            .map(|w| w.worker_id.clone())
    }
}

#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl SchedulingPolicy for RoundRobin {
    fn select(&self, workers: &[WorkerLoad]) -> Option<WorkerId> {
        if workers.is_empty() {
            return None;
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % workers.len();
        Some(workers[i].worker_id.clone())
    }
}

struct WorkerEntry {
    jobs: mpsc::UnboundedSender<JobRequest>,
    outstanding: HashSet<CorrelationId>,
}

struct PendingCall {
    worker_id: WorkerId,
    reply: oneshot::Sender<Result<Vec<u8>, DispatchError>>,
}

pub struct WorkerPool {
    workers: Mutex<BTreeMap<WorkerId, WorkerEntry>>,
    calls: Mutex<HashMap<CorrelationId, PendingCall>>,
    in_flight: Mutex<HashMap<String, InFlightJob>>,
    policy: Box<dyn SchedulingPolicy>,
    call_timeout: Duration,
    clock: Arc<dyn Clock>,
    metrics: Arc<NodeMetrics>,
    closed: AtomicBool,
}

impl WorkerPool {
    pub fn new(
        policy: Box<dyn SchedulingPolicy>,
        call_timeout: Duration,
        clock: Arc<dyn Clock>,
        metrics: Arc<NodeMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            workers: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            policy,
            call_timeout,
            clock,
            metrics,
            closed: AtomicBool::new(false),
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn outstanding(&self) -> usize {
        self.calls.lock().len()
    }

    /// Jobs workers reported as in progress.
    pub fn in_flight_jobs(&self) -> Vec<InFlightJob> {
        self.in_flight.lock().values().cloned().collect()
    }

    /// Refuse new delegations. Calls already sent still complete.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Run `job` on a worker and wait for its result.
    ///
    /// A `pinned` worker is used when it is connected; otherwise the
    /// scheduling policy decides. Fails at once when no worker is
    /// connected.
    pub async fn call(
        &self,
        job: Job,
        pinned: Option<&WorkerId>,
    ) -> Result<Vec<u8>, DispatchError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DispatchError::ShuttingDown);
        }
        let correlation_id = CorrelationId::generate();
        let (reply_tx, reply_rx) = oneshot::channel();
        let worker_id = {
            let mut workers = self.workers.lock();
            if workers.is_empty() {
                return Err(DispatchError::NoWorkers);
            }
            let worker_id = match pinned {
                Some(id) if workers.contains_key(id) => id.clone(),
                _ => {
                    let loads: Vec<WorkerLoad> = workers
                        .iter()
                        .map(|(id, entry)| WorkerLoad {
                            worker_id: id.clone(),
                            outstanding: entry.outstanding.len(),
                        })
                        .collect();
                    self.policy.select(&loads).ok_or(DispatchError::NoWorkers)?
                }
            };
            let Some(entry) = workers.get_mut(&worker_id) else {
                return Err(DispatchError::NoWorkers);
            };
            let request = JobRequest {
                correlation_id,
                function_name: job.callback.clone(),
                args: job.args,
                metadata: JobMetadata {
                    request_id: Some(job.request_id.clone()),
                    give_up_deadline: Some(self.clock.now().saturating_add(self.call_timeout)),
                },
            };
            self.metrics.outstanding_jobs.inc();
            self.calls.lock().insert(
                correlation_id,
                PendingCall {
                    worker_id: worker_id.clone(),
                    reply: reply_tx,
                },
            );
            if entry.jobs.send(request).is_err() {
                self.calls.lock().remove(&correlation_id);
                self.metrics.outstanding_jobs.dec();
                return Err(DispatchError::WorkerLost(worker_id));
            }
            entry.outstanding.insert(correlation_id);
            worker_id
        };
        debug!(
            %worker_id,
            %correlation_id,
            request_id = %job.request_id,
            callback = %job.callback,
            "job delegated"
        );

        match tokio::time::timeout(self.call_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DispatchError::WorkerLost(worker_id)),
            Err(_) => {
                if self.take_call(&correlation_id).is_some() {
                    warn!(%worker_id, %correlation_id, "remote call timed out");
                }
                Err(DispatchError::Timeout(self.call_timeout))
            }
        }
    }

    /// Remove a pending call and its worker bookkeeping.
    fn take_call(&self, correlation_id: &CorrelationId) -> Option<PendingCall> {
        let call = self.calls.lock().remove(correlation_id)?;
        if let Some(entry) = self.workers.lock().get_mut(&call.worker_id) {
            entry.outstanding.remove(correlation_id);
        }
        self.metrics.outstanding_jobs.dec();
        Some(call)
    }
}

impl WorkerHub for WorkerPool {
    fn connect(
        &self,
        worker_id: WorkerId,
        jobs: mpsc::UnboundedSender<JobRequest>,
    ) -> Result<(), RpcError> {
        let mut workers = self.workers.lock();
        if workers.contains_key(&worker_id) {
            return Err(RpcError::DuplicateWorker(worker_id));
        }
        workers.insert(
            worker_id.clone(),
            WorkerEntry {
                jobs,
                outstanding: HashSet::new(),
            },
        );
        self.metrics.connected_workers.set(workers.len() as i64);
        info!(%worker_id, workers = workers.len(), "worker joined pool");
        Ok(())
    }

    fn on_result(&self, worker_id: &WorkerId, correlation_id: CorrelationId, outcome: JobOutcome) {
        let Some(call) = self.take_call(&correlation_id) else {
            debug!(%worker_id, %correlation_id, "result for unknown or expired call");
            return;
        };
        if &call.worker_id != worker_id {
            warn!(
                %worker_id,
                expected = %call.worker_id,
                %correlation_id,
                "result returned by a different worker"
            );
        }
        let result = outcome.into_result().map_err(DispatchError::Callback);
        let _ = call.reply.send(result);
    }

    fn on_in_flight(&self, job: InFlightJob) {
        debug!(worker_id = %job.worker_id, job_id = %job.job_id, job_type = %job.job_type, "job in flight");
        self.in_flight.lock().insert(job.job_id.clone(), job);
    }

    fn on_in_flight_done(&self, _worker_id: &WorkerId, job_id: &str) {
        self.in_flight.lock().remove(job_id);
    }

    fn disconnect(&self, worker_id: &WorkerId) {
        let entry = {
            let mut workers = self.workers.lock();
            let entry = workers.remove(worker_id);
            self.metrics.connected_workers.set(workers.len() as i64);
            entry
        };
        let Some(entry) = entry else {
            return;
        };

        let mut lost = 0;
        for correlation_id in entry.outstanding {
            if let Some(call) = self.calls.lock().remove(&correlation_id) {
                self.metrics.outstanding_jobs.dec();
                let _ = call.reply.send(Err(DispatchError::WorkerLost(worker_id.clone())));
                lost += 1;
            }
        }

        let mut in_flight = self.in_flight.lock();
        let orphaned: Vec<String> = in_flight
            .values()
            .filter(|job| &job.worker_id == worker_id)
            .map(|job| job.job_id.clone())
            .collect();
        for job_id in &orphaned {
            in_flight.remove(job_id);
        }
        drop(in_flight);

        if lost > 0 || !orphaned.is_empty() {
            warn!(%worker_id, lost, orphaned = ?orphaned, "worker left with jobs outstanding");
        } else {
            info!(%worker_id, "worker left pool");
        }
    }
}
