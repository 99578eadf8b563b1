//! Per-request task queues, owned by the Request Task Queue.
//!
//! Each task is its own record keyed `len ++ request_id ++ seq (u64 BE)`,
//! so one request's tasks scan back in submission order. A queue's
//! container is the set of records under its request prefix.
//!
//! Tasks that carry a source key leave a completion marker behind when
//! they finish, in the same batch that removes the task record. The queue
//! checks those markers to turn a replayed submission into a no-op.

use std::collections::BTreeMap;
use std::sync::Arc;

use idnet_types::{NodeId, RequestId, Timestamp};
use serde::{Deserialize, Serialize};

use crate::namespace::{compound_key, push_component, Namespace, StoreName};
use crate::{BatchOp, KvBackend, StoreError};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedTask {
    pub request_id: RequestId,
    /// Submission order within the request.
    pub seq: u64,
    /// Registry key of the callback to run.
    pub callback: String,
    pub args: Vec<u8>,
    pub enqueued_at: Timestamp,
    /// Registry key of the hook run after the callback, if any.
    pub on_finish: Option<String>,
    /// Identifies the input that produced this task, e.g. one inbound
    /// message. At most one task per source is ever executed.
    pub source: Option<String>,
}

pub struct TaskQueueStore {
    backend: Arc<dyn KvBackend>,
    ns: Namespace,
    done: Namespace,
}

impl TaskQueueStore {
    pub fn new(backend: Arc<dyn KvBackend>, node_id: &NodeId) -> Self {
        Self {
            backend,
            ns: Namespace::new(node_id, StoreName::Ops, "task_queues"),
            done: Namespace::new(node_id, StoreName::Ops, "completed_sources"),
        }
    }

    fn queue_prefix(&self, request_id: &RequestId) -> Vec<u8> {
        let mut suffix = Vec::new();
        push_component(&mut suffix, request_id.as_str());
        self.ns.key(&suffix)
    }

    fn key(&self, request_id: &RequestId, seq: u64) -> Vec<u8> {
        let mut key = self.queue_prefix(request_id);
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    fn done_key(&self, source: &str) -> Vec<u8> {
        self.done.key(&compound_key(&[source]))
    }

    pub fn put(&self, task: &PersistedTask) -> Result<(), StoreError> {
        let bytes = bincode::serialize(task)?;
        self.backend.put(&self.key(&task.request_id, task.seq), &bytes)
    }

    pub fn delete(&self, request_id: &RequestId, seq: u64) -> Result<bool, StoreError> {
        self.backend.delete(&self.key(request_id, seq))
    }

    /// Remove a finished task and, when it has a source, record the source
    /// as completed. Both writes land together or not at all.
    pub fn finish(&self, task: &PersistedTask, at: Timestamp) -> Result<(), StoreError> {
        let mut ops = vec![BatchOp::Delete {
            key: self.key(&task.request_id, task.seq),
        }];
        if let Some(source) = &task.source {
            ops.push(BatchOp::Put {
                key: self.done_key(source),
                value: bincode::serialize(&at)?,
            });
        }
        self.backend.write_batch(&ops)
    }

    /// Whether a task from `source` already ran to completion.
    pub fn is_done(&self, source: &str) -> Result<bool, StoreError> {
        Ok(self.backend.get(&self.done_key(source))?.is_some())
    }

    /// Drop completion markers recorded before `before`. Returns how many
    /// were removed.
    pub fn prune_done(&self, before: Timestamp) -> Result<usize, StoreError> {
        let mut ops = Vec::new();
        for (key, value) in self.backend.scan_prefix(self.done.prefix())? {
            let at: Timestamp = bincode::deserialize(&value)?;
            if at < before {
                ops.push(BatchOp::Delete { key });
            }
        }
        if !ops.is_empty() {
            self.backend.write_batch(&ops)?;
        }
        Ok(ops.len())
    }

    /// One request's tasks in submission order.
    pub fn load_queue(&self, request_id: &RequestId) -> Result<Vec<PersistedTask>, StoreError> {
        self.backend
            .scan_prefix(&self.queue_prefix(request_id))?
            .into_iter()
            .map(|(_, v)| bincode::deserialize(&v).map_err(StoreError::from))
            .collect()
    }

    /// Every persisted queue, each in submission order.
    pub fn load_all(&self) -> Result<BTreeMap<RequestId, Vec<PersistedTask>>, StoreError> {
        let mut queues: BTreeMap<RequestId, Vec<PersistedTask>> = BTreeMap::new();
        for (_, v) in self.backend.scan_prefix(self.ns.prefix())? {
            let task: PersistedTask = bincode::deserialize(&v)?;
            queues.entry(task.request_id.clone()).or_default().push(task);
        }
        for tasks in queues.values_mut() {
            tasks.sort_by_key(|t| t.seq);
        }
        Ok(queues)
    }

    /// Remove a request's queue container and anything left in it.
    pub fn delete_queue(&self, request_id: &RequestId) -> Result<(), StoreError> {
        let ops: Vec<BatchOp> = self
            .backend
            .scan_prefix(&self.queue_prefix(request_id))?
            .into_iter()
            .map(|(key, _)| BatchOp::Delete { key })
            .collect();
        if ops.is_empty() {
            return Ok(());
        }
        self.backend.write_batch(&ops)
    }
}
