//! Execution Dispatcher.
//!
//! Runs a task's callback either in this process ([`LocalExecutor`]) or on
//! a connected worker ([`RemoteExecutor`]). Both report through the same
//! `Result<Vec<u8>, DispatchError>`, so the task queue's completion path
//! cannot tell where a task ran.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use idnet_types::{RequestId, WorkerId};
use thiserror::Error;
use tracing::{debug, Instrument};

use crate::registry::CallbackRegistry;
use crate::worker_pool::WorkerPool;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("no callback registered for `{0}`")]
    UnknownCallback(String),

    #[error("callback failed: {0}")]
    Callback(String),

    #[error("callback panicked: {0}")]
    Panicked(String),

    #[error("no workers connected")]
    NoWorkers,

    #[error("worker {0} disconnected before returning a result")]
    WorkerLost(WorkerId),

    #[error("no result within {0:?}")]
    Timeout(Duration),

    #[error("dispatcher is shutting down")]
    ShuttingDown,
}

/// One unit of work handed to an executor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Job {
    pub request_id: RequestId,
    /// Callback registry key.
    pub callback: String,
    pub args: Vec<u8>,
}

#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, job: Job) -> Result<Vec<u8>, DispatchError>;
}

/// Runs callbacks from the registry on the local runtime.
pub struct LocalExecutor {
    registry: Arc<CallbackRegistry>,
}

impl LocalExecutor {
    pub fn new(registry: Arc<CallbackRegistry>) -> Self {
        Self { registry }
    }

    async fn run(&self, callback: &str, args: Vec<u8>) -> Result<Vec<u8>, DispatchError> {
        let body = self
            .registry
            .callback(callback)
            .ok_or_else(|| DispatchError::UnknownCallback(callback.to_string()))?;
        // Own task, so a panicking callback surfaces as a JoinError.
        match tokio::spawn(async move { body(args).await }).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(DispatchError::Callback(e.0)),
            Err(e) if e.is_panic() => Err(DispatchError::Panicked(panic_message(e.into_panic()))),
            Err(_) => Err(DispatchError::Callback("task cancelled".into())),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn execute(&self, job: Job) -> Result<Vec<u8>, DispatchError> {
        self.run(&job.callback, job.args).await
    }
}

/// Worker-process side: the same registry serves delegated jobs.
#[async_trait]
impl idnet_rpc::JobExecutor for LocalExecutor {
    async fn execute(&self, function_name: &str, args: Vec<u8>) -> Result<Vec<u8>, String> {
        self.run(function_name, args).await.map_err(|e| match e {
            DispatchError::Callback(message) => message,
            other => other.to_string(),
        })
    }
}

/// Delegates to the worker pool, optionally pinned to one worker.
pub struct RemoteExecutor {
    pool: Arc<WorkerPool>,
    pinned: Option<WorkerId>,
}

impl RemoteExecutor {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self { pool, pinned: None }
    }

    /// Prefer `worker` whenever it is connected.
    pub fn pinned_to(pool: Arc<WorkerPool>, worker: WorkerId) -> Self {
        Self {
            pool,
            pinned: Some(worker),
        }
    }
}

#[async_trait]
impl Executor for RemoteExecutor {
    async fn execute(&self, job: Job) -> Result<Vec<u8>, DispatchError> {
        self.pool.call(job, self.pinned.as_ref()).await
    }
}

pub struct Dispatcher {
    executor: Arc<dyn Executor>,
}

impl Dispatcher {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }

    pub fn local(registry: Arc<CallbackRegistry>) -> Self {
        Self::new(Arc::new(LocalExecutor::new(registry)))
    }

    pub fn remote(pool: Arc<WorkerPool>) -> Self {
        Self::new(Arc::new(RemoteExecutor::new(pool)))
    }

    pub async fn dispatch(&self, job: Job) -> Result<Vec<u8>, DispatchError> {
        let span = tracing::debug_span!(
            "dispatch",
            request_id = %job.request_id,
            callback = %job.callback
        );
        async {
            let result = self.executor.execute(job).await;
            if let Err(e) = &result {
                debug!(error = %e, "task failed");
            }
            result
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::CallbackError;

    fn registry() -> Arc<CallbackRegistry> {
        let mut registry = CallbackRegistry::new();
        registry
            .register("double", |args: Vec<u8>| async move {
                Ok(args.iter().map(|b| b * 2).collect())
            })
            .register("fail", |_| async { Err(CallbackError::new("boom")) })
            .register("panic", |args: Vec<u8>| async move {
                if !args.is_empty() {
                    panic!("kaboom");
                }
                Ok(args)
            });
        Arc::new(registry)
    }

    fn job(callback: &str) -> Job {
        Job {
            request_id: RequestId::new("r1"),
            callback: callback.into(),
            args: vec![1, 2],
        }
    }

    #[tokio::test]
    async fn local_results_and_errors() {
        let dispatcher = Dispatcher::local(registry());
        assert_eq!(dispatcher.dispatch(job("double")).await, Ok(vec![2, 4]));
        assert_eq!(
            dispatcher.dispatch(job("fail")).await,
            Err(DispatchError::Callback("boom".into()))
        );
        assert_eq!(
            dispatcher.dispatch(job("nope")).await,
            Err(DispatchError::UnknownCallback("nope".into()))
        );
    }

    #[tokio::test]
    async fn panicking_callback_becomes_an_error() {
        let dispatcher = Dispatcher::local(registry());
        assert_eq!(
            dispatcher.dispatch(job("panic")).await,
            Err(DispatchError::Panicked("kaboom".into()))
        );
    }

    #[tokio::test]
    async fn worker_side_reports_callback_message_verbatim() {
        let executor = LocalExecutor::new(registry());
        let result = idnet_rpc::JobExecutor::execute(&executor, "fail", vec![]).await;
        assert_eq!(result, Err("boom".to_string()));
    }
}
