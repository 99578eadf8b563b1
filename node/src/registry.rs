//! Callback registry: stable string keys to task callbacks and finish hooks.
//!
//! Task records persist the key, never the function, so a task survives a
//! restart and can be shipped to a worker that built the same registry.
//! The registry is populated at startup and read-only afterwards.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use idnet_types::RequestId;
use thiserror::Error;

use crate::dispatcher::DispatchError;

/// Error returned by a task callback.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct CallbackError(pub String);

impl CallbackError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub type CallbackFuture = Pin<Box<dyn Future<Output = Result<Vec<u8>, CallbackError>> + Send>>;

/// A task body. Receives the task's serialized arguments.
pub type Callback = Arc<dyn Fn(Vec<u8>) -> CallbackFuture + Send + Sync>;

/// What a finish hook learns about a task, wherever it ran.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskOutcome {
    pub request_id: RequestId,
    pub seq: u64,
    pub callback: String,
    /// The task's arguments, as passed to the callback.
    pub args: Vec<u8>,
    pub result: Result<Vec<u8>, DispatchError>,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Runs after a task finished, successfully or not.
pub type FinishHook = Arc<dyn Fn(&TaskOutcome) + Send + Sync>;

#[derive(Default)]
pub struct CallbackRegistry {
    callbacks: HashMap<String, Callback>,
    hooks: HashMap<String, FinishHook>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async callback under `key`, replacing any previous one.
    pub fn register<F, Fut>(&mut self, key: impl Into<String>, callback: F) -> &mut Self
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>, CallbackError>> + Send + 'static,
    {
        let callback: Callback = Arc::new(move |args| Box::pin(callback(args)));
        self.callbacks.insert(key.into(), callback);
        self
    }

    pub fn register_hook<F>(&mut self, key: impl Into<String>, hook: F) -> &mut Self
    where
        F: Fn(&TaskOutcome) + Send + Sync + 'static,
    {
        self.hooks.insert(key.into(), Arc::new(hook));
        self
    }

    pub fn callback(&self, key: &str) -> Option<Callback> {
        self.callbacks.get(key).cloned()
    }

    pub fn hook(&self, key: &str) -> Option<FinishHook> {
        self.hooks.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.callbacks.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.callbacks.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registered_callback_runs_by_key() {
        let mut registry = CallbackRegistry::new();
        registry.register("echo", |args| async move { Ok(args) });
        let callback = registry.callback("echo").unwrap();
        assert_eq!(callback(vec![7]).await, Ok(vec![7]));
        assert!(registry.callback("missing").is_none());
    }

    #[test]
    fn hooks_are_separate_from_callbacks() {
        let mut registry = CallbackRegistry::new();
        registry.register_hook("notify", |_| {});
        assert!(registry.hook("notify").is_some());
        assert!(!registry.contains("notify"));
    }
}
