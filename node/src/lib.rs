//! idnet node: scheduling core and wiring.
//!
//! The node:
//! - Holds messages that refer to a ledger height it has not seen yet
//! - Runs work for one request strictly in order, one task at a time
//! - Persists queued work so it survives a restart
//! - Runs tasks in-process or delegates them to connected workers
//! - Owns the lifecycle of the transport managers from `idnet-network`

pub mod config;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod gate;
pub mod ledger_event;
pub mod logging;
pub mod metrics;
pub mod node;
pub mod queue;
pub mod registry;
pub mod shutdown;
pub mod tasks;
pub mod worker_pool;

pub use config::{ExecutionMode, NodeConfig, PeerConfig, RetryConfig, SchedulingPolicyKind};
pub use directory::StaticDirectory;
pub use dispatcher::{DispatchError, Dispatcher, Executor, Job, LocalExecutor, RemoteExecutor};
pub use error::NodeError;
pub use gate::{GateDecision, GateError, HeightGate};
pub use ledger_event::{LedgerEvent, LedgerEventRouter};
pub use logging::{init_logging, LogFormat};
pub use metrics::{serve_metrics, NodeMetrics};
pub use node::{BoundAddrs, IdentityNode, NodeDeps};
pub use queue::{
    QueueError, QueueEvent, TaskQueue, TaskSpec, TaskSubmitter, COMPLETED_SOURCE_RETENTION,
};
pub use registry::{CallbackError, CallbackRegistry, FinishHook, TaskOutcome};
pub use shutdown::ShutdownController;
pub use tasks::{
    failure_report, inbound_callback, register_logging_handlers, InboundTask, LedgerTask,
    NOTIFY_FAILURE_HOOK, TASK_FAILED_CODE, TX_CONFIRMED_CALLBACK,
};
pub use worker_pool::{LeastOutstanding, RoundRobin, SchedulingPolicy, WorkerLoad, WorkerPool};
