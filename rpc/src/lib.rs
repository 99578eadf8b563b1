//! Worker delegation over a persistent WebSocket per worker.
//!
//! A worker connects to the coordinator's `/workers` endpoint, subscribes
//! with its id and then receives jobs on the same channel. Results travel
//! back tagged with the job's correlation id. Workers may also tell the
//! coordinator which jobs they are working on and until when.

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;

pub use client::{JobExecutor, WorkerClient};
pub use error::RpcError;
pub use protocol::{CoordinatorFrame, InFlightJob, JobMetadata, JobOutcome, JobRequest, WorkerFrame};
pub use server::{router, serve, WorkerHub};
