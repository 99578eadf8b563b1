//! JSON frames exchanged between coordinator and worker.
//!
//! Binary arguments and results travel hex-encoded inside the JSON text
//! frames.

use idnet_types::{CorrelationId, RequestId, Timestamp, WorkerId};
use serde::{Deserialize, Serialize};

/// Coordinator to worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorFrame {
    /// The subscription was accepted; jobs follow.
    Subscribed { worker_id: WorkerId },
    Job(JobRequest),
}

/// Worker to coordinator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerFrame {
    /// First frame on a connection.
    Subscribe { worker_id: WorkerId },
    ReturnResult {
        correlation_id: CorrelationId,
        outcome: JobOutcome,
    },
    ReportInFlightJob(InFlightJob),
    InFlightJobDone { job_id: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub correlation_id: CorrelationId,
    /// Callback registry key.
    pub function_name: String,
    #[serde(with = "hex_bytes")]
    pub args: Vec<u8>,
    pub metadata: JobMetadata,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMetadata {
    pub request_id: Option<RequestId>,
    /// The coordinator stops waiting for a result after this.
    pub give_up_deadline: Option<Timestamp>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Success {
        #[serde(with = "hex_bytes")]
        result: Vec<u8>,
    },
    Failure { error: String },
}

impl JobOutcome {
    pub fn into_result(self) -> Result<Vec<u8>, String> {
        match self {
            JobOutcome::Success { result } => Ok(result),
            JobOutcome::Failure { error } => Err(error),
        }
    }
}

impl From<Result<Vec<u8>, String>> for JobOutcome {
    fn from(result: Result<Vec<u8>, String>) -> Self {
        match result {
            Ok(result) => JobOutcome::Success { result },
            Err(error) => JobOutcome::Failure { error },
        }
    }
}

/// "Working on this, don't reassign it before the deadline."
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InFlightJob {
    pub job_id: String,
    pub give_up_deadline: Timestamp,
    pub worker_id: WorkerId,
    pub job_type: String,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}
