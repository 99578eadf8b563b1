//! Worker side: connect to a coordinator and execute the jobs it sends.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt};
use idnet_types::{Timestamp, WorkerId};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::error::RpcError;
use crate::protocol::{CoordinatorFrame, InFlightJob, JobOutcome, JobRequest, WorkerFrame};

/// Runs delegated functions by name.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, function_name: &str, args: Vec<u8>) -> Result<Vec<u8>, String>;
}

pub struct WorkerClient {
    worker_id: WorkerId,
    url: String,
}

impl WorkerClient {
    /// `url` is the coordinator's worker endpoint, e.g. `ws://host:7801/workers`.
    pub fn new(worker_id: WorkerId, url: impl Into<String>) -> Self {
        Self {
            worker_id,
            url: url.into(),
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Serve jobs until the coordinator closes the connection or `shutdown`
    /// fires. Jobs already running when the connection drops still finish,
    /// but their results are lost with the connection.
    pub async fn run(
        &self,
        executor: Arc<dyn JobExecutor>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), RpcError> {
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| RpcError::Connect {
                url: self.url.clone(),
                reason: e.to_string(),
            })?;
        let (mut ws_sender, mut ws_receiver) = stream.split();

        let subscribe = WorkerFrame::Subscribe {
            worker_id: self.worker_id.clone(),
        };
        ws_sender
            .send(Message::Text(serde_json::to_string(&subscribe)?))
            .await?;
        self.await_subscribed(&mut ws_receiver).await?;
        info!(worker_id = %self.worker_id, url = %self.url, "subscribed to coordinator");

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WorkerFrame>();
        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "failed to encode worker frame");
                        continue;
                    }
                };
                if ws_sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        let result = loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<CoordinatorFrame>(&text) {
                            Ok(CoordinatorFrame::Job(job)) => {
                                self.spawn_job(job, Arc::clone(&executor), out_tx.clone());
                            }
                            Ok(other) => debug!(?other, "ignoring coordinator frame"),
                            Err(e) => warn!(error = %e, "malformed coordinator frame"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(RpcError::from(e)),
                },
                _ = shutdown.recv() => {
                    info!(worker_id = %self.worker_id, "worker shutting down");
                    break Ok(());
                }
            }
        };

        drop(out_tx);
        if result.is_err() {
            writer.abort();
        } else {
            let _ = writer.await;
        }
        result
    }

    async fn await_subscribed<S>(&self, receiver: &mut S) -> Result<(), RpcError>
    where
        S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        while let Some(msg) = receiver.next().await {
            match msg? {
                Message::Text(text) => {
                    return match serde_json::from_str::<CoordinatorFrame>(&text)? {
                        CoordinatorFrame::Subscribed { worker_id } if worker_id == self.worker_id => {
                            Ok(())
                        }
                        other => Err(RpcError::Protocol(format!(
                            "expected subscription ack, got {other:?}"
                        ))),
                    };
                }
                Message::Close(_) => return Err(RpcError::Closed),
                _ => continue,
            }
        }
        Err(RpcError::Closed)
    }

    fn spawn_job(
        &self,
        job: JobRequest,
        executor: Arc<dyn JobExecutor>,
        out: mpsc::UnboundedSender<WorkerFrame>,
    ) {
        let worker_id = self.worker_id.clone();
        tokio::spawn(async move {
            let job_id = job.correlation_id.to_string();
            if let Some(deadline) = job.metadata.give_up_deadline {
                let _ = out.send(WorkerFrame::ReportInFlightJob(InFlightJob {
                    job_id: job_id.clone(),
                    give_up_deadline: deadline,
                    worker_id: worker_id.clone(),
                    job_type: job.function_name.clone(),
                }));
            }
            let started = Timestamp::now();
            let outcome: JobOutcome = executor.execute(&job.function_name, job.args).await.into();
            debug!(
                %worker_id,
                correlation_id = %job.correlation_id,
                function = %job.function_name,
                elapsed_ms = started.elapsed_since(Timestamp::now()).as_millis() as u64,
                ok = matches!(outcome, JobOutcome::Success { .. }),
                "job finished"
            );
            let _ = out.send(WorkerFrame::ReturnResult {
                correlation_id: job.correlation_id,
                outcome,
            });
            if job.metadata.give_up_deadline.is_some() {
                let _ = out.send(WorkerFrame::InFlightJobDone { job_id });
            }
        });
    }
}
