//! Coordinator side: accepts worker connections at `/workers`.

use std::sync::Arc;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::stream::SplitStream;
use futures_util::{Sink, SinkExt, StreamExt};
use idnet_types::{CorrelationId, WorkerId};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::error::RpcError;
use crate::protocol::{CoordinatorFrame, InFlightJob, JobOutcome, JobRequest, WorkerFrame};

/// The coordinator's view of its workers.
pub trait WorkerHub: Send + Sync {
    /// A worker subscribed. Jobs sent into `jobs` are forwarded to it.
    fn connect(
        &self,
        worker_id: WorkerId,
        jobs: mpsc::UnboundedSender<JobRequest>,
    ) -> Result<(), RpcError>;

    fn on_result(&self, worker_id: &WorkerId, correlation_id: CorrelationId, outcome: JobOutcome);

    fn on_in_flight(&self, job: InFlightJob);

    fn on_in_flight_done(&self, worker_id: &WorkerId, job_id: &str);

    /// The worker's connection is gone.
    fn disconnect(&self, worker_id: &WorkerId);
}

pub fn router(hub: Arc<dyn WorkerHub>) -> Router {
    Router::new()
        .route("/workers", get(workers_handler))
        .with_state(hub)
}

/// Serve the worker endpoint until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    hub: Arc<dyn WorkerHub>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), RpcError> {
    let addr = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();
    info!(%addr, "worker endpoint listening");
    axum::serve(listener, router(hub))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await
        .map_err(|e| RpcError::Server(e.to_string()))
}

async fn workers_handler(
    ws: WebSocketUpgrade,
    State(hub): State<Arc<dyn WorkerHub>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(socket: WebSocket, hub: Arc<dyn WorkerHub>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let worker_id = match read_subscribe(&mut ws_receiver).await {
        Ok(worker_id) => worker_id,
        Err(e) => {
            warn!(error = %e, "worker handshake failed");
            return;
        }
    };

    let (jobs_tx, mut jobs_rx) = mpsc::unbounded_channel::<JobRequest>();
    if let Err(e) = hub.connect(worker_id.clone(), jobs_tx) {
        warn!(%worker_id, error = %e, "worker rejected");
        let _ = ws_sender.send(Message::Close(None)).await;
        return;
    }

    let ack = CoordinatorFrame::Subscribed {
        worker_id: worker_id.clone(),
    };
    let writer_id = worker_id.clone();
    let writer = tokio::spawn(async move {
        if send_frame(&mut ws_sender, &ack).await.is_err() {
            return;
        }
        while let Some(job) = jobs_rx.recv().await {
            let correlation_id = job.correlation_id;
            if let Err(e) = send_frame(&mut ws_sender, &CoordinatorFrame::Job(job)).await {
                warn!(worker_id = %writer_id, %correlation_id, error = %e, "failed to forward job");
                break;
            }
        }
    });

    info!(%worker_id, "worker connected");
    while let Some(msg) = ws_receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(%worker_id, error = %e, "worker socket error");
                break;
            }
        };
        match serde_json::from_str::<WorkerFrame>(&text) {
            Ok(WorkerFrame::ReturnResult {
                correlation_id,
                outcome,
            }) => hub.on_result(&worker_id, correlation_id, outcome),
            Ok(WorkerFrame::ReportInFlightJob(job)) => hub.on_in_flight(job),
            Ok(WorkerFrame::InFlightJobDone { job_id }) => {
                hub.on_in_flight_done(&worker_id, &job_id)
            }
            Ok(WorkerFrame::Subscribe { .. }) => {
                warn!(%worker_id, "ignoring repeated subscribe");
            }
            Err(e) => warn!(%worker_id, error = %e, "malformed worker frame"),
        }
    }

    writer.abort();
    hub.disconnect(&worker_id);
    info!(%worker_id, "worker disconnected");
}

async fn read_subscribe(receiver: &mut SplitStream<WebSocket>) -> Result<WorkerId, RpcError> {
    while let Some(msg) = receiver.next().await {
        match msg.map_err(|e| RpcError::WebSocket(e.to_string()))? {
            Message::Text(text) => {
                return match serde_json::from_str::<WorkerFrame>(&text)? {
                    WorkerFrame::Subscribe { worker_id } if !worker_id.is_empty() => Ok(worker_id),
                    other => Err(RpcError::Protocol(format!(
                        "expected subscribe, got {other:?}"
                    ))),
                };
            }
            Message::Close(_) => return Err(RpcError::Closed),
            _ => continue,
        }
    }
    Err(RpcError::Closed)
}

async fn send_frame<S>(sender: &mut S, frame: &CoordinatorFrame) -> Result<(), RpcError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = serde_json::to_string(frame)?;
    sender
        .send(Message::Text(text))
        .await
        .map_err(|e| RpcError::WebSocket(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{JobExecutor, WorkerClient};
    use crate::protocol::JobMetadata;
    use async_trait::async_trait;
    use idnet_types::Timestamp;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingHub {
        workers: Mutex<HashMap<WorkerId, mpsc::UnboundedSender<JobRequest>>>,
        results: Mutex<Vec<(CorrelationId, JobOutcome)>>,
        in_flight: Mutex<Vec<String>>,
        done: Mutex<Vec<String>>,
        disconnected: Mutex<Vec<WorkerId>>,
    }

    impl WorkerHub for RecordingHub {
        fn connect(
            &self,
            worker_id: WorkerId,
            jobs: mpsc::UnboundedSender<JobRequest>,
        ) -> Result<(), RpcError> {
            let mut workers = self.workers.lock();
            if workers.contains_key(&worker_id) {
                return Err(RpcError::DuplicateWorker(worker_id));
            }
            workers.insert(worker_id, jobs);
            Ok(())
        }

        fn on_result(&self, _: &WorkerId, correlation_id: CorrelationId, outcome: JobOutcome) {
            self.results.lock().push((correlation_id, outcome));
        }

        fn on_in_flight(&self, job: InFlightJob) {
            self.in_flight.lock().push(job.job_id);
        }

        fn on_in_flight_done(&self, _: &WorkerId, job_id: &str) {
            self.done.lock().push(job_id.to_string());
        }

        fn disconnect(&self, worker_id: &WorkerId) {
            self.workers.lock().remove(worker_id);
            self.disconnected.lock().push(worker_id.clone());
        }
    }

    struct Upper;

    #[async_trait]
    impl JobExecutor for Upper {
        async fn execute(&self, function_name: &str, args: Vec<u8>) -> Result<Vec<u8>, String> {
            match function_name {
                "upper" => Ok(args.to_ascii_uppercase()),
                other => Err(format!("unknown function {other}")),
            }
        }
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    async fn start() -> (Arc<RecordingHub>, String, broadcast::Sender<()>) {
        let hub = Arc::new(RecordingHub::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/workers", listener.local_addr().unwrap());
        let (stop, rx) = broadcast::channel(1);
        tokio::spawn(serve(listener, hub.clone(), rx));
        (hub, url, stop)
    }

    fn job(function_name: &str, args: &[u8], deadline: Option<Timestamp>) -> JobRequest {
        JobRequest {
            correlation_id: CorrelationId::generate(),
            function_name: function_name.into(),
            args: args.to_vec(),
            metadata: JobMetadata {
                request_id: None,
                give_up_deadline: deadline,
            },
        }
    }

    #[tokio::test]
    async fn job_round_trip_through_worker() {
        let (hub, url, _stop) = start().await;
        let (worker_stop, worker_rx) = broadcast::channel(1);
        let client = WorkerClient::new(WorkerId::new("w1"), url);
        let worker = tokio::spawn(async move { client.run(Arc::new(Upper), worker_rx).await });

        wait_for(|| hub.workers.lock().contains_key(&WorkerId::new("w1"))).await;
        let ok = job("upper", b"abc", Some(Timestamp::from_millis(u64::MAX)));
        let failing = job("missing", b"", None);
        {
            let workers = hub.workers.lock();
            let tx = &workers[&WorkerId::new("w1")];
            tx.send(ok.clone()).unwrap();
            tx.send(failing.clone()).unwrap();
        }
        wait_for(|| hub.results.lock().len() == 2).await;

        let results: HashMap<_, _> = hub.results.lock().iter().cloned().collect();
        assert_eq!(
            results[&ok.correlation_id],
            JobOutcome::Success {
                result: b"ABC".to_vec()
            }
        );
        assert!(matches!(results[&failing.correlation_id], JobOutcome::Failure { .. }));

        wait_for(|| hub.done.lock().len() == 1).await;
        assert_eq!(*hub.in_flight.lock(), vec![ok.correlation_id.to_string()]);

        worker_stop.send(()).unwrap();
        worker.await.unwrap().unwrap();
        wait_for(|| !hub.disconnected.lock().is_empty()).await;
        assert!(hub.workers.lock().is_empty());
    }

    #[tokio::test]
    async fn duplicate_worker_id_is_rejected() {
        let (hub, url, _stop) = start().await;
        let (_keep, rx1) = broadcast::channel(1);
        let first = WorkerClient::new(WorkerId::new("w1"), url.clone());
        tokio::spawn(async move { first.run(Arc::new(Upper), rx1).await });
        wait_for(|| hub.workers.lock().len() == 1).await;

        let (_keep2, rx2) = broadcast::channel(1);
        let second = WorkerClient::new(WorkerId::new("w1"), url);
        assert!(second.run(Arc::new(Upper), rx2).await.is_err());
    }
}
