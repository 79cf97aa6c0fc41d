use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use log::{debug, info};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{Framed, LinesCodec};

use crate::service::{AddressKind, EndpointSpec, Response};

/// Worker-pool size when the caller has no opinion.
pub const DEFAULT_MAX_OUTSTANDING: usize = 20;

/// How long a worker waits for the service's reply.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(180);

/// Invoked with the decoded response, or with a synthesized error record
/// when anything went wrong on the way.
pub type QueryCallback = Box<dyn FnOnce(Response) + Send + Sync + 'static>;

struct Job {
    tag: String,
    src: EndpointSpec,
    dst: EndpointSpec,
    callback: QueryCallback,
}

/// Client-side pool for issuing path queries against a running
/// inference service. `max_outstanding` workers share a bounded job
/// queue, so enqueueing blocks once they are all busy; each request uses
/// a fresh connection.
pub struct AsPathQuerier {
    jobs: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl AsPathQuerier {
    pub fn new(server: SocketAddr, max_outstanding: usize) -> Self {
        let max_outstanding = max_outstanding.max(1);
        let (jobs, rx) = mpsc::channel(max_outstanding);
        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..max_outstanding)
            .map(|id| {
                let rx = Arc::clone(&rx);
                tokio::spawn(async move { run_worker(server, rx, id).await })
            })
            .collect();
        Self { jobs, workers }
    }

    /// Enqueue a query with fully formed endpoints.
    pub async fn query_mixed(
        &self,
        tag: &str,
        src: EndpointSpec,
        dst: EndpointSpec,
        callback: QueryCallback,
    ) {
        let job = Job {
            tag: tag.to_string(),
            src,
            dst,
            callback,
        };
        // The queue going away mid-shutdown still runs the callback.
        if let Err(err) = self.jobs.send(job).await {
            let job = err.0;
            (job.callback)(Response::error("Querier is shut down"));
        }
    }

    /// Query with both endpoints given as AS numbers.
    pub async fn query_by_as(&self, tag: &str, src: &str, dst: &str, callback: QueryCallback) {
        self.query_mixed(
            tag,
            EndpointSpec::Typed(src.to_string(), AddressKind::As),
            EndpointSpec::Typed(dst.to_string(), AddressKind::As),
            callback,
        )
        .await
    }

    /// Query with both endpoints given as IP addresses.
    pub async fn query_by_ip(&self, tag: &str, src: &str, dst: &str, callback: QueryCallback) {
        self.query_mixed(
            tag,
            EndpointSpec::Typed(src.to_string(), AddressKind::Ip),
            EndpointSpec::Typed(dst.to_string(), AddressKind::Ip),
            callback,
        )
        .await
    }

    /// Close the queue and wait for the workers to drain it; outstanding
    /// callbacks still run.
    pub async fn shutdown(self) {
        drop(self.jobs);
        info!("Waiting for querier workers to clear the queue and exit");
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

async fn run_worker(server: SocketAddr, jobs: Arc<Mutex<mpsc::Receiver<Job>>>, id: usize) {
    debug!("Querier worker {} started", id);
    loop {
        // Hold the receiver lock only while waiting for the next job, so
        // the pool processes up to its size concurrently.
        let job = { jobs.lock().await.recv().await };
        let job = match job {
            Some(job) => job,
            None => {
                debug!("Querier worker {} shutting down", id);
                return;
            }
        };
        let response = perform(server, &job)
            .await
            .unwrap_or_else(|msg| Response::error(msg));
        (job.callback)(response);
    }
}

async fn perform(server: SocketAddr, job: &Job) -> Result<Response, String> {
    let stream = TcpStream::connect(server)
        .await
        .map_err(|err| err.to_string())?;
    let mut framed = Framed::new(stream, LinesCodec::new());

    let request = serde_json::json!({
        "type": "request",
        "tag": &job.tag,
        "src": &job.src,
        "dst": &job.dst,
    });
    framed
        .send(request.to_string())
        .await
        .map_err(|err| err.to_string())?;

    let line = match timeout(RESPONSE_TIMEOUT, framed.next()).await {
        Err(_) => return Err("Inference server didn't respond in 180 seconds".to_string()),
        Ok(None) => return Err("Connection closed without a response".to_string()),
        Ok(Some(Err(err))) => return Err(err.to_string()),
        Ok(Some(Ok(line))) => line,
    };
    serde_json::from_str(&line).map_err(|_| format!("Failed to read response '{}'", line))
}
