mod proto;
mod registry;
mod worker;

pub use proto::{AddressKind, EndpointSpec, IxpAnnotation, RequestBody, Response};
pub use registry::WaitRegistry;

use std::error::Error;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use itertools::Itertools;
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{Framed, LinesCodec};

use crate::config::{SeedPolicy, ServiceConfig};
use crate::datasets::{org_to_asn, DatasetError, IxpTable, OrgTable};
use crate::store::{
    event_tag, queue_name, CacheLookup, GraphStore, Snapshot, StoreError, QUERY_STATUS_CHANNEL,
};
use crate::Asn;

/// Per-connection read deadline.
const READ_TIMEOUT: Duration = Duration::from_secs(10);
/// Per-request inference completion deadline.
const INFERENCE_TIMEOUT: Duration = Duration::from_secs(180);
/// Grace period for persisting the store on shutdown.
const SHUTDOWN_SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_REQUEST_LINE: usize = 64 * 1024;

#[derive(Debug)]
pub enum ServiceError {
    /// A processing queue holds leftover entries and no seed policy was
    /// chosen.
    QueueBusy { tag: String, pending: usize },
    Store(StoreError),
    Dataset(DatasetError),
    Io(io::Error),
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ServiceError::QueueBusy { tag, pending } => write!(
                f,
                "There are {} elements in the processing queue for {}. \
                 Run with --force to leave them there, or --reset to clear them out",
                pending, tag
            ),
            ServiceError::Store(err) => err.fmt(f),
            ServiceError::Dataset(err) => err.fmt(f),
            ServiceError::Io(err) => write!(f, "service I/O error: {}", err),
        }
    }
}

impl Error for ServiceError {}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        ServiceError::Store(err)
    }
}

impl From<DatasetError> for ServiceError {
    fn from(err: DatasetError) -> Self {
        ServiceError::Dataset(err)
    }
}

impl From<io::Error> for ServiceError {
    fn from(err: io::Error) -> Self {
        ServiceError::Io(err)
    }
}

/// Failure to turn an IP-typed endpoint into an AS number.
#[derive(Debug)]
pub struct TranslationError {
    pub addr: String,
}

impl fmt::Display for TranslationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Failed to translate '{}' to AS", self.addr)
    }
}

impl Error for TranslationError {}

/// Read-mostly state shared by every request handler: the graph store,
/// the wait registry, and the IXP/GeoIP tables loaded once at startup.
pub struct ServiceContext {
    pub store: Arc<GraphStore>,
    pub registry: WaitRegistry,
    pub ixps: Option<IxpTable>,
    pub orgs: Option<OrgTable>,
}

/// The TCP inference service: one JSON request per connection, answered
/// from the result cache or by coalescing onto an in-flight inference.
pub struct InferenceService {
    listener: TcpListener,
    ctx: Arc<ServiceContext>,
    tasks: Vec<JoinHandle<()>>,
}

impl InferenceService {
    /// Apply the queue seed policy, start the pub/sub watcher and the
    /// per-tag inference workers, and bind the listening socket.
    pub async fn bind(
        addr: SocketAddr,
        config: &ServiceConfig,
        store: Arc<GraphStore>,
        ixps: Option<IxpTable>,
        orgs: Option<OrgTable>,
    ) -> Result<Self, ServiceError> {
        for tag in &config.tags {
            let queue = match store.queue(tag) {
                Some(queue) => queue,
                None => continue,
            };
            if !queue.is_empty() {
                match config.seed_policy {
                    SeedPolicy::Force => info!(
                        "There are {} elements in the processing queue for {}. Continuing anyway.",
                        queue.len(),
                        tag
                    ),
                    SeedPolicy::Reset => {
                        info!("Clearing processing queue for {}", tag);
                        queue.reset();
                    }
                    SeedPolicy::Refuse => {
                        return Err(ServiceError::QueueBusy {
                            tag: tag.clone(),
                            pending: queue.len(),
                        })
                    }
                }
            }
        }

        let ctx = Arc::new(ServiceContext {
            store,
            registry: WaitRegistry::new(),
            ixps,
            orgs,
        });

        let mut tasks = Vec::new();
        // Subscribe before anything can publish, so no completion event
        // is missed.
        let events = ctx.store.subscribe();
        tasks.push(tokio::spawn(watch_query_results(Arc::clone(&ctx), events)));
        for tag in &config.tags {
            tasks.extend(worker::spawn_workers(&ctx, tag, config.inferrer_count));
        }

        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            ctx,
            tasks,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn context(&self) -> Arc<ServiceContext> {
        Arc::clone(&self.ctx)
    }

    /// Accept connections until `shutdown` resolves, then stop the
    /// watcher and worker tasks.
    pub async fn run<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let InferenceService {
            listener,
            ctx,
            tasks,
        } = self;
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Incoming new connection from {}", peer);
                        let ctx = Arc::clone(&ctx);
                        tokio::spawn(handle_connection(stream, ctx));
                    }
                    Err(err) => error!("Incoming connection failed: {}", err),
                },
            }
        }
        info!("Stopping inference workers");
        for task in tasks {
            task.abort();
        }
        Ok(())
    }
}

/// Load datasets, start the service on the configured port, run until
/// interrupted, and persist the store.
pub async fn serve(db_path: &Path, config: ServiceConfig) -> Result<(), ServiceError> {
    let snapshot = Snapshot::open(db_path)?;
    if snapshot.relations.is_empty() {
        warn!(
            "No AS relationships in the store; every candidate path will be \
             rejected. Run 'load asrels' first."
        );
    }

    let ixps = match &config.ixp_file {
        Some(path) => Some(IxpTable::load(path, config.metaixp_file.as_deref())?),
        None => None,
    };
    let orgs = match &config.geoip_file {
        Some(path) => {
            info!("Loading GeoIP organization table");
            Some(OrgTable::load(path)?)
        }
        None => None,
    };

    let store = Arc::new(GraphStore::new(snapshot, &config.tags));
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let service = InferenceService::bind(addr, &config, Arc::clone(&store), ixps, orgs).await?;

    info!("Starting server listening on {}", config.port);
    service
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Interrupt received; shutting down");
        })
        .await?;

    match timeout(SHUTDOWN_SNAPSHOT_TIMEOUT, store.to_snapshot()).await {
        Ok(snapshot) => snapshot.save(db_path)?,
        Err(_) => warn!("Gave up snapshotting the store after 5 seconds"),
    }
    Ok(())
}

/// Single subscriber on the completion channel; fans every event out to
/// the handlers registered for it.
async fn watch_query_results(
    ctx: Arc<ServiceContext>,
    mut events: broadcast::Receiver<String>,
) {
    debug!("Watching {} for finished inferences", QUERY_STATUS_CHANNEL);
    loop {
        match events.recv().await {
            Ok(event) => {
                ctx.registry.fire(&event);
                let (keys, waiters) = ctx.registry.status();
                debug!("Have {} handlers waiting on {} events", waiters, keys);
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("Query-status watcher lagged; {} events dropped", missed);
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn handle_connection(stream: TcpStream, ctx: Arc<ServiceContext>) {
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_REQUEST_LINE));

    let line = match timeout(READ_TIMEOUT, framed.next()).await {
        Err(_) => {
            info!("Closing timed out socket");
            return;
        }
        Ok(None) => {
            debug!("Socket closed before a request arrived");
            return;
        }
        Ok(Some(Err(err))) => {
            warn!("Socket error: {}", err);
            return;
        }
        Ok(Some(Ok(line))) => line,
    };

    let response = process_request(&ctx, &line).await;
    match serde_json::to_string(&response) {
        Ok(encoded) => {
            if let Err(err) = framed.send(encoded).await {
                warn!("Failed to send response: {}", err);
            }
        }
        Err(err) => error!("Failed to encode response: {}", err),
    }
}

async fn process_request(ctx: &ServiceContext, line: &str) -> Response {
    let data = line.trim();
    let value: serde_json::Value = match serde_json::from_str(data) {
        Ok(value) => value,
        Err(_) => {
            warn!("Received unparseable request: '{}'", data);
            return Response::error("Unparseable");
        }
    };
    if value.get("type").and_then(|t| t.as_str()) != Some("request") {
        warn!("Received malformed request: '{}'", data);
        return Response::error("Malformed");
    }
    let body: RequestBody = match serde_json::from_value(value) {
        Ok(body) => body,
        Err(_) => {
            warn!("Received malformed request: '{}'", data);
            return Response::error("Malformed Types");
        }
    };

    let src = match resolve_endpoint(ctx, &body.src) {
        Ok(asn) => asn,
        Err(err) => return Response::error(err.to_string()),
    };
    let dst = match resolve_endpoint(ctx, &body.dst) {
        Ok(asn) => asn,
        Err(err) => return Response::error(err.to_string()),
    };

    let mut response = answer(ctx, &body.tag, &src, &dst).await;
    annotate_ixps(ctx, &mut response);
    debug!("Response: {:?}", response);
    response
}

/// Answer one path query: cached value if present, otherwise join (or
/// start) the in-flight computation for this destination and wait for
/// its completion event.
async fn answer(ctx: &ServiceContext, tag: &str, src: &str, dst: &str) -> Response {
    match ctx.store.lookup_result(tag, dst, src).await {
        CacheLookup::Path(path) => return Response::success(tag, src, dst, Some(path)),
        CacheLookup::SearchedNoPath => return Response::success(tag, src, dst, None),
        CacheLookup::NotSearched => {}
    }

    let key = event_tag(tag, dst);
    let (first, completion) = ctx.registry.register(&key);
    if first {
        if ctx.store.result_exists(tag, dst).await {
            // The inference finished between the cache probe and our
            // registration; fire the key ourselves instead of scheduling.
            ctx.registry.fire(&key);
        } else {
            // We are the only waiter, so we schedule the processing.
            debug!("Requesting computation of {} from {}", key, queue_name(tag));
            let has_worker = ctx
                .store
                .queue(tag)
                .map(|queue| queue.has_listeners())
                .unwrap_or(false);
            if !has_worker {
                debug!("There is no handler for {}.", tag);
                return Response::error(format!("No handler exists for tag '{}'", tag));
            }
            if let Some(queue) = ctx.store.queue(tag) {
                queue.add(dst);
            }
        }
    } else {
        debug!("Computation for {} already requested. Waiting for result", key);
    }

    if timeout(INFERENCE_TIMEOUT, completion).await.is_err() {
        return Response::error("Inference server didn't respond in 180 seconds");
    }
    debug!("Got inferrer response with tag {}", key);

    match ctx.store.lookup_result(tag, dst, src).await {
        CacheLookup::Path(path) => Response::success(tag, src, dst, Some(path)),
        _ => Response::success(tag, src, dst, None),
    }
}

/// Resolve an endpoint to an AS number, translating IP-typed endpoints
/// through the organization table.
fn resolve_endpoint(ctx: &ServiceContext, endpoint: &EndpointSpec) -> Result<Asn, TranslationError> {
    match endpoint {
        EndpointSpec::Plain(asn) => Ok(asn.clone()),
        EndpointSpec::Typed(asn, AddressKind::As) => Ok(asn.clone()),
        EndpointSpec::Typed(addr, AddressKind::Ip) => {
            let fail = || TranslationError { addr: addr.clone() };
            let orgs = ctx.orgs.as_ref().ok_or_else(fail)?;
            let ip = addr.parse().map_err(|_| fail())?;
            let org = orgs.org_by_addr(ip).ok_or_else(fail)?;
            org_to_asn(org).ok_or_else(fail)
        }
    }
}

/// Attach IXP crossings for every adjacent pair of a returned path.
/// Purely post-hoc: the path field is never changed.
fn annotate_ixps(ctx: &ServiceContext, response: &mut Response) {
    let table = match &ctx.ixps {
        Some(table) => table,
        None => return,
    };
    if let Response::Response {
        path: Some(path),
        ixps,
        ..
    } = response
    {
        for (as1, as2) in path.split_whitespace().tuple_windows() {
            for record in table.crossings(as1, as2) {
                ixps.insert(
                    record.id.clone(),
                    IxpAnnotation {
                        as1: as1.to_string(),
                        as2: as2.to_string(),
                        confidence: record.confidence.clone(),
                    },
                );
            }
        }
    }
}
