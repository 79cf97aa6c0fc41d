use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;

use aspathd::config::ServiceConfig;
use aspathd::datasets::IxpTable;
use aspathd::relations::{AsRelation, RelationRecord};
use aspathd::service::{InferenceService, ServiceContext};
use aspathd::store::{AsAttrs, GraphStore, LinkAttrs, Snapshot};

/// The p2c chain scenario: sure paths [1,2,3] and [4,3] toward 3, with
/// 1-4 peering on the side.
fn scenario_snapshot() -> Snapshot {
    let mut snapshot = Snapshot::default();
    {
        let overlay = snapshot.tags.entry("T".to_string()).or_default();
        for asn in &["1", "2", "3", "4"] {
            overlay.graph.add_as(asn, AsAttrs::default());
        }
        for (u, v) in &[("1", "2"), ("2", "3"), ("4", "3"), ("1", "4")] {
            overlay.graph.add_link(u, v, LinkAttrs::default());
        }
        let observed: Vec<String> = vec!["1".into(), "2".into(), "3".into()];
        overlay.sure_paths.insert_observed(&observed);
        let observed: Vec<String> = vec!["4".into(), "3".into()];
        overlay.sure_paths.insert_observed(&observed);
    }

    use AsRelation::*;
    let mut conflicts = Vec::new();
    for (u, v, rel) in &[
        ("1", "2", CustomerToProvider),
        ("2", "3", CustomerToProvider),
        ("4", "3", CustomerToProvider),
        ("1", "4", PeerToPeer),
    ] {
        snapshot.relations.apply(
            &RelationRecord {
                as1: u.to_string(),
                as2: v.to_string(),
                relation: *rel,
            },
            "test",
            &mut conflicts,
        );
    }
    snapshot
}

struct TestService {
    addr: SocketAddr,
    ctx: Arc<ServiceContext>,
    shutdown: Arc<Notify>,
    handle: tokio::task::JoinHandle<std::io::Result<()>>,
}

impl TestService {
    async fn start(snapshot: Snapshot, workers: usize, ixps: Option<IxpTable>) -> Self {
        let config = ServiceConfig {
            tags: vec!["T".to_string()],
            inferrer_count: workers,
            ..ServiceConfig::default()
        };
        let store = Arc::new(GraphStore::new(snapshot, &config.tags));
        let service = InferenceService::bind(
            "127.0.0.1:0".parse().unwrap(),
            &config,
            store,
            ixps,
            None,
        )
        .await
        .unwrap();
        let addr = service.local_addr().unwrap();
        let ctx = service.context();
        let shutdown = Arc::new(Notify::new());
        let signal = Arc::clone(&shutdown);
        let handle = tokio::spawn(service.run(async move { signal.notified().await }));
        Self {
            addr,
            ctx,
            shutdown,
            handle,
        }
    }

    async fn stop(self) {
        self.shutdown.notify_one();
        let _ = self.handle.await;
    }
}

async fn raw_query(addr: SocketAddr, payload: String) -> serde_json::Value {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(payload.as_bytes()).await.unwrap();
    stream.write_all(b"\n").await.unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    serde_json::from_slice(&buf).expect("service answers with one JSON line")
}

async fn query(addr: SocketAddr, tag: &str, src: &str, dst: &str) -> serde_json::Value {
    let body = json!({"type": "request", "tag": tag, "src": src, "dst": dst});
    raw_query(addr, body.to_string()).await
}

#[tokio::test]
async fn test_direct_p2c_chain() {
    let service = TestService::start(scenario_snapshot(), 1, None).await;

    let response = query(service.addr, "T", "1", "3").await;
    assert_eq!(response["type"], "response");
    assert_eq!(response["path"], "1 2 3");

    let response = query(service.addr, "T", "4", "3").await;
    assert_eq!(response["path"], "4 3");

    // Searched but no path for an unknown source.
    let response = query(service.addr, "T", "99", "3").await;
    assert_eq!(response["type"], "response");
    assert!(response["path"].is_null());

    service.stop().await;
}

#[tokio::test]
async fn test_concurrent_requests_coalesce() {
    let service = TestService::start(scenario_snapshot(), 1, None).await;

    let mut handles = Vec::new();
    for _ in 0..5 {
        let addr = service.addr;
        handles.push(tokio::spawn(
            async move { query(addr, "T", "1", "3").await },
        ));
    }
    let mut paths = Vec::new();
    for handle in handles {
        let response = handle.await.unwrap();
        assert_eq!(response["type"], "response");
        paths.push(response["path"].clone());
    }
    assert!(paths.iter().all(|p| p == &paths[0]));
    assert_eq!(paths[0], "1 2 3");

    // All five requests shared a single enqueue.
    let queue = service.ctx.store.queue("T").unwrap();
    assert_eq!(queue.total_enqueued(), 1);

    service.stop().await;
}

#[tokio::test]
async fn test_no_handler_for_tag() {
    // A service with the tag configured but no workers subscribed.
    let service = TestService::start(scenario_snapshot(), 0, None).await;

    let response = query(service.addr, "T", "1", "3").await;
    assert_eq!(response["type"], "error");
    assert_eq!(response["msg"], "No handler exists for tag 'T'");

    // Nothing must have been enqueued.
    assert_eq!(service.ctx.store.queue("T").unwrap().total_enqueued(), 0);

    let response = query(service.addr, "Z", "1", "3").await;
    assert_eq!(response["msg"], "No handler exists for tag 'Z'");

    service.stop().await;
}

#[tokio::test]
async fn test_cached_result_bypasses_queue() {
    let mut snapshot = scenario_snapshot();
    let mut paths = BTreeMap::new();
    paths.insert("1".to_string(), "1 2 3".to_string());
    snapshot.results.insert("T", "3", paths);

    // No workers: only the cache can answer.
    let service = TestService::start(snapshot, 0, None).await;

    let response = query(service.addr, "T", "1", "3").await;
    assert_eq!(response["path"], "1 2 3");

    // Searched destination, unknown source: null path, not an error.
    let response = query(service.addr, "T", "42", "3").await;
    assert_eq!(response["type"], "response");
    assert!(response["path"].is_null());

    assert_eq!(service.ctx.store.queue("T").unwrap().total_enqueued(), 0);

    service.stop().await;
}

fn write_temp(name: &str, contents: &str) -> std::path::PathBuf {
    use std::io::Write;
    let path = std::env::temp_dir().join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    path
}

#[tokio::test]
async fn test_ixp_annotation() {
    let ixp_file = write_temp("aspathd-service-test-ixps.txt", "X 2 3 high\n");
    let ixps = IxpTable::load(&ixp_file, None).unwrap();
    let service = TestService::start(scenario_snapshot(), 1, Some(ixps)).await;

    let response = query(service.addr, "T", "1", "3").await;
    assert_eq!(response["path"], "1 2 3");
    assert_eq!(
        response["ixps"]["X"],
        json!({"as1": "2", "as2": "3", "confidence": "high"})
    );

    // A path not crossing the pair gets no annotation.
    let response = query(service.addr, "T", "4", "3").await;
    assert_eq!(response["ixps"], json!({}));

    service.stop().await;
}

#[tokio::test]
async fn test_malformed_requests() {
    let service = TestService::start(scenario_snapshot(), 0, None).await;

    let response = raw_query(service.addr, "this is not json".to_string()).await;
    assert_eq!(response["type"], "error");
    assert_eq!(response["msg"], "Unparseable");

    let response = raw_query(service.addr, json!({"type": "bogus"}).to_string()).await;
    assert_eq!(response["msg"], "Malformed");

    let body = json!({
        "type": "request",
        "tag": "T",
        "src": ["10.0.0.1", "HOSTNAME"],
        "dst": "3",
    });
    let response = raw_query(service.addr, body.to_string()).await;
    assert_eq!(response["msg"], "Malformed Types");

    // IP translation without a loaded table is a translation error.
    let body = json!({
        "type": "request",
        "tag": "T",
        "src": ["10.0.0.1", "IP"],
        "dst": "3",
    });
    let response = raw_query(service.addr, body.to_string()).await;
    assert_eq!(response["msg"], "Failed to translate '10.0.0.1' to AS");

    service.stop().await;
}

#[tokio::test]
async fn test_typed_as_endpoints() {
    let service = TestService::start(scenario_snapshot(), 1, None).await;

    let body = json!({
        "type": "request",
        "tag": "T",
        "src": ["1", "AS"],
        "dst": ["3", "AS"],
    });
    let response = raw_query(service.addr, body.to_string()).await;
    assert_eq!(response["path"], "1 2 3");

    service.stop().await;
}

#[tokio::test]
async fn test_querier_pool_roundtrip() {
    use aspathd::querier::AsPathQuerier;

    let service = TestService::start(scenario_snapshot(), 1, None).await;
    let querier = AsPathQuerier::new(service.addr, 4);

    let (tx, rx) = std::sync::mpsc::channel();
    for src in &["1", "4"] {
        let tx = tx.clone();
        let for_callback = src.to_string();
        querier
            .query_by_as(
                "T",
                src,
                "3",
                Box::new(move |response| {
                    tx.send((for_callback, response)).unwrap();
                }),
            )
            .await;
    }
    querier.shutdown().await;

    let mut answers = BTreeMap::new();
    for _ in 0..2 {
        let (src, response) = rx.recv().unwrap();
        answers.insert(src, response.path().map(|p| p.to_string()));
    }
    assert_eq!(answers["1"].as_deref(), Some("1 2 3"));
    assert_eq!(answers["4"].as_deref(), Some("4 3"));

    service.stop().await;
}
