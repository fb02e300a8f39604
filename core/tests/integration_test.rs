// Core Integration Tests
// End-to-end flow: upload → broker → table + graph
//
// Three components share the "data" channel. The upload component publishes a
// parsed CSV; the table and graph components each see it exactly once and the
// upload component never sees its own artifact.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tabula_core::telemetry::init_test_tracing;
use tabula_core::{Artifact, ArtifactHandler, BrokerConfig, Result, Scope, Tabula};
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};

/// Component that records every artifact delivered to it
struct Recorder {
    received: Arc<Mutex<Vec<Artifact>>>,
}

#[async_trait]
impl ArtifactHandler for Recorder {
    async fn handle(&self, artifact: Artifact) -> Result<()> {
        self.received.lock().await.push(artifact);
        Ok(())
    }
}

fn recorder() -> (Arc<Recorder>, Arc<Mutex<Vec<Artifact>>>) {
    let received = Arc::new(Mutex::new(Vec::new()));
    (
        Arc::new(Recorder {
            received: Arc::clone(&received),
        }),
        received,
    )
}

#[tokio::test]
async fn test_upload_reaches_table_and_graph() {
    init_test_tracing();
    let tabula = Tabula::new(BrokerConfig::default()).await.unwrap();

    let (upload_rec, upload_seen) = recorder();
    let (table_rec, table_seen) = recorder();
    let (graph_rec, graph_seen) = recorder();

    let upload = tabula
        .messaging
        .subscribe_with("upload", "data", upload_rec)
        .unwrap();
    let _table = tabula
        .messaging
        .subscribe_with("table", "data", table_rec)
        .unwrap();
    let _graph = tabula
        .messaging
        .subscribe_with("graph", "data", graph_rec)
        .unwrap();

    let payload = json!({
        "headers": ["a", "b"],
        "data": [{"a": 1, "b": 2}],
    });
    let artifact = upload
        .factory()
        .publish("uploadComplete", Scope::Load, payload.clone());
    upload.publish_validated(artifact).unwrap();

    // Give the broker time to fan out
    sleep(Duration::from_millis(200)).await;

    for seen in [&table_seen, &graph_seen] {
        let seen = seen.lock().await;
        assert_eq!(seen.len(), 1, "exactly one delivery");
        assert_eq!(seen[0].topic, "uploadComplete");
        assert_eq!(seen[0].payload, payload);
        assert_eq!(seen[0].identity, "upload");
    }
    assert!(upload_seen.lock().await.is_empty(), "no echo to upload");

    let snapshot = tabula.shutdown().await.unwrap();
    assert_eq!(
        snapshot.channels["data"],
        vec!["graph".to_string(), "table".to_string(), "upload".to_string()]
    );
}

#[tokio::test]
async fn test_table_created_after_upload_still_gets_data() {
    init_test_tracing();
    let tabula = Tabula::new(BrokerConfig::default()).await.unwrap();

    // upload registers on its own command channel and posts data before
    // anyone listens on "data"
    let upload = tabula.messaging.subscribe("upload", "command").unwrap();
    let artifact = Artifact::create(
        "upload",
        "data",
        "uploadComplete",
        "application/json",
        tabula_core::Role::Publisher,
        Scope::Load,
        json!({"headers": ["x"], "data": [{"x": 3}]}),
    );
    upload.publish_validated(artifact).unwrap();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(tabula.broker.snapshot().await.unwrap().pending_depth("data"), 1);

    let (table_rec, table_seen) = recorder();
    let _table = tabula
        .messaging
        .subscribe_with("table", "data", table_rec)
        .unwrap();
    sleep(Duration::from_millis(100)).await;

    let seen = table_seen.lock().await;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].payload["data"][0]["x"], json!(3));
    drop(seen);
    tabula.shutdown().await.unwrap();
}
