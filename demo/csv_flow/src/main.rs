mod components;
mod upload;

use std::path::PathBuf;
use std::sync::Arc;

use components::{GraphView, TableView, UPLOAD_COMPLETE};
use tabula_core::telemetry::init_tracing;
use tabula_core::{BrokerConfig, Scope, Tabula};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing::{error, info};
use upload::Upload;

const SAMPLE: &str = "city,population,area\nOslo,709037,454\nBergen,289330,465\nTrondheim,212660,342\n";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration (defaults + env + optional TOML overlay)
    let cfg = BrokerConfig::load();
    init_tracing(&cfg);

    info!(target: "csv_flow", "Starting CSV flow demo: upload → broker → table + graph");

    let tabula = Tabula::new(cfg).await?;

    let (table_tx, mut table_rx) = mpsc::unbounded_channel();
    let (graph_tx, mut graph_rx) = mpsc::unbounded_channel();

    // 1) Consumers register first, like widgets mounted before the upload form
    let _table = tabula
        .messaging
        .subscribe_with("table", "data", Arc::new(TableView { done: table_tx }))?;
    let _graph = tabula
        .messaging
        .subscribe_with("graph", "data", Arc::new(GraphView { done: graph_tx }))?;

    // 2) Upload parses the CSV and publishes it
    let upload_sub = tabula.messaging.subscribe("upload", "data")?;
    let parsed = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => {
            info!(target: "csv_flow", path = %path.display(), "Reading CSV");
            Upload::from_path(&path)?
        }
        None => {
            info!(target: "csv_flow", "No CSV path given; using built-in sample");
            Upload::parse(SAMPLE)?
        }
    };
    let artifact = upload_sub.factory().publish(
        UPLOAD_COMPLETE,
        Scope::Load,
        serde_json::to_value(&parsed)?,
    );
    if let Err(e) = upload_sub.publish_validated(artifact) {
        error!(target: "csv_flow", error = %e, "Upload could not be published");
        return Err(e.into());
    }

    // 3) Wait for both views
    let wait = Duration::from_secs(5);
    let table = timeout(wait, table_rx.recv()).await?.unwrap_or_default();
    let graph = timeout(wait, graph_rx.recv()).await?.unwrap_or_default();
    println!("{table}\n\n{graph}");

    let snapshot = tabula.shutdown().await?;
    info!(target: "csv_flow", snapshot = %serde_json::to_string(&snapshot)?, "Broker stopped");
    Ok(())
}
