use async_trait::async_trait;
use serde_json::Value;
use tabula_core::{Artifact, ArtifactHandler, Result};
use tokio::sync::mpsc;
use tracing::info;

use crate::upload::Upload;

pub const UPLOAD_COMPLETE: &str = "uploadComplete";

// A payload of the wrong shape surfaces as a serialization error.
fn upload_of(artifact: &Artifact) -> Result<Upload> {
    Ok(serde_json::from_value(artifact.payload.clone())?)
}

/// Renders uploaded rows as a plain text table
pub struct TableView {
    pub done: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl ArtifactHandler for TableView {
    async fn handle(&self, artifact: Artifact) -> Result<()> {
        if artifact.topic != UPLOAD_COMPLETE {
            return Ok(());
        }
        let Upload { headers, data: rows } = upload_of(&artifact)?;
        let cells: Vec<Vec<String>> = rows
            .iter()
            .map(|row| {
                headers
                    .iter()
                    .map(|h| match row.get(h) {
                        Some(Value::String(s)) => s.clone(),
                        None | Some(Value::Null) => String::new(),
                        Some(v) => v.to_string(),
                    })
                    .collect()
            })
            .collect();
        let widths: Vec<usize> = headers
            .iter()
            .enumerate()
            .map(|(i, h)| {
                cells
                    .iter()
                    .map(|r| r[i].len())
                    .chain(std::iter::once(h.len()))
                    .max()
                    .unwrap_or(0)
            })
            .collect();

        let line = |values: &[String]| {
            values
                .iter()
                .zip(&widths)
                .map(|(v, w)| format!("{:<w$}", v, w = *w))
                .collect::<Vec<_>>()
                .join(" | ")
        };
        let mut out = vec![line(&headers)];
        out.push(widths.iter().map(|w| "-".repeat(*w)).collect::<Vec<_>>().join("-+-"));
        out.extend(cells.iter().map(|r| line(r)));

        info!(target: "table", rows = rows.len(), from = %artifact.identity, "Rendered table");
        let _ = self.done.send(out.join("\n"));
        Ok(())
    }
}

/// Builds one graph node per column with a numeric summary
pub struct GraphView {
    pub done: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl ArtifactHandler for GraphView {
    async fn handle(&self, artifact: Artifact) -> Result<()> {
        if artifact.topic != UPLOAD_COMPLETE {
            return Ok(());
        }
        let Upload { headers, data: rows } = upload_of(&artifact)?;
        let mut nodes = Vec::with_capacity(headers.len());
        for h in &headers {
            let nums: Vec<f64> = rows.iter().filter_map(|r| r.get(h).and_then(Value::as_f64)).collect();
            let node = if nums.is_empty() {
                format!("[{h}] text")
            } else {
                let min = nums.iter().cloned().fold(f64::INFINITY, f64::min);
                let max = nums.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                format!("[{h}] n={} min={min} max={max}", nums.len())
            };
            nodes.push(node);
        }
        info!(target: "graph", nodes = nodes.len(), from = %artifact.identity, "Built column graph");
        let _ = self.done.send(nodes.join(" -> "));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tabula_core::{ArtifactFactory, Scope, TabulaError};

    fn upload_complete() -> Artifact {
        let upload = Upload::parse("name,score\nada,3\nbob,10\n").unwrap();
        ArtifactFactory::new("upload", "data", "application/json").publish(
            UPLOAD_COMPLETE,
            Scope::Load,
            serde_json::to_value(upload).unwrap(),
        )
    }

    #[tokio::test]
    async fn table_renders_header_rule_and_rows() {
        let (done, mut out) = mpsc::unbounded_channel();
        TableView { done }.handle(upload_complete()).await.unwrap();
        let table = out.recv().await.unwrap();
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(
            lines,
            vec!["name | score", "-----+------", "ada  | 3    ", "bob  | 10   "]
        );
    }

    #[tokio::test]
    async fn graph_summarises_numeric_columns() {
        let (done, mut out) = mpsc::unbounded_channel();
        GraphView { done }.handle(upload_complete()).await.unwrap();
        assert_eq!(
            out.recv().await.unwrap(),
            "[name] text -> [score] n=2 min=3 max=10"
        );
    }

    #[tokio::test]
    async fn other_topics_are_ignored() {
        let (done, mut out) = mpsc::unbounded_channel();
        let mut artifact = upload_complete();
        artifact.topic = "filter".into();
        TableView { done }.handle(artifact).await.unwrap();
        assert!(out.try_recv().is_err());
    }

    #[tokio::test]
    async fn wrong_payload_shape_is_a_serialization_error() {
        let (done, _out) = mpsc::unbounded_channel();
        let mut artifact = upload_complete();
        artifact.payload = json!({ "headers": "name" });
        let err = GraphView { done }.handle(artifact).await.unwrap_err();
        assert!(matches!(err, TabulaError::SerializationError(_)));
    }
}
