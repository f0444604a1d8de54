// src/store/jsonl.rs
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use super::{rows, ResultSink};
use crate::error::ActionError;
use crate::model::AnalyzedItem;
use crate::report::AggregateReport;

/// Local fallback sink: the same rows as the sheet, one JSON array per line.
/// A batch is written with a single `write_all` so a reader never sees half a batch
/// unless the process dies mid-write.
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ResultSink for JsonlSink {
    async fn store(&self, results: &[AnalyzedItem], report: &AggregateReport) -> Result<(), ActionError> {
        let mut buf = String::new();
        for row in rows(results, report, Utc::now()) {
            buf.push_str(&serde_json::to_string(&row).context("serializing row")?);
            buf.push('\n');
        }
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening {}", self.path.display()))?;
        f.write_all(buf.as_bytes())
            .await
            .with_context(|| format!("appending to {}", self.path.display()))?;
        f.flush().await.context("flushing results file")?;
        tracing::debug!(target: "store", sink = "jsonl", path = %self.path.display(), rows = results.len() + 1, "rows appended");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "jsonl"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AnalysisResult, CanonicalItem, Source};
    use crate::report::compute_report;

    #[tokio::test]
    async fn appends_item_rows_and_summary() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlSink::new(dir.path().join("out/results.jsonl"));
        let results = vec![AnalyzedItem {
            item: CanonicalItem {
                id: "1".into(),
                source: Source::Twitter,
                primary_text: "hello".into(),
                secondary_text: None,
                score: 0,
                created_at: Utc::now(),
                replies: vec![],
                engagement_metrics: Default::default(),
                source_specific: Default::default(),
            },
            analysis: AnalysisResult::new(0.7, "upbeat"),
        }];
        let report = compute_report(&results);
        sink.store(&results, &report).await.unwrap();
        sink.store(&results, &report).await.unwrap();

        let text = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<serde_json::Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0][1], "twitter");
        assert_eq!(lines[1][1], "SUMMARY");
    }
}
