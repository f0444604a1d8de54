// src/store/mod.rs
pub mod jsonl;
pub mod sheets;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::ActionError;
use crate::model::AnalyzedItem;
use crate::report::AggregateReport;

#[async_trait::async_trait]
pub trait ResultSink: Send + Sync {
    /// Persist one batch worth of results together with its report.
    async fn store(&self, results: &[AnalyzedItem], report: &AggregateReport) -> Result<(), ActionError>;
    fn name(&self) -> &'static str;
}

pub type DynSink = Arc<dyn ResultSink>;

/// Row layout shared by the sinks: one row per item, then a `SUMMARY` row.
pub fn rows(results: &[AnalyzedItem], report: &AggregateReport, now: DateTime<Utc>) -> Vec<Vec<serde_json::Value>> {
    use serde_json::json;

    let ts = now.format("%Y-%m-%d %H:%M:%S").to_string();
    let mut out = Vec::with_capacity(results.len() + 1);
    for r in results {
        let text = r
            .item
            .secondary_text
            .as_deref()
            .filter(|_| r.item.primary_text.is_empty())
            .unwrap_or(&r.item.primary_text);
        out.push(vec![
            json!(ts),
            json!(r.item.source.as_str()),
            json!(preview(text, 100)),
            json!(r.analysis.sentiment_score),
            json!(r.analysis.summary),
        ]);
    }
    let d = report.distribution;
    out.push(vec![
        json!(ts),
        json!("SUMMARY"),
        json!(format!(
            "Distribution: pos={}, neu={}, neg={}",
            d.positive, d.neutral, d.negative
        )),
        json!(report.average_sentiment),
        json!("Average sentiment score"),
    ]);
    out
}

fn preview(text: &str, max_chars: usize) -> String {
    let mut s: String = text.chars().take(max_chars).collect();
    s.push_str("...");
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AnalysisResult, CanonicalItem, Source};
    use crate::report::compute_report;
    use chrono::TimeZone;

    fn analyzed(text: &str, score: f64) -> AnalyzedItem {
        AnalyzedItem {
            item: CanonicalItem {
                id: "x".into(),
                source: Source::Reddit,
                primary_text: text.into(),
                secondary_text: None,
                score: 0,
                created_at: Utc::now(),
                replies: vec![],
                engagement_metrics: Default::default(),
                source_specific: Default::default(),
            },
            analysis: AnalysisResult::new(score, "sum"),
        }
    }

    #[test]
    fn rows_end_with_summary() {
        let results = vec![analyzed(&"a".repeat(150), 0.9), analyzed("short", 0.1)];
        let report = compute_report(&results);
        let now = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        let rows = rows(&results, &report, now);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0][0], "2025-01-02 03:04:05");
        assert_eq!(rows[0][2].as_str().unwrap().chars().count(), 103);
        assert_eq!(rows[2][1], "SUMMARY");
        assert_eq!(rows[2][2], "Distribution: pos=1, neu=0, neg=1");
    }
}
