// src/model.rs
//! Canonical records flowing through the pipeline.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Top-N replies kept per item.
pub const MAX_REPLIES: usize = 5;

/// Author sentinel when the platform no longer knows who wrote a reply.
pub const DELETED_AUTHOR: &str = "[deleted]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Reddit,
    Twitter,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Reddit => "reddit",
            Source::Twitter => "twitter",
        }
    }

    /// Sources whose API enforces request quotas get the rate-limit-aware retry policy.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Source::Twitter)
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub id: String,
    pub body: String,
    pub author: String,
    pub score: i64,
    pub created_at: DateTime<Utc>,
}

/// One unit of scraped content. Never mutated after the producer built it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalItem {
    pub id: String,
    pub source: Source,
    pub primary_text: String,
    pub secondary_text: Option<String>,
    pub score: i64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub replies: Vec<Reply>,
    #[serde(default)]
    pub engagement_metrics: BTreeMap<String, i64>,
    #[serde(default)]
    pub source_specific: serde_json::Map<String, serde_json::Value>,
}

impl CanonicalItem {
    /// System-wide identity of the item.
    pub fn key(&self) -> (Source, &str) {
        (self.source, self.id.as_str())
    }

    /// Keep replies within the `MAX_REPLIES` bound, preserving source order.
    pub fn with_replies(mut self, replies: impl IntoIterator<Item = Reply>) -> Self {
        self.replies = replies.into_iter().take(MAX_REPLIES).collect();
        self
    }

    pub fn metric(&self, name: &str) -> i64 {
        self.engagement_metrics.get(name).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub String);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Items collected by one producer invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub source: Source,
    pub collected_at: DateTime<Utc>,
    pub items: Vec<CanonicalItem>,
}

impl Batch {
    pub fn new(source: Source, items: Vec<CanonicalItem>) -> Self {
        Self {
            id: BatchId(format!("{source}-{}", uuid::Uuid::new_v4())),
            source,
            collected_at: Utc::now(),
            items,
        }
    }

    pub fn empty(source: Source) -> Self {
        Self::new(source, Vec::new())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// 0 = extremely negative, 0.5 = neutral, 1 = extremely positive.
    pub sentiment_score: f64,
    pub summary: String,
    #[serde(default)]
    pub reasoning: BTreeMap<String, String>,
}

impl AnalysisResult {
    pub fn new(sentiment_score: f64, summary: impl Into<String>) -> Self {
        let score = if sentiment_score.is_finite() {
            sentiment_score.clamp(0.0, 1.0)
        } else {
            0.5
        };
        Self {
            sentiment_score: score,
            summary: summary.into(),
            reasoning: BTreeMap::new(),
        }
    }

    pub fn with_reasoning(mut self, key: &str, value: impl Into<String>) -> Self {
        self.reasoning.insert(key.to_string(), value.into());
        self
    }
}

/// A copy of the original item paired with its analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzedItem {
    pub item: CanonicalItem,
    pub analysis: AnalysisResult,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str) -> CanonicalItem {
        CanonicalItem {
            id: id.into(),
            source: Source::Reddit,
            primary_text: "title".into(),
            secondary_text: None,
            score: 1,
            created_at: Utc::now(),
            replies: vec![],
            engagement_metrics: BTreeMap::new(),
            source_specific: serde_json::Map::new(),
        }
    }

    #[test]
    fn replies_are_capped_in_source_order() {
        let replies = (0..8).map(|i| Reply {
            id: format!("r{i}"),
            body: "b".into(),
            author: DELETED_AUTHOR.into(),
            score: i,
            created_at: Utc::now(),
        });
        let it = item("a").with_replies(replies);
        assert_eq!(it.replies.len(), MAX_REPLIES);
        assert_eq!(it.replies[0].id, "r0");
        assert_eq!(it.replies[4].id, "r4");
    }

    #[test]
    fn analysis_score_is_clamped() {
        assert_eq!(AnalysisResult::new(1.7, "x").sentiment_score, 1.0);
        assert_eq!(AnalysisResult::new(-0.2, "x").sentiment_score, 0.0);
        assert_eq!(AnalysisResult::new(f64::NAN, "x").sentiment_score, 0.5);
    }

    #[test]
    fn batch_ids_are_unique_and_prefixed() {
        let a = Batch::new(Source::Twitter, vec![item("1")]);
        let b = Batch::new(Source::Twitter, vec![item("1")]);
        assert_ne!(a.id, b.id);
        assert!(a.id.0.starts_with("twitter-"));
        assert_eq!(a.len(), 1);
    }
}
