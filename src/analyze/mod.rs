// src/analyze/mod.rs
//! Analyze action: score and summarize every item of a batch.

pub mod ai_adapter;
pub mod prompt;

use std::sync::Arc;

use crate::error::ActionError;
use crate::model::{AnalyzedItem, Batch};

pub use ai_adapter::{build_analyzer, MockAnalyzer, OpenAiAnalyzer};

/// Pairs each item of the batch with its analysis, in batch order. The input items are
/// copied, never mutated. Failing any item fails the whole batch.
#[async_trait::async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, batch: &Batch) -> Result<Vec<AnalyzedItem>, ActionError>;
    fn name(&self) -> &'static str;
}

pub type DynAnalyzer = Arc<dyn Analyzer>;
