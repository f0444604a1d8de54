// src/scrape/mod.rs
pub mod reddit;
pub mod twitter;

use crate::error::ActionError;
use crate::model::{Batch, Source};

/// Fetches the current content of one source as a canonical batch.
///
/// Quota rejections must be reported as `ActionError::RateLimited` so the
/// rate-limit-aware policy can tell them apart from other failures.
#[async_trait::async_trait]
pub trait Scraper: Send + Sync {
    async fn scrape(&self) -> Result<Batch, ActionError>;
    fn source(&self) -> Source;
}

/// Map an HTTP status to the scrape failure taxonomy.
pub(crate) fn classify_status(source: Source, status: reqwest::StatusCode) -> ActionError {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        ActionError::RateLimited(format!("{source} returned 429"))
    } else {
        ActionError::failed(format!("{source} returned HTTP {status}"))
    }
}
