// tests/common/mod.rs
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use sentiment_harvester::analyze::Analyzer;
use sentiment_harvester::model::{AnalysisResult, AnalyzedItem, Batch, BatchId, CanonicalItem, Source};
use sentiment_harvester::report::AggregateReport;
use sentiment_harvester::retry::RetryPolicy;
use sentiment_harvester::scrape::Scraper;
use sentiment_harvester::store::ResultSink;
use sentiment_harvester::ActionError;
use tokio::sync::{mpsc, Semaphore};

pub fn item(source: Source, id: &str) -> CanonicalItem {
    CanonicalItem {
        id: id.to_string(),
        source,
        primary_text: format!("text of {id}"),
        secondary_text: None,
        score: 1,
        created_at: Utc::now(),
        replies: vec![],
        engagement_metrics: Default::default(),
        source_specific: Default::default(),
    }
}

/// Batch with `n` items whose ids are `<prefix>-<i>`.
pub fn batch(source: Source, prefix: &str, n: usize) -> Batch {
    Batch::new(source, (0..n).map(|i| item(source, &format!("{prefix}-{i}"))).collect())
}

/// Millisecond backoff so failure paths stay fast on a real clock.
pub fn fast_policy(attempts: u32) -> RetryPolicy {
    RetryPolicy::default()
        .with_max_attempts(attempts)
        .with_intervals(Duration::from_millis(1), Duration::from_millis(5))
}

fn analyzed(batch: &Batch, score: f64) -> Vec<AnalyzedItem> {
    batch
        .items
        .iter()
        .map(|it| AnalyzedItem {
            item: it.clone(),
            analysis: AnalysisResult::new(score, format!("summary of {}", it.id)),
        })
        .collect()
}

/// Scores every item 0.7; optionally fails every batch of one source, and can hold
/// its first call until released.
pub struct TestAnalyzer {
    pub calls: Mutex<Vec<BatchId>>,
    pub fail_source: Option<Source>,
    /// Simulated model latency for each item of a batch.
    pub per_item_delay: Option<Duration>,
    hold_first: AtomicBool,
    release: Semaphore,
    started: Option<mpsc::UnboundedSender<BatchId>>,
}

impl TestAnalyzer {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(vec![]),
            fail_source: None,
            per_item_delay: None,
            hold_first: AtomicBool::new(false),
            release: Semaphore::new(0),
            started: None,
        }
    }

    pub fn failing_for(source: Source) -> Self {
        Self {
            fail_source: Some(source),
            ..Self::new()
        }
    }

    pub fn slow(per_item: Duration) -> Self {
        Self {
            per_item_delay: Some(per_item),
            ..Self::new()
        }
    }

    /// The first call reports on the returned channel, then blocks until `release()`.
    pub fn gated() -> (Self, mpsc::UnboundedReceiver<BatchId>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let a = Self {
            hold_first: AtomicBool::new(true),
            started: Some(tx),
            ..Self::new()
        };
        (a, rx)
    }

    pub fn release(&self) {
        self.release.add_permits(1);
    }

    pub fn calls(&self) -> Vec<BatchId> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Analyzer for TestAnalyzer {
    async fn analyze(&self, batch: &Batch) -> Result<Vec<AnalyzedItem>, ActionError> {
        self.calls.lock().unwrap().push(batch.id.clone());
        if let Some(tx) = &self.started {
            let _ = tx.send(batch.id.clone());
        }
        if self.hold_first.swap(false, Ordering::SeqCst) {
            let permit = self.release.acquire().await.unwrap();
            permit.forget();
        }
        if let Some(d) = self.per_item_delay {
            for _ in &batch.items {
                tokio::time::sleep(d).await;
            }
        }
        if Some(batch.source) == self.fail_source {
            return Err(ActionError::failed("analyzer unavailable"));
        }
        Ok(analyzed(batch, 0.7))
    }

    fn name(&self) -> &'static str {
        "test"
    }
}

/// Records each stored batch's item ids; can fail stores containing a given item id,
/// or block every call until the process "crashes".
#[derive(Default)]
pub struct RecordingSink {
    pub calls: Mutex<Vec<Vec<String>>>,
    pub reports: Mutex<Vec<AggregateReport>>,
    pub fail_item: Option<String>,
    pub hang: bool,
    pub attempts: AtomicUsize,
    started: Option<mpsc::UnboundedSender<()>>,
}

impl RecordingSink {
    pub fn failing_on(item_id: &str) -> Self {
        Self {
            fail_item: Some(item_id.to_string()),
            ..Self::default()
        }
    }

    pub fn hanging() -> (Self, mpsc::UnboundedReceiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                hang: true,
                started: Some(tx),
                ..Self::default()
            },
            rx,
        )
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn sizes(&self) -> Vec<usize> {
        self.calls().iter().map(Vec::len).collect()
    }
}

#[async_trait::async_trait]
impl ResultSink for RecordingSink {
    async fn store(&self, results: &[AnalyzedItem], report: &AggregateReport) -> Result<(), ActionError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = &self.started {
            let _ = tx.send(());
        }
        if self.hang {
            std::future::pending::<()>().await;
        }
        let ids: Vec<String> = results.iter().map(|r| r.item.id.clone()).collect();
        if self.fail_item.as_ref().is_some_and(|f| ids.contains(f)) {
            return Err(ActionError::failed("sheet is read-only"));
        }
        self.calls.lock().unwrap().push(ids);
        self.reports.lock().unwrap().push(report.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

/// Plays back scripted results, then keeps returning a fresh two-item batch.
pub struct FakeScraper {
    pub source: Source,
    pub script: Mutex<VecDeque<Result<usize, ActionError>>>,
    pub calls: AtomicUsize,
    pub always: Option<fn() -> ActionError>,
}

impl FakeScraper {
    pub fn new(source: Source) -> Self {
        Self {
            source,
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            always: None,
        }
    }

    pub fn always_failing(source: Source, err: fn() -> ActionError) -> Self {
        Self {
            always: Some(err),
            ..Self::new(source)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Scraper for FakeScraper {
    async fn scrape(&self) -> Result<Batch, ActionError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.always {
            return Err(err());
        }
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(items)) => Ok(batch(self.source, &format!("scrape{n}"), items)),
            Some(Err(e)) => Err(e),
            None => Ok(batch(self.source, &format!("scrape{n}"), 2)),
        }
    }

    fn source(&self) -> Source {
        self.source
    }
}

pub fn shared<T>(v: T) -> Arc<T> {
    Arc::new(v)
}
