//! # Aggregator
//! The single consumer of every producer's batches.
//!
//! Its mailbox is durable task state: signals are journaled by the runtime before a
//! producer's `deliver` returns, and the drain protocol journals which batches a pass
//! owns, the analysis of the in-flight batch and every per-batch outcome. After a crash
//! the next pass resumes the recorded drain without re-analyzing a batch whose analysis
//! was already recorded.

use std::collections::{HashSet, VecDeque};
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use serde::{Deserialize, Serialize};

use crate::analyze::DynAnalyzer;
use crate::error::Result;
use crate::model::{AnalyzedItem, Batch, BatchId};
use crate::report::{compute_report, AggregateReport};
use crate::retry::{self, RetryPolicy};
use crate::runtime::{DurableState, Runtime, SignalSender, TaskContext, TaskId};
use crate::store::DynSink;

pub const AGGREGATOR_TASK: &str = "aggregator";

/// Completed batch ids remembered for duplicate suppression.
pub const DEFAULT_DEDUP_WINDOW: usize = 1024;

pub fn task_id() -> Result<TaskId> {
    TaskId::new(AGGREGATOR_TASK)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AggregatorEvent {
    /// Signal from a producer.
    NewContent { batch: Batch },
    DrainStarted { batch_ids: Vec<BatchId> },
    Analyzed { batch_id: BatchId, results: Vec<AnalyzedItem> },
    BatchFinished { batch_id: BatchId, outcome: BatchOutcome },
    WentIdle,
    Restored { completed: Vec<BatchId>, stats: DrainStats },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchOutcome {
    Stored { report: AggregateReport },
    AnalyzeFailed { error: String },
    StoreFailed { error: String },
}

impl BatchOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, Self::Stored { .. })
    }

    fn stage(&self) -> Option<&'static str> {
        match self {
            Self::Stored { .. } => None,
            Self::AnalyzeFailed { .. } => Some("analyze"),
            Self::StoreFailed { .. } => Some("store"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainStats {
    pub stored: u64,
    pub failed: u64,
    pub duplicates_dropped: u64,
}

#[derive(Debug, Clone)]
pub struct AggregatorState {
    /// Batches waiting for the next pass, arrival order.
    pub queue: VecDeque<Batch>,
    pub work_pending: bool,
    /// Batches owned by the current pass, front is in flight.
    pub draining: VecDeque<Batch>,
    /// Analysis already recorded for the in-flight batch.
    pub analyzed: Option<(BatchId, Vec<AnalyzedItem>)>,
    completed: VecDeque<BatchId>,
    completed_set: HashSet<BatchId>,
    dedup_window: usize,
    pub stats: DrainStats,
}

impl Default for AggregatorState {
    fn default() -> Self {
        Self::with_dedup_window(DEFAULT_DEDUP_WINDOW)
    }
}

impl AggregatorState {
    pub fn with_dedup_window(window: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            work_pending: false,
            draining: VecDeque::new(),
            analyzed: None,
            completed: VecDeque::new(),
            completed_set: HashSet::new(),
            dedup_window: window.max(1),
            stats: DrainStats::default(),
        }
    }

    pub fn is_known(&self, id: &BatchId) -> bool {
        self.completed_set.contains(id)
            || self.queue.iter().any(|b| &b.id == id)
            || self.draining.iter().any(|b| &b.id == id)
    }

    pub fn is_completed(&self, id: &BatchId) -> bool {
        self.completed_set.contains(id)
    }

    fn remember(&mut self, id: BatchId) {
        if self.completed_set.insert(id.clone()) {
            self.completed.push_back(id);
        }
        while self.completed.len() > self.dedup_window {
            if let Some(old) = self.completed.pop_front() {
                self.completed_set.remove(&old);
            }
        }
    }

    /// Nothing queued and nothing in flight.
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.draining.is_empty()
    }
}

impl DurableState for AggregatorState {
    type Event = AggregatorEvent;

    fn apply(&mut self, event: &AggregatorEvent) {
        match event {
            AggregatorEvent::NewContent { batch } => {
                if self.is_known(&batch.id) {
                    self.stats.duplicates_dropped += 1;
                } else {
                    self.queue.push_back(batch.clone());
                    self.work_pending = true;
                }
            }
            AggregatorEvent::DrainStarted { batch_ids } => {
                let wanted: HashSet<&BatchId> = batch_ids.iter().collect();
                let (taken, kept): (VecDeque<Batch>, VecDeque<Batch>) = std::mem::take(&mut self.queue)
                    .into_iter()
                    .partition(|b| wanted.contains(&b.id));
                self.draining.extend(taken);
                self.queue = kept;
                self.work_pending = false;
            }
            AggregatorEvent::Analyzed { batch_id, results } => {
                self.analyzed = Some((batch_id.clone(), results.clone()));
            }
            AggregatorEvent::BatchFinished { batch_id, outcome } => {
                self.draining.retain(|b| &b.id != batch_id);
                if self
                    .analyzed
                    .as_ref()
                    .is_some_and(|(id, _)| id == batch_id)
                {
                    self.analyzed = None;
                }
                if outcome.is_stored() {
                    self.stats.stored += 1;
                } else {
                    self.stats.failed += 1;
                }
                self.remember(batch_id.clone());
            }
            AggregatorEvent::WentIdle => {
                self.work_pending = !self.queue.is_empty();
            }
            AggregatorEvent::Restored { completed, stats } => {
                for id in completed {
                    self.remember(id.clone());
                }
                self.stats = *stats;
            }
        }
    }

    fn snapshot(&self) -> Vec<AggregatorEvent> {
        let mut out = vec![AggregatorEvent::Restored {
            completed: self.completed.iter().cloned().collect(),
            stats: self.stats,
        }];
        if !self.draining.is_empty() {
            for batch in &self.draining {
                out.push(AggregatorEvent::NewContent {
                    batch: batch.clone(),
                });
            }
            out.push(AggregatorEvent::DrainStarted {
                batch_ids: self.draining.iter().map(|b| b.id.clone()).collect(),
            });
        }
        if let Some((batch_id, results)) = &self.analyzed {
            out.push(AggregatorEvent::Analyzed {
                batch_id: batch_id.clone(),
                results: results.clone(),
            });
        }
        // Batches queued after the drain started, so `work_pending` comes back set.
        for batch in &self.queue {
            out.push(AggregatorEvent::NewContent {
                batch: batch.clone(),
            });
        }
        out
    }
}

/// Producer-side handle on the aggregator's durable mailbox.
#[derive(Debug, Clone)]
pub struct AggregatorMailbox {
    tx: SignalSender<AggregatorEvent>,
}

impl AggregatorMailbox {
    pub async fn open(runtime: &Runtime) -> Result<Self> {
        Ok(Self {
            tx: runtime.signal_sender(&task_id()?).await?,
        })
    }

    /// Fire-and-forget; returns once the batch is journaled on the aggregator's history.
    pub async fn deliver(&self, batch: Batch) -> Result<()> {
        self.tx.deliver(AggregatorEvent::NewContent { batch }).await
    }
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Its `action_timeout` is a per-item budget; an attempt gets that times the batch size.
    pub analyze_retry: RetryPolicy,
    pub store_retry: RetryPolicy,
    pub dedup_window: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            analyze_retry: RetryPolicy::default(),
            store_retry: RetryPolicy::default(),
            dedup_window: DEFAULT_DEDUP_WINDOW,
        }
    }
}

/// What one drain pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassSummary {
    pub batches: Vec<BatchId>,
    pub stored: usize,
    pub failed: usize,
    pub items: usize,
    /// Batches still queued when the pass ended.
    pub remaining: usize,
}

pub struct Aggregator {
    analyzer: DynAnalyzer,
    sink: DynSink,
    cfg: AggregatorConfig,
}

impl Aggregator {
    pub fn new(analyzer: DynAnalyzer, sink: DynSink, cfg: AggregatorConfig) -> Self {
        Self {
            analyzer,
            sink,
            cfg,
        }
    }

    pub async fn attach(&self, runtime: &Runtime) -> Result<TaskContext<AggregatorState>> {
        runtime
            .attach_with(&task_id()?, AggregatorState::with_dedup_window(self.cfg.dedup_window))
            .await
    }

    /// Attach and drain forever. Only a scheduler fault returns.
    pub async fn run(&self, runtime: &Runtime) -> Result<()> {
        let mut ctx = self.attach(runtime).await?;
        tracing::info!(
            target: "aggregator",
            queued = ctx.state().queue.len(),
            in_flight = ctx.state().draining.len(),
            analyzer = self.analyzer.name(),
            sink = self.sink.name(),
            "aggregator started"
        );
        loop {
            self.run_pass(&mut ctx).await?;
        }
    }

    /// Wait for work, then drain everything queued at the start of the pass. Batches
    /// arriving meanwhile are left for the next pass.
    pub async fn run_pass(&self, ctx: &mut TaskContext<AggregatorState>) -> Result<PassSummary> {
        ctx.wait_until(|s| s.work_pending || !s.draining.is_empty())
            .await?;

        if ctx.state().draining.is_empty() {
            ctx.absorb_signals().await?;
            let batch_ids: Vec<BatchId> = ctx.state().queue.iter().map(|b| b.id.clone()).collect();
            ctx.record(AggregatorEvent::DrainStarted { batch_ids }).await?;
        } else {
            tracing::info!(
                target: "aggregator",
                in_flight = ctx.state().draining.len(),
                "resuming interrupted drain"
            );
        }

        let started = Instant::now();
        let mut summary = PassSummary::default();
        gauge!("pipeline_queue_depth").set(ctx.state().queue.len() as f64);

        while let Some(batch) = ctx.state().draining.front().cloned() {
            let outcome = self.process(ctx, &batch).await?;
            if outcome.is_stored() {
                summary.stored += 1;
                summary.items += batch.len();
            } else {
                summary.failed += 1;
            }
            summary.batches.push(batch.id.clone());
            ctx.record(AggregatorEvent::BatchFinished {
                batch_id: batch.id.clone(),
                outcome,
            })
            .await?;
        }

        ctx.absorb_signals().await?;
        summary.remaining = ctx.state().queue.len();
        gauge!("pipeline_queue_depth").set(summary.remaining as f64);
        histogram!("pipeline_drain_ms").record(started.elapsed().as_secs_f64() * 1000.0);

        if summary.remaining == 0 {
            ctx.record(AggregatorEvent::WentIdle).await?;
            ctx.compact().await?;
        }
        tracing::info!(
            target: "aggregator",
            batches = summary.batches.len(),
            stored = summary.stored,
            failed = summary.failed,
            items = summary.items,
            remaining = summary.remaining,
            "drain pass finished"
        );
        Ok(summary)
    }

    /// Analyze, report and store one batch. Action failures become the batch outcome;
    /// only scheduler faults propagate.
    async fn process(&self, ctx: &mut TaskContext<AggregatorState>, batch: &Batch) -> Result<BatchOutcome> {
        let recorded = ctx
            .state()
            .analyzed
            .as_ref()
            .filter(|(id, _)| id == &batch.id)
            .map(|(_, results)| results.clone());

        let results = match recorded {
            Some(results) => {
                tracing::debug!(target: "aggregator", batch_id = %batch.id, "reusing recorded analysis");
                results
            }
            None => {
                let analyzer = &self.analyzer;
                // items are analyzed one after another
                let policy = self.cfg.analyze_retry.per_unit_timeout(batch.len());
                let outcome = retry::execute("analyze", &policy, || analyzer.analyze(batch)).await;
                match outcome.result {
                    Ok(results) => {
                        ctx.record(AggregatorEvent::Analyzed {
                            batch_id: batch.id.clone(),
                            results: results.clone(),
                        })
                        .await?;
                        results
                    }
                    Err(e) => {
                        tracing::error!(
                            target: "aggregator",
                            batch_id = %batch.id,
                            source = %batch.source,
                            error = %e,
                            "analyze failed, skipping batch"
                        );
                        return Ok(self.failed(BatchOutcome::AnalyzeFailed {
                            error: e.to_string(),
                        }));
                    }
                }
            }
        };

        let report = compute_report(&results);
        let sink = &self.sink;
        let outcome = retry::execute("store", &self.cfg.store_retry, || sink.store(&results, &report)).await;
        match outcome.result {
            Ok(()) => {
                counter!("pipeline_batches_stored_total").increment(1);
                tracing::info!(
                    target: "aggregator",
                    batch_id = %batch.id,
                    source = %batch.source,
                    items = report.item_count,
                    average = report.average_sentiment,
                    positive = report.distribution.positive,
                    neutral = report.distribution.neutral,
                    negative = report.distribution.negative,
                    "batch stored"
                );
                Ok(BatchOutcome::Stored { report })
            }
            Err(e) => {
                tracing::error!(
                    target: "aggregator",
                    batch_id = %batch.id,
                    source = %batch.source,
                    error = %e,
                    "store failed, skipping batch"
                );
                Ok(self.failed(BatchOutcome::StoreFailed {
                    error: e.to_string(),
                }))
            }
        }
    }

    fn failed(&self, outcome: BatchOutcome) -> BatchOutcome {
        if let Some(stage) = outcome.stage() {
            counter!("pipeline_batches_failed_total", "stage" => stage).increment(1);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Source;

    fn replay(events: &[AggregatorEvent]) -> AggregatorState {
        let mut s = AggregatorState::with_dedup_window(2);
        for e in events {
            s.apply(e);
        }
        s
    }

    fn stored() -> BatchOutcome {
        BatchOutcome::Stored {
            report: AggregateReport::from_scores(std::iter::empty()),
        }
    }

    #[test]
    fn duplicate_deliveries_are_dropped() {
        let b = Batch::empty(Source::Reddit);
        let s = replay(&[
            AggregatorEvent::NewContent { batch: b.clone() },
            AggregatorEvent::NewContent { batch: b.clone() },
        ]);
        assert_eq!(s.queue.len(), 1);
        assert_eq!(s.stats.duplicates_dropped, 1);

        let s = replay(&[
            AggregatorEvent::NewContent { batch: b.clone() },
            AggregatorEvent::DrainStarted {
                batch_ids: vec![b.id.clone()],
            },
            AggregatorEvent::BatchFinished {
                batch_id: b.id.clone(),
                outcome: stored(),
            },
            AggregatorEvent::NewContent { batch: b.clone() },
        ]);
        assert!(s.is_idle());
        assert!(!s.work_pending);
        assert_eq!(s.stats.duplicates_dropped, 1);
    }

    #[test]
    fn drain_takes_only_named_batches() {
        let a = Batch::empty(Source::Reddit);
        let b = Batch::empty(Source::Twitter);
        let s = replay(&[
            AggregatorEvent::NewContent { batch: a.clone() },
            AggregatorEvent::DrainStarted {
                batch_ids: vec![a.id.clone()],
            },
            AggregatorEvent::NewContent { batch: b.clone() },
        ]);
        assert_eq!(s.draining.len(), 1);
        assert_eq!(s.queue.len(), 1);
        assert!(s.work_pending);
    }

    #[test]
    fn dedup_window_is_bounded() {
        let batches: Vec<Batch> = (0..3).map(|_| Batch::empty(Source::Reddit)).collect();
        let mut events = Vec::new();
        for b in &batches {
            events.push(AggregatorEvent::NewContent { batch: b.clone() });
            events.push(AggregatorEvent::DrainStarted {
                batch_ids: vec![b.id.clone()],
            });
            events.push(AggregatorEvent::BatchFinished {
                batch_id: b.id.clone(),
                outcome: stored(),
            });
        }
        let s = replay(&events);
        assert!(!s.is_completed(&batches[0].id));
        assert!(s.is_completed(&batches[1].id));
        assert!(s.is_completed(&batches[2].id));
        assert_eq!(s.stats.stored, 3);
    }

    #[test]
    fn snapshot_keeps_in_flight_drain_and_analysis() {
        let a = Batch::empty(Source::Reddit);
        let b = Batch::empty(Source::Twitter);
        let c = Batch::empty(Source::Twitter);
        let s = replay(&[
            AggregatorEvent::NewContent { batch: a.clone() },
            AggregatorEvent::NewContent { batch: b.clone() },
            AggregatorEvent::DrainStarted {
                batch_ids: vec![a.id.clone(), b.id.clone()],
            },
            AggregatorEvent::BatchFinished {
                batch_id: a.id.clone(),
                outcome: stored(),
            },
            AggregatorEvent::Analyzed {
                batch_id: b.id.clone(),
                results: vec![],
            },
            AggregatorEvent::NewContent { batch: c.clone() },
        ]);
        let rebuilt = replay(&s.snapshot());
        let ids = |q: &VecDeque<Batch>| q.iter().map(|x| x.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&rebuilt.draining), vec![b.id.clone()]);
        assert_eq!(ids(&rebuilt.queue), vec![c.id.clone()]);
        assert_eq!(rebuilt.analyzed.as_ref().map(|(id, _)| id.clone()), Some(b.id.clone()));
        assert!(rebuilt.is_completed(&a.id));
        assert!(rebuilt.work_pending);
        assert_eq!(rebuilt.stats, s.stats);
    }
}
