//! # Source producer
//! One task per source: `Idle → Scraping → Delivering → Sleeping → Idle`, forever.
//!
//! Every transition is journaled. A restart in `Delivering` re-sends the recorded batch
//! without scraping again, and a restart in `Sleeping` resumes the remaining sleep.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};

use crate::aggregator::AggregatorMailbox;
use crate::error::Result;
use crate::model::{Batch, BatchId};
use crate::retry::{self, RetryPolicy};
use crate::runtime::{DurableState, Runtime, TaskContext, TaskId};
use crate::scrape::Scraper;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProducerEvent {
    CycleStarted {
        cycle: u64,
    },
    Scraped {
        batch: Batch,
    },
    /// `items == 0` means nothing was sent this cycle.
    Delivered {
        batch_id: BatchId,
        items: usize,
        sleep_until: DateTime<Utc>,
    },
    Woke,
    Restored {
        cycles_completed: u64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProducerPhase {
    Idle,
    Scraping,
    Delivering(Batch),
    Sleeping { until: DateTime<Utc> },
}

#[derive(Debug, Clone)]
pub struct ProducerState {
    pub phase: ProducerPhase,
    pub cycle: u64,
    pub cycles_completed: u64,
    pub last_delivered: Option<BatchId>,
}

impl Default for ProducerState {
    fn default() -> Self {
        Self {
            phase: ProducerPhase::Idle,
            cycle: 0,
            cycles_completed: 0,
            last_delivered: None,
        }
    }
}

impl DurableState for ProducerState {
    type Event = ProducerEvent;

    fn apply(&mut self, event: &ProducerEvent) {
        match event {
            ProducerEvent::CycleStarted { cycle } => {
                self.cycle = *cycle;
                self.phase = ProducerPhase::Scraping;
            }
            ProducerEvent::Scraped { batch } => {
                self.phase = ProducerPhase::Delivering(batch.clone());
            }
            ProducerEvent::Delivered {
                batch_id,
                items,
                sleep_until,
            } => {
                if *items > 0 {
                    self.last_delivered = Some(batch_id.clone());
                }
                self.phase = ProducerPhase::Sleeping {
                    until: *sleep_until,
                };
            }
            ProducerEvent::Woke => {
                self.cycles_completed = self.cycle;
                self.phase = ProducerPhase::Idle;
            }
            ProducerEvent::Restored { cycles_completed } => {
                self.cycle = *cycles_completed;
                self.cycles_completed = *cycles_completed;
                self.phase = ProducerPhase::Idle;
            }
        }
    }

    fn snapshot(&self) -> Vec<ProducerEvent> {
        let mut out = vec![ProducerEvent::Restored {
            cycles_completed: self.cycles_completed,
        }];
        match &self.phase {
            ProducerPhase::Idle => {}
            ProducerPhase::Scraping => out.push(ProducerEvent::CycleStarted { cycle: self.cycle }),
            ProducerPhase::Delivering(batch) => {
                out.push(ProducerEvent::CycleStarted { cycle: self.cycle });
                out.push(ProducerEvent::Scraped {
                    batch: batch.clone(),
                });
            }
            ProducerPhase::Sleeping { until } => {
                out.push(ProducerEvent::CycleStarted { cycle: self.cycle });
                out.push(ProducerEvent::Delivered {
                    batch_id: self
                        .last_delivered
                        .clone()
                        .unwrap_or_else(|| BatchId(String::new())),
                    items: usize::from(self.last_delivered.is_some()),
                    sleep_until: *until,
                });
            }
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub interval: Duration,
    pub retry: RetryPolicy,
}

pub struct Producer {
    scraper: Arc<dyn Scraper>,
    mailbox: AggregatorMailbox,
    cfg: ProducerConfig,
}

impl Producer {
    pub fn new(scraper: Arc<dyn Scraper>, mailbox: AggregatorMailbox, cfg: ProducerConfig) -> Self {
        Self {
            scraper,
            mailbox,
            cfg,
        }
    }

    pub fn task_id(&self) -> Result<TaskId> {
        TaskId::new(format!("producer-{}", self.scraper.source()))
    }

    /// Attach to the journal and loop forever. Only a scheduler fault returns.
    pub async fn run(&self, runtime: &Runtime) -> Result<()> {
        let id = self.task_id()?;
        let mut ctx = runtime.attach::<ProducerState>(&id).await?;
        tracing::info!(
            target: "producer",
            task = %id,
            phase = ?ctx.state().phase,
            cycles = ctx.state().cycles_completed,
            interval_secs = self.cfg.interval.as_secs(),
            "producer started"
        );
        loop {
            self.step(&mut ctx).await?;
        }
    }

    /// Drive one full cycle, from whatever phase the state is in back to `Idle`.
    pub async fn run_cycle(&self, ctx: &mut TaskContext<ProducerState>) -> Result<()> {
        loop {
            self.step(ctx).await?;
            if ctx.state().phase == ProducerPhase::Idle {
                return Ok(());
            }
        }
    }

    /// Perform exactly one state transition.
    pub async fn step(&self, ctx: &mut TaskContext<ProducerState>) -> Result<()> {
        match ctx.state().phase.clone() {
            ProducerPhase::Idle => {
                let cycle = ctx.state().cycles_completed + 1;
                ctx.record(ProducerEvent::CycleStarted { cycle }).await
            }
            ProducerPhase::Scraping => {
                let batch = self.scrape().await;
                ctx.record(ProducerEvent::Scraped { batch }).await
            }
            ProducerPhase::Delivering(batch) => {
                let items = batch.len();
                if items > 0 {
                    self.mailbox.deliver(batch.clone()).await?;
                    tracing::info!(
                        target: "producer",
                        source = %batch.source,
                        batch_id = %batch.id,
                        items,
                        "batch delivered to aggregator"
                    );
                } else {
                    tracing::debug!(target: "producer", source = %batch.source, "empty batch, nothing to deliver");
                }
                let sleep_until = Utc::now()
                    + chrono::Duration::from_std(self.cfg.interval)
                        .unwrap_or_else(|_| chrono::Duration::hours(1));
                ctx.record(ProducerEvent::Delivered {
                    batch_id: batch.id,
                    items,
                    sleep_until,
                })
                .await
            }
            ProducerPhase::Sleeping { until } => {
                ctx.sleep_until(until).await;
                ctx.record(ProducerEvent::Woke).await?;
                ctx.compact().await
            }
        }
    }

    /// Scrape through the retry engine. Never fails: a terminal failure becomes an
    /// empty batch so the cadence is kept.
    async fn scrape(&self) -> Batch {
        let source = self.scraper.source();
        let scraper = &self.scraper;
        let outcome = retry::execute_or_else(
            "scrape",
            &self.cfg.retry,
            || scraper.scrape(),
            || Batch::empty(source),
        )
        .await;

        match outcome.result {
            Ok(batch) => {
                counter!("pipeline_scrape_items_total", "source" => source.as_str())
                    .increment(batch.len() as u64);
                if outcome.degraded {
                    counter!("pipeline_scrape_failures_total", "source" => source.as_str())
                        .increment(1);
                }
                tracing::info!(
                    target: "producer",
                    %source,
                    items = batch.len(),
                    attempts = outcome.attempts,
                    degraded = outcome.degraded,
                    "scrape finished"
                );
                batch
            }
            Err(e) => {
                counter!("pipeline_scrape_failures_total", "source" => source.as_str()).increment(1);
                tracing::error!(target: "producer", %source, error = %e, "scrape failed, continuing with an empty batch");
                Batch::empty(source)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replay(events: &[ProducerEvent]) -> ProducerState {
        let mut s = ProducerState::default();
        for e in events {
            s.apply(e);
        }
        s
    }

    #[test]
    fn phases_follow_the_cycle() {
        let batch = Batch::empty(crate::model::Source::Reddit);
        let until = Utc::now();
        let s = replay(&[ProducerEvent::CycleStarted { cycle: 1 }]);
        assert_eq!(s.phase, ProducerPhase::Scraping);
        let s = replay(&[
            ProducerEvent::CycleStarted { cycle: 1 },
            ProducerEvent::Scraped {
                batch: batch.clone(),
            },
        ]);
        assert_eq!(s.phase, ProducerPhase::Delivering(batch.clone()));
        let s = replay(&[
            ProducerEvent::CycleStarted { cycle: 1 },
            ProducerEvent::Scraped { batch: batch.clone() },
            ProducerEvent::Delivered {
                batch_id: batch.id.clone(),
                items: 0,
                sleep_until: until,
            },
        ]);
        assert_eq!(s.phase, ProducerPhase::Sleeping { until });
        assert!(s.last_delivered.is_none());
    }

    #[test]
    fn snapshot_rebuilds_every_phase() {
        let batch = Batch::empty(crate::model::Source::Twitter);
        let until = Utc::now();
        let histories = vec![
            vec![ProducerEvent::Restored { cycles_completed: 4 }],
            vec![ProducerEvent::CycleStarted { cycle: 1 }],
            vec![
                ProducerEvent::CycleStarted { cycle: 1 },
                ProducerEvent::Scraped { batch: batch.clone() },
            ],
            vec![
                ProducerEvent::CycleStarted { cycle: 1 },
                ProducerEvent::Scraped { batch: batch.clone() },
                ProducerEvent::Delivered {
                    batch_id: BatchId("b1".into()),
                    items: 3,
                    sleep_until: until,
                },
            ],
        ];
        for h in histories {
            let s = replay(&h);
            let rebuilt = replay(&s.snapshot());
            assert_eq!(rebuilt.phase, s.phase);
            assert_eq!(rebuilt.cycles_completed, s.cycles_completed);
            assert_eq!(rebuilt.last_delivered, s.last_delivered);
        }
    }
}
