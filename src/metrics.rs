// src/metrics.rs
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

const DRAIN_MS_BUCKETS: &[f64] = &[
    50.0, 250.0, 1_000.0, 5_000.0, 15_000.0, 60_000.0, 300_000.0, 900_000.0,
];

/// One-time metrics registration (so series show up on /metrics with help text).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "pipeline_scrape_items_total",
            "Items returned by scrapes, per source."
        );
        describe_counter!(
            "pipeline_scrape_failures_total",
            "Scrape cycles that ended with an empty batch because of a failure."
        );
        describe_counter!(
            "pipeline_action_attempts_total",
            "External action attempts, per action."
        );
        describe_counter!(
            "pipeline_action_retries_total",
            "Backoff retries scheduled, per action."
        );
        describe_counter!(
            "pipeline_signals_delivered_total",
            "Signals journaled on a task's history."
        );
        describe_counter!(
            "pipeline_batches_stored_total",
            "Batches analyzed and stored."
        );
        describe_counter!(
            "pipeline_batches_failed_total",
            "Batches given up on, per failing stage."
        );
        describe_counter!(
            "pipeline_task_restarts_total",
            "Supervised task restarts."
        );
        describe_gauge!(
            "pipeline_queue_depth",
            "Batches waiting in the aggregator mailbox."
        );
        describe_histogram!(
            "pipeline_drain_ms",
            Unit::Milliseconds,
            "Duration of one aggregator drain pass."
        );
    });
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the process-wide Prometheus recorder. Fails if one is already installed.
    pub fn install() -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(Matcher::Full("pipeline_drain_ms".into()), DRAIN_MS_BUCKETS)?
            .install_recorder()?;
        ensure_metrics_described();
        Ok(Self { handle })
    }

    /// Router exposing `/metrics` (Prometheus exposition format) and `/healthz`.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new()
            .route(
                "/metrics",
                get(move || {
                    let h = handle.clone();
                    async move { h.render() }
                }),
            )
            .route("/healthz", get(|| async { "ok" }))
    }
}
