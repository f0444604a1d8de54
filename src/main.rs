//! Sentiment harvester binary entrypoint.
//! Boots the durable runtime, one producer per enabled source, the single aggregator
//! and the metrics endpoint, then runs until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sentiment_harvester::analyze::build_analyzer;
use sentiment_harvester::config::{load_pipeline_config, PipelineConfig, SourceConfig};
use sentiment_harvester::metrics::Metrics;
use sentiment_harvester::model::Source;
use sentiment_harvester::scrape::reddit::{RedditCredentials, RedditScraper};
use sentiment_harvester::scrape::twitter::TwitterScraper;
use sentiment_harvester::scrape::Scraper;
use sentiment_harvester::store::jsonl::JsonlSink;
use sentiment_harvester::store::sheets::SheetsSink;
use sentiment_harvester::store::DynSink;
use sentiment_harvester::{aggregator, spawn_supervised, Aggregator, AggregatorMailbox, Producer, Runtime};

/// `RUST_LOG` drives the filter; `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("sentiment_harvester=info,warn"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

fn build_scraper(src: &SourceConfig) -> anyhow::Result<Arc<dyn Scraper>> {
    Ok(match src.kind {
        Source::Reddit => {
            let creds = RedditCredentials::from_env();
            if creds.is_none() {
                tracing::info!("reddit credentials not set, using the public JSON API");
            }
            Arc::new(RedditScraper::new(src.subreddit(), src.limit(), creds)?)
        }
        Source::Twitter => Arc::new(TwitterScraper::from_env(src.query(), src.limit())?),
    })
}

fn build_sink(cfg: &PipelineConfig) -> anyhow::Result<DynSink> {
    match SheetsSink::from_env()? {
        Some(sheets) => Ok(Arc::new(sheets)),
        None => {
            tracing::warn!(
                path = %cfg.sink.jsonl_path.display(),
                "GOOGLE_SHEET_ID / GOOGLE_SHEETS_ACCESS_TOKEN not set, writing results to a local file"
            );
            Ok(Arc::new(JsonlSink::new(cfg.sink.jsonl_path.clone())))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op when the file is absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = load_pipeline_config().context("loading pipeline config")?;
    tracing::info!(state_dir = %cfg.state_dir.display(), sources = cfg.enabled_sources().count(), "config loaded");

    // --- Metrics endpoint ---
    let metrics = Metrics::install().context("installing prometheus recorder")?;
    let listener = tokio::net::TcpListener::bind(cfg.metrics_addr)
        .await
        .with_context(|| format!("binding metrics listener on {}", cfg.metrics_addr))?;
    tracing::info!(addr = %cfg.metrics_addr, "metrics listening");
    let router = metrics.router();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "metrics server stopped");
        }
    });

    // --- Durable tasks ---
    let runtime = Runtime::open(&cfg.state_dir).await?;
    let mut handles = Vec::new();

    let analyzer = build_analyzer(cfg.analyzer.model.as_deref())?;
    let sink = build_sink(&cfg)?;
    let agg = Arc::new(Aggregator::new(analyzer, sink, cfg.aggregator_config()?));
    {
        let rt = runtime.clone();
        handles.push(spawn_supervised(aggregator::task_id()?, cfg.restart_delay(), move || {
            let agg = Arc::clone(&agg);
            let rt = rt.clone();
            async move { agg.run(&rt).await }
        }));
    }

    for src in cfg.enabled_sources() {
        let mailbox = AggregatorMailbox::open(&runtime).await?;
        let producer = Arc::new(Producer::new(
            build_scraper(src)?,
            mailbox,
            src.producer_config(&cfg.retry)?,
        ));
        let rt = runtime.clone();
        let id = producer.task_id()?;
        handles.push(spawn_supervised(id, cfg.restart_delay(), move || {
            let producer = Arc::clone(&producer);
            let rt = rt.clone();
            async move { producer.run(&rt).await }
        }));
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutdown requested, stopping tasks");
    for h in &handles {
        h.abort();
    }
    for h in handles {
        let _ = h.await;
    }
    server.abort();
    Ok(())
}
