//! Prints the records of a task journal, one JSON object per line.
//!
//! Usage: `journal_dump <task-id | path/to/file.journal>`
//! A task id is resolved against the configured state dir.

use std::path::PathBuf;

use anyhow::{bail, Context};
use sentiment_harvester::config::load_pipeline_config;
use sentiment_harvester::runtime::journal::read_records;
use sentiment_harvester::TaskId;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let Some(arg) = std::env::args().nth(1) else {
        bail!("usage: journal_dump <task-id | path/to/file.journal>");
    };

    let path = if arg.ends_with(".journal") || PathBuf::from(&arg).is_file() {
        PathBuf::from(&arg)
    } else {
        let id = TaskId::new(arg.as_str())?;
        let cfg = load_pipeline_config()?;
        cfg.state_dir.join(format!("{id}.journal"))
    };
    if !path.exists() {
        bail!("no journal at {}", path.display());
    }

    let records = read_records::<serde_json::Value>(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    for rec in &records {
        println!("{}", serde_json::to_string(rec)?);
    }
    eprintln!("{} record(s) in {}", records.len(), path.display());
    Ok(())
}
