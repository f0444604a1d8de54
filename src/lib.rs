// src/lib.rs
// Public library surface for the binaries and integration tests.

pub mod error;
pub mod model;
pub mod report;
pub mod retry;
pub mod runtime;
pub mod text;

// Collaborators behind narrow traits
pub mod analyze;
pub mod scrape;
pub mod store;

// Durable tasks
pub mod aggregator;
pub mod producer;

pub mod config;
pub mod metrics;

// ---- Re-exports for stable public API ----
pub use aggregator::{Aggregator, AggregatorConfig, AggregatorMailbox};
pub use error::{ActionError, PipelineError, Result};
pub use producer::{Producer, ProducerConfig};
pub use runtime::{spawn_supervised, Runtime, TaskId};
