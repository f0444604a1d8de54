// src/config/mod.rs
pub mod pipeline;

pub use pipeline::{
    load_pipeline_config, load_pipeline_config_from, AggregatorSection, AnalyzerSection,
    PipelineConfig, RetrySection, RetrySettings, SinkSection, SourceConfig,
};
