// src/config/pipeline.rs
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::aggregator::{AggregatorConfig, DEFAULT_DEDUP_WINDOW};
use crate::error::{PipelineError, Result};
use crate::model::Source;
use crate::producer::ProducerConfig;
use crate::retry::{RetryMode, RetryPolicy};
use crate::scrape::{reddit, twitter};

const ENV_PATH: &str = "PIPELINE_CONFIG_PATH";
const ENV_STATE_DIR: &str = "PIPELINE_STATE_DIR";
const FALLBACK_PATH: &str = "config/pipeline.toml";

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}
fn default_metrics_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9100))
}
fn default_restart_delay_secs() -> u64 {
    5
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: SocketAddr,
    /// Pause before a supervised task is restarted from its journal.
    #[serde(default = "default_restart_delay_secs")]
    pub restart_delay_secs: u64,
    #[serde(default = "SourceConfig::defaults")]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub aggregator: AggregatorSection,
    #[serde(default)]
    pub analyzer: AnalyzerSection,
    #[serde(default)]
    pub sink: SinkSection,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            metrics_addr: default_metrics_addr(),
            restart_delay_secs: default_restart_delay_secs(),
            sources: SourceConfig::defaults(),
            retry: RetrySettings::default(),
            aggregator: AggregatorSection::default(),
            analyzer: AnalyzerSection::default(),
            sink: SinkSection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub kind: Source,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub interval_secs: u64,
    /// Reddit only.
    #[serde(default)]
    pub subreddit: Option<String>,
    /// Twitter only.
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
}

impl SourceConfig {
    /// reddit hourly, twitter every two hours.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self {
                kind: Source::Reddit,
                enabled: true,
                interval_secs: 3600,
                subreddit: None,
                query: None,
                limit: None,
            },
            Self {
                kind: Source::Twitter,
                enabled: true,
                interval_secs: 7200,
                subreddit: None,
                query: None,
                limit: None,
            },
        ]
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn subreddit(&self) -> &str {
        self.subreddit.as_deref().unwrap_or(reddit::DEFAULT_SUBREDDIT)
    }

    pub fn query(&self) -> &str {
        self.query.as_deref().unwrap_or(twitter::DEFAULT_QUERY)
    }

    pub fn limit(&self) -> u32 {
        self.limit.unwrap_or(match self.kind {
            Source::Reddit => reddit::DEFAULT_LIMIT,
            Source::Twitter => twitter::DEFAULT_LIMIT,
        })
    }

    /// Producer settings: rate-limited sources scrape under the rate-limit-aware policy.
    pub fn producer_config(&self, retry: &RetrySettings) -> Result<ProducerConfig> {
        let policy = if self.kind.is_rate_limited() {
            retry.rate_limited.to_policy(RetryMode::RateLimitAware)?
        } else {
            retry.default.to_policy(RetryMode::Default)?
        };
        Ok(ProducerConfig {
            interval: self.interval(),
            retry: policy,
        })
    }
}

/// Retry curve in config units (seconds). `jitter_fraction` absent means no jitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySection {
    pub initial_interval_secs: f64,
    pub max_interval_secs: f64,
    pub max_attempts: u32,
    #[serde(default = "default_coefficient")]
    pub backoff_coefficient: f64,
    #[serde(default)]
    pub jitter_fraction: Option<f64>,
    #[serde(default = "default_action_timeout_secs")]
    pub action_timeout_secs: f64,
}

fn default_coefficient() -> f64 {
    2.0
}
fn default_action_timeout_secs() -> f64 {
    300.0
}

fn secs(name: &str, v: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(v)
        .map_err(|_| PipelineError::Config(format!("{name} must be a non-negative number of seconds, got {v}")))
}

impl RetrySection {
    fn from_policy(p: &RetryPolicy) -> Self {
        Self {
            initial_interval_secs: p.initial_interval.as_secs_f64(),
            max_interval_secs: p.max_interval.as_secs_f64(),
            max_attempts: p.max_attempts,
            backoff_coefficient: p.backoff_coefficient,
            jitter_fraction: p.jitter_fraction,
            action_timeout_secs: p.action_timeout.as_secs_f64(),
        }
    }

    pub fn to_policy(&self, mode: RetryMode) -> Result<RetryPolicy> {
        let policy = RetryPolicy {
            initial_interval: secs("initial_interval_secs", self.initial_interval_secs)?,
            max_interval: secs("max_interval_secs", self.max_interval_secs)?,
            max_attempts: self.max_attempts,
            backoff_coefficient: self.backoff_coefficient,
            jitter_fraction: self.jitter_fraction,
            mode,
            action_timeout: secs("action_timeout_secs", self.action_timeout_secs)?,
        };
        policy.validate()?;
        Ok(policy)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySettings {
    /// Scrape, analyze and store.
    #[serde(default = "RetrySettings::default_section")]
    pub default: RetrySection,
    /// Scrapes of rate-limited sources.
    #[serde(default = "RetrySettings::rate_limited_section")]
    pub rate_limited: RetrySection,
}

impl RetrySettings {
    fn default_section() -> RetrySection {
        RetrySection::from_policy(&RetryPolicy::default())
    }
    fn rate_limited_section() -> RetrySection {
        RetrySection::from_policy(&RetryPolicy::rate_limited())
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            default: Self::default_section(),
            rate_limited: Self::rate_limited_section(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregatorSection {
    #[serde(default = "default_dedup_window")]
    pub dedup_window: usize,
}

fn default_dedup_window() -> usize {
    DEFAULT_DEDUP_WINDOW
}

impl Default for AggregatorSection {
    fn default() -> Self {
        Self {
            dedup_window: DEFAULT_DEDUP_WINDOW,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalyzerSection {
    /// Chat model; the adapter's default when absent.
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SinkSection {
    /// Used when the Sheets credentials are not in the environment.
    #[serde(default = "default_jsonl_path")]
    pub jsonl_path: PathBuf,
}

fn default_jsonl_path() -> PathBuf {
    PathBuf::from("state/results.jsonl")
}

impl Default for SinkSection {
    fn default() -> Self {
        Self {
            jsonl_path: default_jsonl_path(),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(s).map_err(|e| PipelineError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        for s in &self.sources {
            if s.interval_secs == 0 {
                return Err(PipelineError::Config(format!(
                    "source {}: interval_secs must be > 0",
                    s.kind
                )));
            }
            if s.limit == Some(0) {
                return Err(PipelineError::Config(format!("source {}: limit must be > 0", s.kind)));
            }
            if s.kind == Source::Twitter && !twitter::LIMIT_RANGE.contains(&s.limit()) {
                return Err(PipelineError::Config(format!(
                    "source twitter: limit must be within {}..={}, got {}",
                    twitter::LIMIT_RANGE.start(),
                    twitter::LIMIT_RANGE.end(),
                    s.limit()
                )));
            }
        }
        let mut kinds: Vec<Source> = self.sources.iter().filter(|s| s.enabled).map(|s| s.kind).collect();
        kinds.sort();
        if kinds.windows(2).any(|w| w[0] == w[1]) {
            return Err(PipelineError::Config(
                "each source kind may be enabled at most once".into(),
            ));
        }
        if self.aggregator.dedup_window == 0 {
            return Err(PipelineError::Config("aggregator.dedup_window must be > 0".into()));
        }
        self.retry.default.to_policy(RetryMode::Default)?;
        self.retry.rate_limited.to_policy(RetryMode::RateLimitAware)?;
        Ok(())
    }

    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn aggregator_config(&self) -> Result<AggregatorConfig> {
        let policy = self.retry.default.to_policy(RetryMode::Default)?;
        Ok(AggregatorConfig {
            analyze_retry: policy.clone(),
            store_retry: policy,
            dedup_window: self.aggregator.dedup_window,
        })
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }
}

/// Load from an explicit TOML file.
pub fn load_pipeline_config_from(path: &Path) -> Result<PipelineConfig> {
    let content = fs::read_to_string(path)
        .map_err(|e| PipelineError::Config(format!("reading {}: {e}", path.display())))?;
    PipelineConfig::from_toml_str(&content)
        .map_err(|e| PipelineError::Config(format!("{}: {e}", path.display())))
}

/// Load using env var + fallbacks:
/// 1) $PIPELINE_CONFIG_PATH
/// 2) config/pipeline.toml
/// 3) built-in defaults
///
/// `$PIPELINE_STATE_DIR`, when set, overrides `state_dir`.
pub fn load_pipeline_config() -> Result<PipelineConfig> {
    let mut cfg = if let Ok(p) = std::env::var(ENV_PATH) {
        let pb = PathBuf::from(p);
        if !pb.exists() {
            return Err(PipelineError::Config(format!(
                "{ENV_PATH} points to non-existent path {}",
                pb.display()
            )));
        }
        load_pipeline_config_from(&pb)?
    } else if Path::new(FALLBACK_PATH).exists() {
        load_pipeline_config_from(Path::new(FALLBACK_PATH))?
    } else {
        PipelineConfig::default()
    };
    if let Ok(dir) = std::env::var(ENV_STATE_DIR) {
        if !dir.is_empty() {
            cfg.state_dir = PathBuf::from(dir);
        }
    }
    Ok(cfg)
}
