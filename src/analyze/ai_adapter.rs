//! AI adapter: OpenAI-backed sentiment scoring plus a deterministic mock.
//!
//! `AI_TEST_MODE=mock` swaps the real provider for [`MockAnalyzer`] so local runs and
//! tests never leave the process.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use super::prompt::sentiment_prompt;
use super::{Analyzer, DynAnalyzer};
use crate::error::ActionError;
use crate::model::{AnalysisResult, AnalyzedItem, Batch, CanonicalItem};

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

const SYSTEM_PROMPT: &str = "You are a sentiment analysis expert. Always respond with valid JSON.";

/// Summary cap for anything the model returns.
const MAX_SUMMARY_CHARS: usize = 500;

/// Factory: `AI_TEST_MODE=mock` returns the mock, otherwise the OpenAI analyzer.
pub fn build_analyzer(model: Option<&str>) -> anyhow::Result<DynAnalyzer> {
    if std::env::var("AI_TEST_MODE")
        .map(|v| v == "mock")
        .unwrap_or(false)
    {
        tracing::info!(target: "analyze", "AI_TEST_MODE=mock, using mock analyzer");
        return Ok(Arc::new(MockAnalyzer::default()));
    }
    let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
    if api_key.is_empty() {
        tracing::warn!(target: "analyze", "OPENAI_API_KEY is not set; every analyze call will fail");
    }
    Ok(Arc::new(OpenAiAnalyzer::new(api_key, model)?))
}

/// OpenAI Chat Completions, one request per item.
pub struct OpenAiAnalyzer {
    http: reqwest::Client,
    api_key: String,
    model: String,
    endpoint: String,
}

impl OpenAiAnalyzer {
    pub fn new(api_key: impl Into<String>, model: Option<&str>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("sentiment-harvester/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(60))
            .build()
            .context("building OpenAI http client")?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            model: model.unwrap_or(DEFAULT_MODEL).to_string(),
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
        })
    }

    /// Point at a compatible endpoint (proxies, local gateways).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    async fn analyze_item(&self, item: &CanonicalItem) -> Result<AnalysisResult, ActionError> {
        if self.api_key.is_empty() {
            return Err(ActionError::failed("OPENAI_API_KEY is not set"));
        }

        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct ResponseFormat {
            #[serde(rename = "type")]
            kind: &'static str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            messages: Vec<Msg<'a>>,
            temperature: f32,
            response_format: ResponseFormat,
        }
        #[derive(Deserialize)]
        struct Resp {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMsg,
        }
        #[derive(Deserialize)]
        struct ChoiceMsg {
            content: String,
        }

        let prompt = sentiment_prompt(item);
        let req = Req {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                Msg {
                    role: "user",
                    content: &prompt,
                },
            ],
            temperature: 0.3,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .context("OpenAI request")?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ActionError::RateLimited("OpenAI returned 429".into()));
        }
        if !status.is_success() {
            return Err(ActionError::failed(format!("OpenAI returned HTTP {status}")));
        }
        let body: Resp = resp.json().await.context("decoding OpenAI response")?;
        let content = body
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| ActionError::failed("OpenAI response had no choices"))?;
        parse_analysis(content)
    }
}

#[derive(Debug, Deserialize)]
struct RawAnalysis {
    #[serde(default)]
    summary: String,
    sentiment_analysis: RawSentiment,
}

#[derive(Debug, Deserialize)]
struct RawSentiment {
    sentiment_score: f64,
    #[serde(flatten)]
    rest: serde_json::Map<String, serde_json::Value>,
}

/// Parse the model's JSON answer. The score is clamped into [0, 1]; the remaining
/// `sentiment_analysis` fields become reasoning entries.
pub fn parse_analysis(content: &str) -> Result<AnalysisResult, ActionError> {
    let raw: RawAnalysis = serde_json::from_str(content.trim())
        .with_context(|| format!("model answer is not the expected JSON: {}", preview(content)))?;
    let summary: String = raw.summary.trim().chars().take(MAX_SUMMARY_CHARS).collect();
    let mut out = AnalysisResult::new(raw.sentiment_analysis.sentiment_score, summary);
    for (k, v) in raw.sentiment_analysis.rest {
        let text = match v {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        out = out.with_reasoning(&k, text);
    }
    Ok(out)
}

fn preview(s: &str) -> String {
    s.chars().take(120).collect()
}

#[async_trait::async_trait]
impl Analyzer for OpenAiAnalyzer {
    async fn analyze(&self, batch: &Batch) -> Result<Vec<AnalyzedItem>, ActionError> {
        let mut out = Vec::with_capacity(batch.len());
        for item in &batch.items {
            let analysis = self.analyze_item(item).await?;
            tracing::debug!(
                target: "analyze",
                batch_id = %batch.id,
                item = %item.id,
                score = analysis.sentiment_score,
                "item analyzed"
            );
            out.push(AnalyzedItem {
                item: item.clone(),
                analysis,
            });
        }
        Ok(out)
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

/// Deterministic analyzer for tests and local runs.
#[derive(Debug, Clone)]
pub struct MockAnalyzer {
    pub score: f64,
}

impl Default for MockAnalyzer {
    fn default() -> Self {
        Self { score: 0.5 }
    }
}

#[async_trait::async_trait]
impl Analyzer for MockAnalyzer {
    async fn analyze(&self, batch: &Batch) -> Result<Vec<AnalyzedItem>, ActionError> {
        Ok(batch
            .items
            .iter()
            .map(|item| AnalyzedItem {
                item: item.clone(),
                analysis: AnalysisResult::new(self.score, "Neutral summary (mock)")
                    .with_reasoning("reasoning", "mock analyzer"),
            })
            .collect())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
