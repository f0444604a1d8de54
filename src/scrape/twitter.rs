//! Twitter/X: API v2 recent search.
//!
//! The API enforces tight quotas, so this source runs under the rate-limit-aware retry
//! policy and reports HTTP 429 as `RateLimited`.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use super::{classify_status, Scraper};
use crate::error::ActionError;
use crate::model::{Batch, CanonicalItem, Source};
use crate::text::normalize_text;

pub const DEFAULT_QUERY: &str = "tech OR programming OR AI OR technology OR software";
pub const DEFAULT_LIMIT: u32 = 10;
/// Range of `max_results` the recent search endpoint accepts.
pub const LIMIT_RANGE: std::ops::RangeInclusive<u32> = 10..=100;

const METRICS: [&str; 4] = ["retweet_count", "like_count", "reply_count", "quote_count"];

pub struct TwitterScraper {
    http: reqwest::Client,
    bearer_token: Option<String>,
    query: String,
    limit: u32,
    base: String,
}

impl TwitterScraper {
    pub fn new(bearer_token: Option<String>, query: impl Into<String>, limit: u32) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("sentiment-harvester/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .context("building twitter http client")?;
        let clamped = limit.clamp(*LIMIT_RANGE.start(), *LIMIT_RANGE.end());
        if clamped != limit {
            tracing::warn!(target: "scrape", requested = limit, used = clamped, "twitter limit adjusted to the API range");
        }
        Ok(Self {
            http,
            bearer_token: bearer_token.filter(|t| !t.is_empty()),
            query: query.into(),
            limit: clamped,
            base: "https://api.twitter.com".into(),
        })
    }

    pub fn from_env(query: impl Into<String>, limit: u32) -> anyhow::Result<Self> {
        Self::new(std::env::var("TWITTER_BEARER_TOKEN").ok(), query, limit)
    }

    pub fn with_base_url(mut self, base: impl Into<String>) -> Self {
        self.base = base.into();
        self
    }
}

#[async_trait]
impl Scraper for TwitterScraper {
    async fn scrape(&self) -> Result<Batch, ActionError> {
        let Some(token) = self.bearer_token.as_deref() else {
            tracing::error!(target: "scrape", "TWITTER_BEARER_TOKEN is not set, returning an empty batch");
            return Ok(Batch::empty(Source::Twitter));
        };

        let url = format!("{}/2/tweets/search/recent", self.base);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(token)
            .query(&[
                ("query", self.query.as_str()),
                ("max_results", &self.limit.to_string()),
                ("tweet.fields", "created_at,public_metrics,author_id,conversation_id"),
                ("expansions", "author_id,referenced_tweets.id"),
                ("user.fields", "username,name"),
            ])
            .send()
            .await
            .context("twitter search request")?;
        if !resp.status().is_success() {
            return Err(classify_status(Source::Twitter, resp.status()));
        }
        let body: SearchResponse = resp.json().await.context("decoding twitter search")?;
        let items = into_items(body);
        tracing::info!(target: "scrape", query = %self.query, tweets = items.len(), "twitter scrape finished");
        Ok(Batch::new(Source::Twitter, items))
    }

    fn source(&self) -> Source {
        Source::Twitter
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Vec<Tweet>,
    #[serde(default)]
    includes: Includes,
}

#[derive(Debug, Default, Deserialize)]
struct Includes {
    #[serde(default)]
    users: Vec<User>,
}

#[derive(Debug, Deserialize)]
struct User {
    id: String,
    username: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct Tweet {
    id: String,
    text: String,
    #[serde(default)]
    author_id: Option<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    public_metrics: HashMap<String, i64>,
    #[serde(default)]
    referenced_tweets: Vec<Reference>,
}

#[derive(Debug, Deserialize, serde::Serialize)]
struct Reference {
    #[serde(rename = "type")]
    kind: String,
    id: String,
}

fn into_items(resp: SearchResponse) -> Vec<CanonicalItem> {
    let users: HashMap<&str, &User> = resp
        .includes
        .users
        .iter()
        .map(|u| (u.id.as_str(), u))
        .collect();

    resp.data
        .iter()
        .map(|t| {
            let user = t.author_id.as_deref().and_then(|id| users.get(id));
            let engagement = METRICS
                .iter()
                .map(|m| (m.to_string(), t.public_metrics.get(*m).copied().unwrap_or(0)))
                .collect();

            let mut source_specific = serde_json::Map::new();
            if let Some(author_id) = &t.author_id {
                source_specific.insert("author_id".into(), json!(author_id));
                let username = user.map(|u| u.username.as_str()).unwrap_or(author_id);
                source_specific.insert("author_username".into(), json!(username));
            }
            if let Some(u) = user {
                source_specific.insert("author_display_name".into(), json!(u.name));
            }
            if let Some(c) = &t.conversation_id {
                source_specific.insert("conversation_id".into(), json!(c));
            }
            if !t.referenced_tweets.is_empty() {
                source_specific.insert("referenced_tweets".into(), json!(t.referenced_tweets));
            }

            CanonicalItem {
                id: t.id.clone(),
                source: Source::Twitter,
                primary_text: normalize_text(&t.text),
                secondary_text: None,
                score: t.public_metrics.get("like_count").copied().unwrap_or(0),
                created_at: t.created_at.unwrap_or_else(Utc::now),
                replies: Vec::new(),
                engagement_metrics: engagement,
                source_specific,
            }
        })
        .collect()
}
