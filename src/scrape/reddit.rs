//! Reddit: hot posts of one subreddit plus their top comments.
//!
//! With `REDDIT_CLIENT_ID`/`REDDIT_CLIENT_SECRET` set, an app-only OAuth token is
//! fetched and `oauth.reddit.com` is used; otherwise the public JSON endpoints.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::json;

use super::{classify_status, Scraper};
use crate::error::ActionError;
use crate::model::{Batch, CanonicalItem, Reply, Source, DELETED_AUTHOR, MAX_REPLIES};
use crate::text::normalize_text;

pub const DEFAULT_SUBREDDIT: &str = "programming";
pub const DEFAULT_LIMIT: u32 = 10;

const USER_AGENT: &str = concat!("sentiment-harvester/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct RedditCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl RedditCredentials {
    pub fn from_env() -> Option<Self> {
        let client_id = std::env::var("REDDIT_CLIENT_ID").ok().filter(|s| !s.is_empty())?;
        let client_secret = std::env::var("REDDIT_CLIENT_SECRET").ok().filter(|s| !s.is_empty())?;
        Some(Self {
            client_id,
            client_secret,
        })
    }
}

pub struct RedditScraper {
    http: reqwest::Client,
    subreddit: String,
    limit: u32,
    credentials: Option<RedditCredentials>,
    public_base: String,
    oauth_base: String,
    token_url: String,
}

impl RedditScraper {
    pub fn new(subreddit: impl Into<String>, limit: u32, credentials: Option<RedditCredentials>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .context("building reddit http client")?;
        Ok(Self {
            http,
            subreddit: subreddit.into(),
            limit,
            credentials,
            public_base: "https://www.reddit.com".into(),
            oauth_base: "https://oauth.reddit.com".into(),
            token_url: "https://www.reddit.com/api/v1/access_token".into(),
        })
    }

    /// Point every endpoint at `base` (local fixtures, proxies).
    pub fn with_base_url(mut self, base: impl Into<String>) -> Self {
        let base = base.into();
        self.token_url = format!("{base}/api/v1/access_token");
        self.oauth_base = base.clone();
        self.public_base = base;
        self
    }

    async fn access_token(&self, creds: &RedditCredentials) -> Result<String, ActionError> {
        #[derive(Deserialize)]
        struct Token {
            access_token: String,
        }
        let resp = self
            .http
            .post(&self.token_url)
            .basic_auth(&creds.client_id, Some(&creds.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .context("reddit token request")?;
        if !resp.status().is_success() {
            return Err(classify_status(Source::Reddit, resp.status()));
        }
        let token: Token = resp.json().await.context("decoding reddit token")?;
        Ok(token.access_token)
    }

    async fn get_json(
        &self,
        path: &str,
        query: &[(&str, String)],
        token: Option<&str>,
    ) -> Result<serde_json::Value, ActionError> {
        let (url, req) = match token {
            Some(t) => {
                let url = format!("{}{path}", self.oauth_base);
                let req = self.http.get(&url).bearer_auth(t);
                (url, req)
            }
            None => {
                let url = format!("{}{path}.json", self.public_base);
                let req = self.http.get(&url);
                (url, req)
            }
        };
        let resp = req
            .query(query)
            .query(&[("raw_json", "1")])
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        if !resp.status().is_success() {
            return Err(classify_status(Source::Reddit, resp.status()));
        }
        Ok(resp.json().await.with_context(|| format!("decoding {url}"))?)
    }
}

#[async_trait]
impl Scraper for RedditScraper {
    async fn scrape(&self) -> Result<Batch, ActionError> {
        let token = match &self.credentials {
            Some(c) => Some(self.access_token(c).await?),
            None => None,
        };
        let token = token.as_deref();

        let listing = self
            .get_json(
                &format!("/r/{}/hot", self.subreddit),
                &[("limit", self.limit.to_string())],
                token,
            )
            .await?;
        let mut items = parse_listing(&listing)?;
        items.truncate(self.limit as usize);

        let mut out = Vec::with_capacity(items.len());
        for item in items {
            let path = format!("/r/{}/comments/{}", self.subreddit, item.id);
            let query = [("sort", "top".to_string()), ("limit", MAX_REPLIES.to_string())];
            let thread = self.get_json(&path, &query, token).await?;
            let replies = parse_comments(&thread);
            tracing::debug!(target: "scrape", post = %item.id, replies = replies.len(), "reddit post scraped");
            out.push(item.with_replies(replies));
        }
        tracing::info!(target: "scrape", subreddit = %self.subreddit, posts = out.len(), "reddit scrape finished");
        Ok(Batch::new(Source::Reddit, out))
    }

    fn source(&self) -> Source {
        Source::Reddit
    }
}

#[derive(Debug, Deserialize)]
struct Listing<T> {
    data: ListingData<T>,
}

#[derive(Debug, Deserialize)]
struct ListingData<T> {
    children: Vec<Thing<T>>,
}

#[derive(Debug, Deserialize)]
struct Thing<T> {
    kind: String,
    data: T,
}

#[derive(Debug, Deserialize)]
struct Post {
    id: String,
    title: String,
    #[serde(default)]
    selftext: String,
    #[serde(default)]
    score: i64,
    #[serde(default)]
    created_utc: f64,
    #[serde(default)]
    num_comments: i64,
    #[serde(default)]
    upvote_ratio: Option<f64>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    permalink: Option<String>,
    #[serde(default)]
    subreddit: Option<String>,
    #[serde(default)]
    author: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Comment {
    #[serde(default)]
    id: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    score: i64,
    #[serde(default)]
    created_utc: f64,
    #[serde(default)]
    stickied: bool,
}

fn timestamp(secs: f64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs as i64, 0).single().unwrap_or_else(Utc::now)
}

fn author_or_deleted(author: Option<String>) -> String {
    author
        .filter(|a| !a.is_empty())
        .unwrap_or_else(|| DELETED_AUTHOR.to_string())
}

/// Canonical items from a `/hot` listing. Replies are attached separately.
fn parse_listing(value: &serde_json::Value) -> Result<Vec<CanonicalItem>, ActionError> {
    let listing: Listing<Post> =
        serde_json::from_value(value.clone()).context("unexpected reddit listing shape")?;
    Ok(listing
        .data
        .children
        .into_iter()
        .filter(|t| t.kind == "t3")
        .map(|t| {
            let p = t.data;
            let mut source_specific = serde_json::Map::new();
            source_specific.insert("author".into(), json!(author_or_deleted(p.author)));
            if let Some(url) = p.url {
                source_specific.insert("url".into(), json!(url));
            }
            if let Some(permalink) = p.permalink {
                source_specific.insert("permalink".into(), json!(permalink));
            }
            if let Some(sub) = p.subreddit {
                source_specific.insert("subreddit".into(), json!(sub));
            }
            if let Some(ratio) = p.upvote_ratio {
                source_specific.insert("upvote_ratio".into(), json!(ratio));
            }
            let selftext = normalize_text(&p.selftext);
            CanonicalItem {
                id: p.id,
                source: Source::Reddit,
                primary_text: normalize_text(&p.title),
                secondary_text: (!selftext.is_empty()).then_some(selftext),
                score: p.score,
                created_at: timestamp(p.created_utc),
                replies: Vec::new(),
                engagement_metrics: [("num_comments".to_string(), p.num_comments)]
                    .into_iter()
                    .collect(),
                source_specific,
            }
        })
        .collect())
}

/// Top-level, non-stickied comments of a thread, in the order reddit returned them.
fn parse_comments(value: &serde_json::Value) -> Vec<Reply> {
    let Some(comments) = value.get(1) else {
        return Vec::new();
    };
    let listing: Listing<Comment> = match serde_json::from_value(comments.clone()) {
        Ok(l) => l,
        Err(e) => {
            tracing::warn!(target: "scrape", error = %e, "unexpected reddit comment listing shape");
            return Vec::new();
        }
    };
    listing
        .data
        .children
        .into_iter()
        .filter(|t| t.kind == "t1" && !t.data.stickied)
        .filter_map(|t| {
            let c = t.data;
            let body = normalize_text(c.body.as_deref()?);
            Some(Reply {
                id: c.id,
                body,
                author: author_or_deleted(c.author),
                score: c.score,
                created_at: timestamp(c.created_utc),
            })
        })
        .take(MAX_REPLIES)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing() -> serde_json::Value {
        json!({
            "kind": "Listing",
            "data": { "children": [
                { "kind": "t3", "data": {
                    "id": "abc", "title": "Rust &amp; you", "selftext": "",
                    "score": 120, "created_utc": 1700000000.0, "num_comments": 7,
                    "url": "https://example.com", "author": "alice"
                }},
                { "kind": "t3", "data": {
                    "id": "def", "title": "Second", "selftext": "body  text",
                    "score": 3, "created_utc": 1700000100.0, "num_comments": 0
                }}
            ]}
        })
    }

    #[test]
    fn listing_becomes_canonical_items() {
        let items = parse_listing(&listing()).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].primary_text, "Rust & you");
        assert_eq!(items[0].secondary_text, None);
        assert_eq!(items[0].metric("num_comments"), 7);
        assert_eq!(items[0].source_specific["author"], "alice");
        assert_eq!(items[1].secondary_text.as_deref(), Some("body text"));
        assert_eq!(items[1].source_specific["author"], DELETED_AUTHOR);
    }

    #[test]
    fn comments_skip_stickied_and_cap_at_five() {
        let mut children = vec![json!({ "kind": "t1", "data": {
            "id": "mod", "body": "rules", "author": "automod", "stickied": true
        }})];
        for i in 0..7 {
            children.push(json!({ "kind": "t1", "data": {
                "id": format!("c{i}"), "body": format!("comment {i}"), "score": i,
                "author": if i == 0 { serde_json::Value::Null } else { json!("bob") }
            }}));
        }
        children.push(json!({ "kind": "more", "data": { "id": "more" } }));
        let thread = json!([listing(), { "kind": "Listing", "data": { "children": children } }]);

        let replies = parse_comments(&thread);
        assert_eq!(replies.len(), MAX_REPLIES);
        assert_eq!(replies[0].id, "c0");
        assert_eq!(replies[0].author, DELETED_AUTHOR);
        assert!(replies.iter().all(|r| r.id != "mod"));
    }

    #[test]
    fn malformed_listing_is_a_failure() {
        let err = parse_listing(&json!({"nope": 1})).unwrap_err();
        assert!(!err.is_rate_limited());
    }
}
