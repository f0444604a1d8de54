// src/analyze/prompt.rs
//! Prompt text for per-item sentiment scoring.

use crate::model::{CanonicalItem, Source};

/// Replies quoted in a reddit prompt.
const PROMPT_REPLIES: usize = 3;
/// Characters kept per quoted reply.
const REPLY_PREVIEW: usize = 200;

fn platform_block(item: &CanonicalItem) -> String {
    match item.source {
        Source::Reddit => {
            let content = item
                .secondary_text
                .as_deref()
                .filter(|s| !s.is_empty())
                .unwrap_or("No content");
            let comments: Vec<String> = item
                .replies
                .iter()
                .take(PROMPT_REPLIES)
                .map(|r| {
                    let body: String = r.body.chars().take(REPLY_PREVIEW).collect();
                    format!("- [{} points] {body}...", r.score)
                })
                .collect();
            format!(
                "Title: {}\n\nContent: {content}\n\nTop Comments:\n{}\n",
                item.primary_text,
                comments.join("\n")
            )
        }
        Source::Twitter => format!(
            "Tweet: {}\n\nEngagement: {} likes, {} retweets\n",
            item.primary_text,
            item.metric("like_count"),
            item.metric("retweet_count")
        ),
    }
}

fn platform_title(source: Source) -> &'static str {
    match source {
        Source::Reddit => "Reddit",
        Source::Twitter => "Twitter",
    }
}

pub fn sentiment_prompt(item: &CanonicalItem) -> String {
    format!(
        r#"Analyze the following {platform} content and its engagement. Your task has two independent parts:

PART 1: Write a brief summary (2-3 sentences) of the content and discussion.

PART 2: Determine the overall sentiment, considering both the content and responses/engagement.

For the sentiment analysis, think step by step:
1. Identify positive elements (enthusiasm, agreement, helpfulness, optimism)
2. Identify negative elements (criticism, frustration, disagreement, pessimism)
3. Identify neutral elements (factual statements, questions, balanced views)
4. Consider engagement metrics (high engagement might indicate resonance)
5. Weigh these elements to determine an overall sentiment score between 0 and 1 where 0 is extremely negative, 0.5 is neutral and 1 is extremely positive.

Content to analyze:
{block}
Respond with JSON only, in this shape:
{{
  "summary": "...",
  "sentiment_analysis": {{
    "positive_elements": "...",
    "negative_elements": "...",
    "neutral_elements": "...",
    "engagement_impact": "...",
    "sentiment_score": 0.5,
    "reasoning": "..."
  }}
}}
"#,
        platform = platform_title(item.source),
        block = platform_block(item),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Reply;
    use chrono::Utc;

    fn item(source: Source) -> CanonicalItem {
        CanonicalItem {
            id: "1".into(),
            source,
            primary_text: "Rust 2.0 announced".into(),
            secondary_text: None,
            score: 10,
            created_at: Utc::now(),
            replies: vec![],
            engagement_metrics: [("like_count".to_string(), 42)].into_iter().collect(),
            source_specific: Default::default(),
        }
    }

    #[test]
    fn reddit_prompt_quotes_three_replies_at_most() {
        let reply = |n: i64| Reply {
            id: n.to_string(),
            body: format!("reply {n}"),
            author: "a".into(),
            score: n,
            created_at: Utc::now(),
        };
        let it = item(Source::Reddit).with_replies((1..=5).map(reply));
        let p = sentiment_prompt(&it);
        assert!(p.contains("Analyze the following Reddit content"));
        assert!(p.contains("Content: No content"));
        assert!(p.contains("- [3 points] reply 3..."));
        assert!(!p.contains("reply 4"));
    }

    #[test]
    fn twitter_prompt_carries_engagement() {
        let p = sentiment_prompt(&item(Source::Twitter));
        assert!(p.contains("Tweet: Rust 2.0 announced"));
        assert!(p.contains("42 likes, 0 retweets"));
    }
}
