// src/store/sheets.rs
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;

use super::{rows, ResultSink};
use crate::error::ActionError;
use crate::model::AnalyzedItem;
use crate::report::AggregateReport;

/// Appends result rows to a Google Sheet through the `values:append` REST call.
/// Needs `GOOGLE_SHEET_ID` and an OAuth access token (`GOOGLE_SHEETS_ACCESS_TOKEN`).
pub struct SheetsSink {
    http: reqwest::Client,
    sheet_id: String,
    access_token: String,
    range: String,
    base: String,
}

impl SheetsSink {
    pub fn new(sheet_id: impl Into<String>, access_token: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .context("building sheets http client")?;
        Ok(Self {
            http,
            sheet_id: sheet_id.into(),
            access_token: access_token.into(),
            range: "Sheet1!A1".into(),
            base: "https://sheets.googleapis.com".into(),
        })
    }

    /// `None` unless both env vars are set and non-empty.
    pub fn from_env() -> anyhow::Result<Option<Self>> {
        let id = std::env::var("GOOGLE_SHEET_ID").ok().filter(|s| !s.is_empty());
        let token = std::env::var("GOOGLE_SHEETS_ACCESS_TOKEN").ok().filter(|s| !s.is_empty());
        match (id, token) {
            (Some(id), Some(token)) => Ok(Some(Self::new(id, token)?)),
            _ => Ok(None),
        }
    }

    pub fn with_base_url(mut self, base: impl Into<String>) -> Self {
        self.base = base.into();
        self
    }

    fn append_url(&self) -> String {
        format!(
            "{}/v4/spreadsheets/{}/values/{}:append",
            self.base, self.sheet_id, self.range
        )
    }
}

#[derive(Serialize)]
struct ValueRange {
    values: Vec<Vec<serde_json::Value>>,
}

#[async_trait]
impl ResultSink for SheetsSink {
    async fn store(&self, results: &[AnalyzedItem], report: &AggregateReport) -> Result<(), ActionError> {
        let body = ValueRange {
            values: rows(results, report, Utc::now()),
        };
        let n = body.values.len();
        let resp = self
            .http
            .post(self.append_url())
            .bearer_auth(&self.access_token)
            .query(&[("valueInputOption", "RAW"), ("insertDataOption", "INSERT_ROWS")])
            .json(&body)
            .send()
            .await
            .context("sheets append request")?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ActionError::RateLimited("sheets returned 429".into()));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let snippet: String = text.chars().take(200).collect();
            return Err(ActionError::failed(format!("sheets returned HTTP {status}: {snippet}")));
        }
        tracing::debug!(target: "store", sink = "sheets", rows = n, "rows appended");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "sheets"
    }
}
