//! Web search tool with a live progress-list widget.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::core::widgets::{SearchHit, WidgetPatch, WidgetState, WidgetStatus};
use crate::tools::spec::{
    ToolContext, ToolError, ToolResult, ToolSpec, optional_u64, required_str,
};

const DEFAULT_LIMIT: u64 = 5;
const MAX_LIMIT: u64 = 10;

#[derive(Debug, Deserialize)]
struct UpstreamResponse {
    results: Vec<UpstreamHit>,
}

#[derive(Debug, Deserialize)]
struct UpstreamHit {
    title: String,
    #[serde(default)]
    snippet: String,
    #[serde(default)]
    url: String,
}

pub struct WebSearchTool {
    client: reqwest::Client,
    endpoint: Option<String>,
}

impl WebSearchTool {
    #[must_use]
    pub fn new(client: reqwest::Client, endpoint: Option<String>) -> Self {
        Self { client, endpoint }
    }

    async fn fetch(&self, query: &str, limit: u64) -> Result<Vec<SearchHit>, ToolError> {
        let Some(endpoint) = &self.endpoint else {
            return Ok(Self::fallback_hits(query, limit));
        };
        let response = self
            .client
            .get(endpoint)
            .query(&[("q", query), ("limit", &limit.to_string())])
            .send()
            .await
            .map_err(|e| ToolError::execution_failed(format!("search upstream: {e}")))?;
        if !response.status().is_success() {
            return Err(ToolError::execution_failed(format!(
                "search upstream returned {}",
                response.status()
            )));
        }
        let body: UpstreamResponse = response
            .json()
            .await
            .map_err(|e| ToolError::execution_failed(format!("search upstream body: {e}")))?;
        Ok(body
            .results
            .into_iter()
            .take(limit as usize)
            .map(|hit| SearchHit {
                title: hit.title,
                snippet: hit.snippet,
                source: hit.url,
            })
            .collect())
    }

    /// Deterministic results when no upstream is configured, so the server
    /// still completes turns end-to-end in development.
    fn fallback_hits(query: &str, limit: u64) -> Vec<SearchHit> {
        (1..=limit.min(3))
            .map(|n| SearchHit {
                title: format!("Result {n} for \"{query}\""),
                snippet: format!("No search upstream configured; placeholder summary {n}."),
                source: "local".to_string(),
            })
            .collect()
    }
}

#[async_trait]
impl ToolSpec for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web for recent news, injuries, and line movement"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "Search query"},
                "limit": {"type": "integer", "description": "Max results, defaults to 5"}
            },
            "required": ["query"]
        })
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(20)
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let query = required_str(&input, "query")?.to_string();
        let limit = optional_u64(&input, "limit")
            .unwrap_or(DEFAULT_LIMIT)
            .clamp(1, MAX_LIMIT);
        if ctx.is_cancelled() {
            return Err(ToolError::Cancelled);
        }

        ctx.create_widget(WidgetState::ProgressList {
            title: "Web search".to_string(),
            status: WidgetStatus::Loading,
            caption: format!("Searching for \"{query}\"..."),
            entries: Vec::new(),
        });

        let hits = match self.fetch(&query, limit).await {
            Ok(hits) => hits,
            Err(err) => {
                ctx.patch_widget(WidgetPatch::MarkFailed {
                    message: format!("Search failed: {err}"),
                });
                return Err(err);
            }
        };
        debug!(query = %query, results = hits.len(), "web search finished");

        for hit in &hits {
            ctx.patch_widget(WidgetPatch::PushEntry { entry: hit.clone() });
        }
        ctx.patch_widget(WidgetPatch::SetCaption {
            caption: format!("Found {} result(s)", hits.len()),
        });
        ctx.patch_widget(WidgetPatch::MarkReady);

        let summary = format!("{} result(s) for \"{query}\"", hits.len());
        Ok(ToolResult::new(json!({"query": query, "results": hits}), summary))
    }
}
