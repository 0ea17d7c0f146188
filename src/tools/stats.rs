//! Natural-language statistics lookup, rendered as a result card.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::core::widgets::{WidgetPatch, WidgetState, WidgetStatus};
use crate::tools::spec::{ToolContext, ToolError, ToolResult, ToolSpec, required_str};

#[derive(Debug, Deserialize)]
struct UpstreamAnswer {
    answer: String,
    #[serde(default)]
    source: Option<String>,
}

pub struct StatLookupTool {
    client: reqwest::Client,
    endpoint: Option<String>,
}

impl StatLookupTool {
    #[must_use]
    pub fn new(client: reqwest::Client, endpoint: Option<String>) -> Self {
        Self { client, endpoint }
    }

    async fn ask(&self, query: &str) -> Result<UpstreamAnswer, ToolError> {
        let Some(endpoint) = &self.endpoint else {
            return Ok(UpstreamAnswer {
                answer: format!("No stats upstream configured; cannot answer \"{query}\"."),
                source: None,
            });
        };
        let response = self
            .client
            .post(endpoint)
            .json(&json!({"query": query}))
            .send()
            .await
            .map_err(|e| ToolError::execution_failed(format!("stats upstream: {e}")))?;
        if !response.status().is_success() {
            return Err(ToolError::execution_failed(format!(
                "stats upstream returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| ToolError::execution_failed(format!("stats upstream body: {e}")))
    }
}

#[async_trait]
impl ToolSpec for StatLookupTool {
    fn name(&self) -> &str {
        "stat_lookup"
    }

    fn description(&self) -> &str {
        "Answer a sports statistics question in natural language"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Plain-English stats question, e.g. 'LeBron points per game this season'"
                }
            },
            "required": ["query"]
        })
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(15)
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let query = required_str(&input, "query")?.to_string();
        debug!(invocation = %ctx.invocation_id(), query = %query, "stat lookup");

        ctx.create_widget(WidgetState::ResultCard {
            title: query.clone(),
            status: WidgetStatus::Loading,
            body: "Looking it up...".to_string(),
            source: None,
        });

        let answer = match self.ask(&query).await {
            Ok(answer) => answer,
            Err(err) => {
                ctx.patch_widget(WidgetPatch::MarkFailed {
                    message: format!("Lookup failed: {err}"),
                });
                return Err(err);
            }
        };

        ctx.patch_widget(WidgetPatch::SetBody {
            body: answer.answer.clone(),
            source: answer.source.clone(),
        });
        ctx.patch_widget(WidgetPatch::MarkReady);

        let output = json!({
            "query": query,
            "answer": answer.answer,
            "source": answer.source,
        });
        Ok(ToolResult::new(output, format!("answered \"{query}\"")))
    }
}
