//! Live odds board retrieval, rendered as a comparison table.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::core::widgets::{OddsRow, WidgetPatch, WidgetState, WidgetStatus};
use crate::tools::spec::{ToolContext, ToolError, ToolResult, ToolSpec, optional_str, optional_u64};

const DEFAULT_LIMIT: u64 = 8;

#[derive(Debug, Deserialize)]
struct UpstreamBoard {
    games: Vec<UpstreamGame>,
}

#[derive(Debug, Deserialize)]
struct UpstreamGame {
    away: String,
    home: String,
    #[serde(default)]
    spread: String,
    #[serde(default)]
    total: String,
    #[serde(default)]
    away_moneyline: String,
    #[serde(default)]
    home_moneyline: String,
}

pub struct OddsBoardTool {
    client: reqwest::Client,
    endpoint: Option<String>,
}

impl OddsBoardTool {
    #[must_use]
    pub fn new(client: reqwest::Client, endpoint: Option<String>) -> Self {
        Self { client, endpoint }
    }

    async fn fetch(&self, sport: &str, limit: u64) -> Result<Vec<OddsRow>, ToolError> {
        let Some(endpoint) = &self.endpoint else {
            return Ok(vec![OddsRow {
                away: "Away".to_string(),
                home: "Home".to_string(),
                spread: "PK".to_string(),
                total: "O/U 0".to_string(),
                away_moneyline: "+100".to_string(),
                home_moneyline: "-120".to_string(),
            }]);
        };
        let response = self
            .client
            .get(endpoint)
            .query(&[("sport", sport)])
            .send()
            .await
            .map_err(|e| ToolError::execution_failed(format!("odds upstream: {e}")))?;
        if !response.status().is_success() {
            return Err(ToolError::execution_failed(format!(
                "odds upstream returned {}",
                response.status()
            )));
        }
        let board: UpstreamBoard = response
            .json()
            .await
            .map_err(|e| ToolError::execution_failed(format!("odds upstream body: {e}")))?;
        Ok(board
            .games
            .into_iter()
            .take(limit as usize)
            .map(|g| OddsRow {
                away: g.away,
                home: g.home,
                spread: g.spread,
                total: g.total,
                away_moneyline: g.away_moneyline,
                home_moneyline: g.home_moneyline,
            })
            .collect())
    }
}

#[async_trait]
impl ToolSpec for OddsBoardTool {
    fn name(&self) -> &str {
        "get_odds"
    }

    fn description(&self) -> &str {
        "Fetch the current odds board for a sport, with spreads, totals, and moneylines"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "sport": {"type": "string", "description": "League key, e.g. nba, nfl, mlb"},
                "limit": {"type": "integer", "description": "Max games, defaults to 8"}
            }
        })
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(15)
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let sport = optional_str(&input, "sport").unwrap_or("nba").to_lowercase();
        let limit = optional_u64(&input, "limit").unwrap_or(DEFAULT_LIMIT).max(1);

        ctx.create_widget(WidgetState::ComparisonTable {
            title: format!("{} odds", sport.to_uppercase()),
            status: WidgetStatus::Loading,
            caption: "Fetching the board...".to_string(),
            rows: Vec::new(),
        });

        let rows = match self.fetch(&sport, limit).await {
            Ok(rows) => rows,
            Err(err) => {
                ctx.patch_widget(WidgetPatch::MarkFailed {
                    message: format!("Odds unavailable: {err}"),
                });
                return Err(err);
            }
        };

        ctx.patch_widget(WidgetPatch::SetRows { rows: rows.clone() });
        ctx.patch_widget(WidgetPatch::SetCaption {
            caption: format!("{} game(s) on the board", rows.len()),
        });
        ctx.patch_widget(WidgetPatch::MarkReady);

        let summary = format!("{} {} game(s)", rows.len(), sport);
        Ok(ToolResult::new(json!({"sport": sport, "games": rows}), summary))
    }
}
