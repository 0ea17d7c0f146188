//! Parlay construction tool: odds math plus the interactive builder widget.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::core::widgets::{ParlayLeg, WidgetPatch, WidgetState, WidgetStatus};
use crate::tools::spec::{
    ToolContext, ToolError, ToolResult, ToolSpec, optional_f64, optional_str,
};

const DEFAULT_STAKE: f64 = 10.0;

/// Convert American odds to a decimal multiplier.
#[must_use]
pub fn american_to_decimal(odds: i64) -> f64 {
    if odds > 0 {
        odds as f64 / 100.0 + 1.0
    } else {
        100.0 / odds.unsigned_abs() as f64 + 1.0
    }
}

/// Convert a decimal multiplier back to American odds, rounded.
#[must_use]
pub fn decimal_to_american(decimal: f64) -> i64 {
    if decimal >= 2.0 {
        ((decimal - 1.0) * 100.0).round() as i64
    } else {
        (-100.0 / (decimal - 1.0)).round() as i64
    }
}

/// Product of the per-leg decimal odds.
#[must_use]
pub fn combined_decimal(legs: &[ParlayLeg]) -> f64 {
    legs.iter()
        .map(|leg| american_to_decimal(leg.odds))
        .product()
}

pub struct BuildParlayTool;

impl BuildParlayTool {
    fn parse_legs(input: &Value) -> Result<Vec<ParlayLeg>, ToolError> {
        let raw = input
            .get("legs")
            .and_then(Value::as_array)
            .ok_or_else(|| ToolError::invalid_input("missing required field 'legs'"))?;
        if raw.is_empty() {
            return Err(ToolError::invalid_input("a parlay needs at least one leg"));
        }
        let mut legs = Vec::with_capacity(raw.len());
        for entry in raw {
            let pick = entry
                .get("pick")
                .and_then(Value::as_str)
                .ok_or_else(|| ToolError::invalid_input("each leg needs a 'pick'"))?;
            let odds = entry
                .get("odds")
                .and_then(Value::as_i64)
                .ok_or_else(|| ToolError::invalid_input("each leg needs integer 'odds'"))?;
            if odds == 0 || (-100..100).contains(&odds) {
                return Err(ToolError::invalid_input(format!(
                    "american odds must be <= -100 or >= +100, got {odds}"
                )));
            }
            legs.push(ParlayLeg {
                pick: pick.to_string(),
                market: entry
                    .get("market")
                    .and_then(Value::as_str)
                    .unwrap_or("moneyline")
                    .to_string(),
                odds,
                confidence: entry
                    .get("confidence")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            });
        }
        Ok(legs)
    }
}

#[async_trait]
impl ToolSpec for BuildParlayTool {
    fn name(&self) -> &str {
        "build_parlay"
    }

    fn description(&self) -> &str {
        "Assemble a parlay from picks with American odds, computing combined odds and payout"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "legs": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "pick": {"type": "string"},
                            "market": {"type": "string"},
                            "odds": {"type": "integer", "description": "American odds, e.g. -110"},
                            "confidence": {"type": "string"}
                        },
                        "required": ["pick", "odds"]
                    }
                },
                "stake": {"type": "number", "description": "Wager amount, defaults to 10"}
            },
            "required": ["legs"]
        })
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let legs = Self::parse_legs(&input)?;
        let stake = optional_f64(&input, "stake").unwrap_or(DEFAULT_STAKE);
        if stake <= 0.0 {
            return Err(ToolError::invalid_input("stake must be positive"));
        }
        let title = optional_str(&input, "title").unwrap_or("Parlay builder");

        ctx.create_widget(WidgetState::InteractiveBuilder {
            title: title.to_string(),
            status: WidgetStatus::Loading,
            legs: Vec::new(),
            stake,
            combined_odds: 0,
            payout: 0.0,
        });

        let decimal = combined_decimal(&legs);
        let combined = decimal_to_american(decimal);
        let payout = stake * decimal;
        let profit = payout - stake;

        ctx.patch_widget(WidgetPatch::SetLegs {
            legs: legs.clone(),
            stake,
            combined_odds: combined,
            payout,
        });
        ctx.patch_widget(WidgetPatch::MarkReady);

        let output = json!({
            "legs": legs,
            "stake": stake,
            "combined_decimal": (decimal * 100.0).round() / 100.0,
            "combined_american": combined,
            "payout": (payout * 100.0).round() / 100.0,
            "profit": (profit * 100.0).round() / 100.0,
        });
        let summary = format!(
            "{}-leg parlay at {:+} pays {:.2} on a {:.2} stake",
            legs.len(),
            combined,
            payout,
            stake
        );
        Ok(ToolResult::new(output, summary))
    }
}
