//! Widget state tracking for one turn.
//!
//! A widget is created with an initial state, patched in place any number of
//! times while its turn is open, then frozen. The tracker holds the
//! authoritative latest state per widget id and enforces the open -> frozen
//! lifecycle; the store only ever sees the lazily-written first snapshot and
//! the final overwrite at freeze.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Rendering phase shared by every widget variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WidgetStatus {
    Loading,
    Ready,
    Failed,
}

/// One result row in a search progress widget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub snippet: String,
    pub source: String,
}

/// One game row in an odds comparison table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OddsRow {
    pub away: String,
    pub home: String,
    pub spread: String,
    pub total: String,
    pub away_moneyline: String,
    pub home_moneyline: String,
}

/// One leg of a parlay under construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParlayLeg {
    pub pick: String,
    pub market: String,
    /// American odds, e.g. -110 or +250.
    pub odds: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<String>,
}

/// Polymorphic widget payload, tagged by `variant` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "snake_case")]
pub enum WidgetState {
    ProgressList {
        title: String,
        status: WidgetStatus,
        caption: String,
        entries: Vec<SearchHit>,
    },
    ComparisonTable {
        title: String,
        status: WidgetStatus,
        caption: String,
        rows: Vec<OddsRow>,
    },
    InteractiveBuilder {
        title: String,
        status: WidgetStatus,
        legs: Vec<ParlayLeg>,
        stake: f64,
        /// Combined American odds across all legs.
        combined_odds: i64,
        payout: f64,
    },
    ResultCard {
        title: String,
        status: WidgetStatus,
        body: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
}

impl WidgetState {
    #[must_use]
    pub fn variant_name(&self) -> &'static str {
        match self {
            WidgetState::ProgressList { .. } => "progress_list",
            WidgetState::ComparisonTable { .. } => "comparison_table",
            WidgetState::InteractiveBuilder { .. } => "interactive_builder",
            WidgetState::ResultCard { .. } => "result_card",
        }
    }

    #[must_use]
    pub fn status(&self) -> WidgetStatus {
        match self {
            WidgetState::ProgressList { status, .. }
            | WidgetState::ComparisonTable { status, .. }
            | WidgetState::InteractiveBuilder { status, .. }
            | WidgetState::ResultCard { status, .. } => *status,
        }
    }

    fn set_status(&mut self, next: WidgetStatus) {
        match self {
            WidgetState::ProgressList { status, .. }
            | WidgetState::ComparisonTable { status, .. }
            | WidgetState::InteractiveBuilder { status, .. }
            | WidgetState::ResultCard { status, .. } => *status = next,
        }
    }
}

/// One mutation applied to a widget, tagged by `op` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WidgetPatch {
    /// Update the caption line (progress list / comparison table).
    SetCaption { caption: String },
    /// Append a result row to a progress list.
    PushEntry { entry: SearchHit },
    /// Replace the rows of a comparison table.
    SetRows { rows: Vec<OddsRow> },
    /// Replace the legs and recomputed math of an interactive builder.
    SetLegs {
        legs: Vec<ParlayLeg>,
        stake: f64,
        combined_odds: i64,
        payout: f64,
    },
    /// Replace the body of a result card.
    SetBody {
        body: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    /// Transition to the ready phase.
    MarkReady,
    /// Terminal failure state; the widget is kept, not deleted.
    MarkFailed { message: String },
}

impl WidgetPatch {
    #[must_use]
    pub fn op_name(&self) -> &'static str {
        match self {
            WidgetPatch::SetCaption { .. } => "set_caption",
            WidgetPatch::PushEntry { .. } => "push_entry",
            WidgetPatch::SetRows { .. } => "set_rows",
            WidgetPatch::SetLegs { .. } => "set_legs",
            WidgetPatch::SetBody { .. } => "set_body",
            WidgetPatch::MarkReady => "mark_ready",
            WidgetPatch::MarkFailed { .. } => "mark_failed",
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum WidgetError {
    #[error("widget {0} does not exist")]
    Unknown(String),
    #[error("widget {0} already exists")]
    Duplicate(String),
    #[error("widget {0} is frozen")]
    Frozen(String),
    #[error("patch {op} does not apply to a {variant} widget")]
    PatchMismatch { variant: &'static str, op: &'static str },
}

fn apply_patch(state: &mut WidgetState, patch: WidgetPatch) -> Result<(), WidgetError> {
    let op = patch.op_name();
    match patch {
        WidgetPatch::MarkReady => {
            state.set_status(WidgetStatus::Ready);
            Ok(())
        }
        WidgetPatch::MarkFailed { message } => {
            state.set_status(WidgetStatus::Failed);
            match state {
                WidgetState::ProgressList { caption, .. }
                | WidgetState::ComparisonTable { caption, .. } => *caption = message,
                WidgetState::ResultCard { body, .. } => *body = message,
                WidgetState::InteractiveBuilder { .. } => {}
            }
            Ok(())
        }
        WidgetPatch::SetCaption { caption } => match state {
            WidgetState::ProgressList { caption: c, .. }
            | WidgetState::ComparisonTable { caption: c, .. } => {
                *c = caption;
                Ok(())
            }
            _ => Err(WidgetError::PatchMismatch {
                variant: state.variant_name(),
                op,
            }),
        },
        WidgetPatch::PushEntry { entry } => match state {
            WidgetState::ProgressList { entries, .. } => {
                entries.push(entry);
                Ok(())
            }
            _ => Err(WidgetError::PatchMismatch {
                variant: state.variant_name(),
                op,
            }),
        },
        WidgetPatch::SetRows { rows } => match state {
            WidgetState::ComparisonTable { rows: r, .. } => {
                *r = rows;
                Ok(())
            }
            _ => Err(WidgetError::PatchMismatch {
                variant: state.variant_name(),
                op,
            }),
        },
        WidgetPatch::SetLegs {
            legs,
            stake,
            combined_odds,
            payout,
        } => match state {
            WidgetState::InteractiveBuilder {
                legs: l,
                stake: s,
                combined_odds: c,
                payout: p,
                ..
            } => {
                *l = legs;
                *s = stake;
                *c = combined_odds;
                *p = payout;
                Ok(())
            }
            _ => Err(WidgetError::PatchMismatch {
                variant: state.variant_name(),
                op,
            }),
        },
        WidgetPatch::SetBody { body, source } => match state {
            WidgetState::ResultCard {
                body: b, source: s, ..
            } => {
                *b = body;
                *s = source;
                Ok(())
            }
            _ => Err(WidgetError::PatchMismatch {
                variant: state.variant_name(),
                op,
            }),
        },
    }
}

struct TrackedWidget {
    state: WidgetState,
    frozen: bool,
    /// Whether a first snapshot has been written to the store.
    persisted: bool,
}

/// Authoritative latest widget state per id, scoped to one turn.
#[derive(Default)]
pub struct WidgetTracker {
    widgets: HashMap<String, TrackedWidget>,
}

impl WidgetTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a widget with its initial state. Ids are unique per turn.
    pub fn create(&mut self, id: &str, initial: WidgetState) -> Result<WidgetState, WidgetError> {
        if self.widgets.contains_key(id) {
            return Err(WidgetError::Duplicate(id.to_string()));
        }
        self.widgets.insert(
            id.to_string(),
            TrackedWidget {
                state: initial.clone(),
                frozen: false,
                persisted: false,
            },
        );
        Ok(initial)
    }

    /// Apply a patch and return the resulting state.
    pub fn apply(&mut self, id: &str, patch: WidgetPatch) -> Result<WidgetState, WidgetError> {
        let tracked = self
            .widgets
            .get_mut(id)
            .ok_or_else(|| WidgetError::Unknown(id.to_string()))?;
        if tracked.frozen {
            return Err(WidgetError::Frozen(id.to_string()));
        }
        apply_patch(&mut tracked.state, patch)?;
        Ok(tracked.state.clone())
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&WidgetState> {
        self.widgets.get(id).map(|w| &w.state)
    }

    /// Whether the first snapshot for this widget has been persisted.
    #[must_use]
    pub fn is_persisted(&self, id: &str) -> bool {
        self.widgets.get(id).is_some_and(|w| w.persisted)
    }

    pub fn mark_persisted(&mut self, id: &str) {
        if let Some(w) = self.widgets.get_mut(id) {
            w.persisted = true;
        }
    }

    /// Freeze every open widget and return the final states so callers can
    /// persist each snapshot. Iteration order is unspecified.
    pub fn freeze_all(&mut self) -> Vec<(String, WidgetState)> {
        let mut out = Vec::new();
        for (id, tracked) in &mut self.widgets {
            if !tracked.frozen {
                tracked.frozen = true;
                out.push((id.clone(), tracked.state.clone()));
            }
        }
        out
    }
}
