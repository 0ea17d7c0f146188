//! Turn events and the per-turn stream emitter.
//!
//! Every observable effect of a turn is announced exactly once through a
//! `TurnEvent`. The emitter assigns the per-turn monotonically increasing
//! sequence number and sends best-effort: a client that went away must not
//! fail the turn, persistence already happened before the event was built.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::core::widgets::{WidgetPatch, WidgetState};
use crate::models::ThreadItem;

/// What happened, tagged by `event` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TurnEventKind {
    /// A new item entered the thread timeline (user message, tool call
    /// dispatch, widget creation, assistant reply, error item).
    ItemCreated { item: ThreadItem },
    /// A widget changed state in place. Carries the patch and the full
    /// resulting state so late joiners can render without replaying.
    WidgetPatched {
        item_id: String,
        invocation_id: String,
        patch: WidgetPatch,
        widget: WidgetState,
    },
    /// An item reached its terminal persisted form.
    ItemFinalized { item: ThreadItem },
    /// The turn failed. Always followed by nothing: terminal.
    TurnError { message: String, category: String },
    /// The turn finished cleanly. Terminal.
    TurnComplete { thread_id: String },
}

impl TurnEventKind {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TurnEventKind::TurnError { .. } | TurnEventKind::TurnComplete { .. }
        )
    }
}

/// One entry in a turn's ordered event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnEvent {
    /// Monotonically increasing within one turn, starting at 1.
    pub seq: u64,
    pub turn_id: String,
    pub thread_id: String,
    #[serde(flatten)]
    pub kind: TurnEventKind,
}

/// Assigns sequence numbers and forwards events to the turn's subscriber
/// channel. Sole producer of `TurnEvent` for its turn.
pub struct StreamEmitter {
    turn_id: String,
    thread_id: String,
    next_seq: u64,
    tx: mpsc::UnboundedSender<TurnEvent>,
}

impl StreamEmitter {
    #[must_use]
    pub fn new(
        turn_id: impl Into<String>,
        thread_id: impl Into<String>,
        tx: mpsc::UnboundedSender<TurnEvent>,
    ) -> Self {
        Self {
            turn_id: turn_id.into(),
            thread_id: thread_id.into(),
            next_seq: 1,
            tx,
        }
    }

    /// Stamp the next sequence number and send. Returns the stamped event so
    /// callers can log or persist it. A closed channel is not an error.
    pub fn emit(&mut self, kind: TurnEventKind) -> TurnEvent {
        let event = TurnEvent {
            seq: self.next_seq,
            turn_id: self.turn_id.clone(),
            thread_id: self.thread_id.clone(),
            kind,
        };
        self.next_seq += 1;
        let _ = self.tx.send(event.clone());
        event
    }
}
