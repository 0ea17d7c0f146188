//! Turn state machine: received, planning, acting, synthesizing, done, with
//! errored reachable from every non-terminal phase.
//!
//! The engine is the single writer of turn events. Persistence happens
//! before the corresponding event is emitted, so a consumer that saw an
//! event can always recover the item from the store. Widget creation is the
//! one exception: the widget row is written lazily on the first patch or at
//! freeze, so its creation event precedes the first durable snapshot and
//! carries no store-assigned position yet. The item id is stable from
//! creation through finalization.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::coordinator::{InvocationUpdate, ToolCoordinator};
use crate::core::events::{StreamEmitter, TurnEvent, TurnEventKind};
use crate::core::widgets::{WidgetPatch, WidgetStatus, WidgetTracker};
use crate::error_taxonomy::ErrorEnvelope;
use crate::models::{
    ItemPayload, Owner, ThreadItem, ThreadRecord, ToolCallStatus, new_id, summarize_text,
};
use crate::reasoner::{ChatMessage, Decision, Reasoner};
use crate::store::Store;
use crate::tools::{ToolError, ToolProgress, ToolRegistry};

const SYSTEM_PROMPT: &str = "You are Professor Lock, a sharp and friendly sports betting \
research assistant. Use the available tools to ground every claim in current data before \
answering. Keep replies concise and never invent odds or statistics.";

const TITLE_LIMIT: usize = 60;
const MAX_TOOL_ROUNDS: usize = 4;

/// Phase of the turn state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Received,
    Planning,
    Acting,
    Synthesizing,
    Done,
    Errored,
}

pub struct TurnEngine {
    store: Arc<dyn Store>,
    reasoner: Arc<dyn Reasoner>,
    registry: Arc<ToolRegistry>,
    tool_timeout: Duration,
}

impl TurnEngine {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        reasoner: Arc<dyn Reasoner>,
        registry: Arc<ToolRegistry>,
        tool_timeout: Duration,
    ) -> Self {
        Self {
            store,
            reasoner,
            registry,
            tool_timeout,
        }
    }

    /// Drive one turn to a terminal phase. Events flow through `events`;
    /// the turn keeps running if every receiver goes away.
    pub async fn run_turn(
        &self,
        owner: Owner,
        mut thread: ThreadRecord,
        user_message: String,
        events: mpsc::UnboundedSender<TurnEvent>,
        cancel: CancellationToken,
    ) -> TurnPhase {
        let turn_id = new_id("turn");
        let mut emitter = StreamEmitter::new(turn_id.clone(), thread.id.clone(), events);
        let mut tracker = WidgetTracker::new();
        let mut widget_items = HashMap::new();
        info!(turn = %turn_id, thread = %thread.id, "turn received");

        match self
            .drive(
                &owner,
                &mut thread,
                user_message,
                &mut emitter,
                &mut tracker,
                &mut widget_items,
                &cancel,
            )
            .await
        {
            Ok(()) => {
                emitter.emit(TurnEventKind::TurnComplete {
                    thread_id: thread.id.clone(),
                });
                info!(turn = %turn_id, "turn complete");
                TurnPhase::Done
            }
            Err(envelope) => {
                self.settle_widgets(&owner, &thread, &mut tracker, &mut widget_items, &mut emitter)
                    .await;
                let item = ThreadItem::new(
                    &thread,
                    ItemPayload::Error {
                        message: envelope.message.clone(),
                    },
                );
                match self.store.append_item(&owner, &item).await {
                    Ok(stored) => {
                        emitter.emit(TurnEventKind::ItemCreated { item: stored });
                    }
                    Err(err) => warn!(%err, "failed to persist turn error item"),
                }
                emitter.emit(TurnEventKind::TurnError {
                    message: envelope.message.clone(),
                    category: envelope.category.as_str().to_string(),
                });
                warn!(turn = %turn_id, error = %envelope, "turn errored");
                TurnPhase::Errored
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        owner: &Owner,
        thread: &mut ThreadRecord,
        user_message: String,
        emitter: &mut StreamEmitter,
        tracker: &mut WidgetTracker,
        widget_items: &mut HashMap<String, ThreadItem>,
        cancel: &CancellationToken,
    ) -> Result<(), ErrorEnvelope> {
        // Received: make the thread durable, then the user message.
        if thread.title.is_none() {
            thread.title = Some(summarize_text(&user_message, TITLE_LIMIT));
        }
        thread.updated_at = chrono::Utc::now();
        self.store
            .create_or_update_thread(owner, thread)
            .await
            .map_err(|e| ErrorEnvelope::from(&e))?;
        let mut conversation = self.seed_conversation(owner, thread).await?;

        let user_item = ThreadItem::new(
            thread,
            ItemPayload::UserMessage {
                text: user_message.clone(),
            },
        );
        let stored = self
            .store
            .append_item(owner, &user_item)
            .await
            .map_err(|e| ErrorEnvelope::from(&e))?;
        emitter.emit(TurnEventKind::ItemCreated { item: stored });
        conversation.push(ChatMessage::user(user_message));
        debug!(phase = ?TurnPhase::Received, thread = %thread.id, "user message durable");

        let definitions = self.registry.definitions();
        for round in 0..=MAX_TOOL_ROUNDS {
            if cancel.is_cancelled() {
                return Err(ErrorEnvelope::fatal("turn_cancelled", "turn cancelled"));
            }
            debug!(phase = ?TurnPhase::Planning, round, "asking reasoner");
            let decision = self
                .reasoner
                .decide(&conversation, &definitions)
                .await
                .map_err(|e| ErrorEnvelope::from(&e))?;

            match decision {
                Decision::Reply(text) => {
                    debug!(phase = ?TurnPhase::Synthesizing, "assistant reply ready");
                    // Widgets freeze and finalize before the reply lands, so
                    // the stream ends user -> tools -> widgets -> reply.
                    self.settle_widgets(owner, thread, tracker, widget_items, emitter)
                        .await;
                    let item = ThreadItem::new(
                        thread,
                        ItemPayload::AssistantMessage { text: text.clone() },
                    );
                    let stored = self
                        .store
                        .append_item(owner, &item)
                        .await
                        .map_err(|e| ErrorEnvelope::from(&e))?;
                    emitter.emit(TurnEventKind::ItemCreated { item: stored });
                    return Ok(());
                }
                Decision::ToolCalls(calls) if round == MAX_TOOL_ROUNDS => {
                    warn!(requested = calls.len(), "tool round budget exhausted");
                    return Err(ErrorEnvelope::fatal(
                        "tool_rounds_exhausted",
                        "reasoner kept requesting tools past the round budget",
                    ));
                }
                Decision::ToolCalls(calls) => {
                    debug!(phase = ?TurnPhase::Acting, count = calls.len(), "dispatching tools");
                    let outcomes = self
                        .act(owner, thread, calls, emitter, tracker, widget_items, cancel)
                        .await?;
                    for (tool, outcome) in outcomes {
                        conversation.push(ChatMessage::tool_outcome(&tool, &outcome));
                    }
                }
            }
        }
        Err(ErrorEnvelope::fatal(
            "tool_rounds_exhausted",
            "reasoner kept requesting tools past the round budget",
        ))
    }

    /// Replay prior user/assistant messages into the conversation.
    async fn seed_conversation(
        &self,
        owner: &Owner,
        thread: &ThreadRecord,
    ) -> Result<Vec<ChatMessage>, ErrorEnvelope> {
        let mut conversation = vec![ChatMessage::system(SYSTEM_PROMPT)];
        let prior = self
            .store
            .list_items(owner, &thread.id, None)
            .await
            .map_err(|e| ErrorEnvelope::from(&e))?;
        for item in prior {
            match item.payload {
                ItemPayload::UserMessage { text } => conversation.push(ChatMessage::user(text)),
                ItemPayload::AssistantMessage { text } => {
                    conversation.push(ChatMessage::assistant(text));
                }
                _ => {}
            }
        }
        Ok(conversation)
    }

    /// Dispatch one batch of tool calls and drain their lifecycles. Returns
    /// the per-tool outcome values fed back to the reasoner.
    #[allow(clippy::too_many_arguments)]
    async fn act(
        &self,
        owner: &Owner,
        thread: &ThreadRecord,
        calls: Vec<crate::reasoner::ToolCallRequest>,
        emitter: &mut StreamEmitter,
        tracker: &mut WidgetTracker,
        widget_items: &mut HashMap<String, ThreadItem>,
        cancel: &CancellationToken,
    ) -> Result<Vec<(String, serde_json::Value)>, ErrorEnvelope> {
        let mut call_items: HashMap<String, ThreadItem> = HashMap::new();
        for call in &calls {
            let item = ThreadItem::new(
                thread,
                ItemPayload::ToolCall {
                    invocation_id: call.invocation_id.clone(),
                    tool: call.tool.clone(),
                    arguments: call.arguments.clone(),
                    status: ToolCallStatus::Running,
                    output: None,
                    error: None,
                },
            );
            let stored = self
                .store
                .append_item(owner, &item)
                .await
                .map_err(|e| ErrorEnvelope::from(&e))?;
            emitter.emit(TurnEventKind::ItemCreated { item: stored.clone() });
            call_items.insert(call.invocation_id.clone(), stored);
        }

        let coordinator = ToolCoordinator::new(Arc::clone(&self.registry), self.tool_timeout);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatched = coordinator.dispatch(calls, cancel, &tx);
        drop(tx);

        let mut outcomes = Vec::new();
        let mut finished = 0;
        while finished < dispatched {
            let update = tokio::select! {
                update = rx.recv() => match update {
                    Some(update) => update,
                    None => break,
                },
                () = cancel.cancelled() => {
                    return Err(ErrorEnvelope::fatal("turn_cancelled", "turn cancelled"));
                }
            };
            // Anything delivered after cancellation is discarded, never
            // applied to items or widgets.
            if cancel.is_cancelled() {
                return Err(ErrorEnvelope::fatal("turn_cancelled", "turn cancelled"));
            }
            match update {
                InvocationUpdate::Started { invocation_id, .. } => {
                    debug!(invocation = %invocation_id, "invocation started");
                }
                InvocationUpdate::Widget {
                    invocation_id,
                    progress,
                } => {
                    self.apply_progress(
                        owner,
                        thread,
                        &invocation_id,
                        progress,
                        tracker,
                        widget_items,
                        emitter,
                    )
                    .await?;
                }
                InvocationUpdate::Finished {
                    invocation_id,
                    tool,
                    result,
                } => {
                    finished += 1;
                    let outcome = match &result {
                        Ok(result) => result.output.clone(),
                        Err(err) => serde_json::json!({"error": err.to_string()}),
                    };
                    if let Err(tool_err) = &result {
                        self.fail_widget(
                            owner,
                            thread,
                            &invocation_id,
                            tool_err,
                            tracker,
                            widget_items,
                            emitter,
                        )
                        .await?;
                    }
                    if let Some(item) = call_items.get_mut(&invocation_id) {
                        item.payload = ItemPayload::ToolCall {
                            invocation_id: invocation_id.clone(),
                            tool: tool.clone(),
                            arguments: match &item.payload {
                                ItemPayload::ToolCall { arguments, .. } => arguments.clone(),
                                _ => serde_json::Value::Null,
                            },
                            status: if result.is_ok() {
                                ToolCallStatus::Succeeded
                            } else {
                                ToolCallStatus::Failed
                            },
                            output: result.as_ref().ok().map(|r| r.output.clone()),
                            error: result.as_ref().err().map(ToString::to_string),
                        };
                        let stored = self
                            .store
                            .append_item(owner, item)
                            .await
                            .map_err(|e| ErrorEnvelope::from(&e))?;
                        emitter.emit(TurnEventKind::ItemFinalized { item: stored });
                    }
                    outcomes.push((tool, outcome));
                }
            }
        }
        Ok(outcomes)
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_progress(
        &self,
        owner: &Owner,
        thread: &ThreadRecord,
        invocation_id: &str,
        progress: ToolProgress,
        tracker: &mut WidgetTracker,
        widget_items: &mut HashMap<String, ThreadItem>,
        emitter: &mut StreamEmitter,
    ) -> Result<(), ErrorEnvelope> {
        match progress {
            ToolProgress::WidgetCreated { widget } => {
                if tracker.create(invocation_id, widget.clone()).is_err() {
                    warn!(invocation = %invocation_id, "duplicate widget creation ignored");
                    return Ok(());
                }
                let item = ThreadItem::new(
                    thread,
                    ItemPayload::Widget {
                        invocation_id: invocation_id.to_string(),
                        widget,
                        frozen: false,
                    },
                );
                // Not persisted yet: the snapshot row is written lazily on
                // the first patch, or at freeze for a never-patched widget.
                emitter.emit(TurnEventKind::ItemCreated { item: item.clone() });
                widget_items.insert(invocation_id.to_string(), item);
            }
            ToolProgress::WidgetPatched { patch } => {
                let state = match tracker.apply(invocation_id, patch.clone()) {
                    Ok(state) => state,
                    Err(err) => {
                        warn!(invocation = %invocation_id, %err, "widget patch dropped");
                        return Ok(());
                    }
                };
                let Some(item) = widget_items.get_mut(invocation_id) else {
                    return Ok(());
                };
                item.payload = ItemPayload::Widget {
                    invocation_id: invocation_id.to_string(),
                    widget: state.clone(),
                    frozen: false,
                };
                if !tracker.is_persisted(invocation_id) {
                    let stored = self
                        .store
                        .upsert_widget_snapshot(owner, item)
                        .await
                        .map_err(|e| ErrorEnvelope::from(&e))?;
                    tracker.mark_persisted(invocation_id);
                    *item = stored;
                }
                emitter.emit(TurnEventKind::WidgetPatched {
                    item_id: item.id.clone(),
                    invocation_id: invocation_id.to_string(),
                    patch,
                    widget: state,
                });
            }
        }
        Ok(())
    }

    /// Mark the invocation's widget failed when the tool could not do it
    /// itself (timeout, cancellation, panic-free crash paths).
    #[allow(clippy::too_many_arguments)]
    async fn fail_widget(
        &self,
        owner: &Owner,
        thread: &ThreadRecord,
        invocation_id: &str,
        error: &ToolError,
        tracker: &mut WidgetTracker,
        widget_items: &mut HashMap<String, ThreadItem>,
        emitter: &mut StreamEmitter,
    ) -> Result<(), ErrorEnvelope> {
        let already_failed = tracker
            .get(invocation_id)
            .is_some_and(|w| w.status() == WidgetStatus::Failed);
        if tracker.get(invocation_id).is_none() || already_failed {
            return Ok(());
        }
        let patch = WidgetPatch::MarkFailed {
            message: error.to_string(),
        };
        self.apply_progress(
            owner,
            thread,
            invocation_id,
            ToolProgress::WidgetPatched { patch },
            tracker,
            widget_items,
            emitter,
        )
        .await
    }

    /// Freeze every open widget, overwrite its snapshot, and finalize it.
    /// Reuses the item id minted at creation so the write is an upsert.
    async fn settle_widgets(
        &self,
        owner: &Owner,
        thread: &ThreadRecord,
        tracker: &mut WidgetTracker,
        widget_items: &mut HashMap<String, ThreadItem>,
        emitter: &mut StreamEmitter,
    ) {
        for (invocation_id, state) in tracker.freeze_all() {
            let mut item = widget_items.remove(&invocation_id).unwrap_or_else(|| {
                ThreadItem::new(
                    thread,
                    ItemPayload::Widget {
                        invocation_id: invocation_id.clone(),
                        widget: state.clone(),
                        frozen: true,
                    },
                )
            });
            item.payload = ItemPayload::Widget {
                invocation_id: invocation_id.clone(),
                widget: state,
                frozen: true,
            };
            match self.store.upsert_widget_snapshot(owner, &item).await {
                Ok(stored) => {
                    emitter.emit(TurnEventKind::ItemFinalized { item: stored });
                }
                Err(err) => warn!(%err, invocation = %invocation_id, "widget snapshot write failed"),
            }
        }
    }
}
