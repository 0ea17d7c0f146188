//! Thread session management: one active turn per thread, cancellation,
//! and live event fanout.
//!
//! A turn's lifetime is detached from the client connection that started
//! it. The manager owns the spawned turn task; the per-turn receiver handed
//! back to the caller is just a window onto it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::engine::TurnEngine;
use crate::core::events::TurnEvent;
use crate::models::{Owner, ThreadRecord};
use crate::store::{Store, StoreError};

const BROADCAST_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("thread already has an active turn")]
    TurnInProgress,
    #[error(transparent)]
    Store(#[from] StoreError),
}

struct ActiveTurn {
    cancel: CancellationToken,
}

/// Live stream of one turn, plus the thread it runs on.
#[derive(Debug)]
pub struct TurnHandle {
    pub thread_id: String,
    pub events: mpsc::UnboundedReceiver<TurnEvent>,
}

pub struct ThreadSessionManager {
    engine: Arc<TurnEngine>,
    store: Arc<dyn Store>,
    active: Arc<Mutex<HashMap<String, ActiveTurn>>>,
    fanout: broadcast::Sender<TurnEvent>,
}

impl ThreadSessionManager {
    #[must_use]
    pub fn new(engine: Arc<TurnEngine>, store: Arc<dyn Store>) -> Self {
        let (fanout, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            engine,
            store,
            active: Arc::new(Mutex::new(HashMap::new())),
            fanout,
        }
    }

    /// Start a turn on an existing thread, or on a fresh one when no id is
    /// given. Rejected while the thread already has a turn in flight.
    pub async fn start_turn(
        &self,
        owner: Owner,
        thread_id: Option<String>,
        user_message: String,
    ) -> Result<TurnHandle, SessionError> {
        let thread = match thread_id {
            Some(id) => self.store.load_thread(&owner, &id).await?,
            None => {
                // Persist up front so the returned thread id is immediately
                // usable against the recovery endpoints.
                let thread = ThreadRecord::new(&owner);
                self.store.create_or_update_thread(&owner, &thread).await?;
                thread
            }
        };

        let cancel = CancellationToken::new();
        {
            let mut active = self.active.lock().await;
            if active.contains_key(&thread.id) {
                return Err(SessionError::TurnInProgress);
            }
            active.insert(
                thread.id.clone(),
                ActiveTurn {
                    cancel: cancel.clone(),
                },
            );
        }

        let (engine_tx, mut engine_rx) = mpsc::unbounded_channel::<TurnEvent>();
        let (handle_tx, handle_rx) = mpsc::unbounded_channel();

        // Pump engine events to this turn's subscriber and the global
        // fanout. Both sends are best-effort.
        let fanout = self.fanout.clone();
        tokio::spawn(async move {
            while let Some(event) = engine_rx.recv().await {
                let _ = handle_tx.send(event.clone());
                let _ = fanout.send(event);
            }
        });

        let engine = Arc::clone(&self.engine);
        let active = Arc::clone(&self.active);
        let thread_id = thread.id.clone();
        let task_thread_id = thread_id.clone();
        tokio::spawn(async move {
            let phase = engine
                .run_turn(owner, thread, user_message, engine_tx, cancel)
                .await;
            debug!(thread = %task_thread_id, ?phase, "turn task finished");
            active.lock().await.remove(&task_thread_id);
        });

        info!(thread = %thread_id, "turn started");
        Ok(TurnHandle {
            thread_id,
            events: handle_rx,
        })
    }

    /// Cancel the active turn on a thread. Returns false when idle.
    pub async fn cancel_turn(&self, thread_id: &str) -> bool {
        let active = self.active.lock().await;
        match active.get(thread_id) {
            Some(turn) => {
                turn.cancel.cancel();
                info!(thread = %thread_id, "turn cancellation requested");
                true
            }
            None => false,
        }
    }

    pub async fn has_active_turn(&self, thread_id: &str) -> bool {
        self.active.lock().await.contains_key(thread_id)
    }

    /// Subscribe to events of every turn across all threads.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TurnEvent> {
        self.fanout.subscribe()
    }
}
