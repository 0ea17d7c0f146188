//! Tool invocation coordinator: concurrent dispatch with ordered
//! per-invocation lifecycles.
//!
//! Each invocation runs on its own task. Events for one invocation always
//! arrive in order `Started`, zero or more `Widget`, `Finished`; events of
//! different invocations interleave freely on the shared channel.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::reasoner::ToolCallRequest;
use crate::tools::{ToolContext, ToolError, ToolProgress, ToolRegistry, ToolResult};

/// Lifecycle update for one tool invocation.
#[derive(Debug)]
pub enum InvocationUpdate {
    Started {
        invocation_id: String,
        tool: String,
        arguments: Value,
    },
    Widget {
        invocation_id: String,
        progress: ToolProgress,
    },
    Finished {
        invocation_id: String,
        tool: String,
        result: Result<ToolResult, ToolError>,
    },
}

impl InvocationUpdate {
    #[must_use]
    pub fn invocation_id(&self) -> &str {
        match self {
            InvocationUpdate::Started { invocation_id, .. }
            | InvocationUpdate::Widget { invocation_id, .. }
            | InvocationUpdate::Finished { invocation_id, .. } => invocation_id,
        }
    }
}

pub struct ToolCoordinator {
    registry: Arc<ToolRegistry>,
    default_timeout: Duration,
}

impl ToolCoordinator {
    #[must_use]
    pub fn new(registry: Arc<ToolRegistry>, default_timeout: Duration) -> Self {
        Self {
            registry,
            default_timeout,
        }
    }

    /// Spawn one task per request and return how many were dispatched. The
    /// caller drains `updates` until it has seen that many `Finished`.
    pub fn dispatch(
        &self,
        requests: Vec<ToolCallRequest>,
        cancel: &CancellationToken,
        updates: &mpsc::UnboundedSender<InvocationUpdate>,
    ) -> usize {
        let count = requests.len();
        for request in requests {
            let registry = Arc::clone(&self.registry);
            let cancel = cancel.clone();
            let updates = updates.clone();
            let default_timeout = self.default_timeout;
            tokio::spawn(async move {
                run_invocation(registry, request, cancel, updates, default_timeout).await;
            });
        }
        count
    }
}

async fn run_invocation(
    registry: Arc<ToolRegistry>,
    request: ToolCallRequest,
    cancel: CancellationToken,
    updates: mpsc::UnboundedSender<InvocationUpdate>,
    default_timeout: Duration,
) {
    let ToolCallRequest {
        invocation_id,
        tool: tool_name,
        arguments,
    } = request;

    let _ = updates.send(InvocationUpdate::Started {
        invocation_id: invocation_id.clone(),
        tool: tool_name.clone(),
        arguments: arguments.clone(),
    });

    let Some(tool) = registry.get(&tool_name) else {
        warn!(tool = %tool_name, "reasoner requested unknown tool");
        let _ = updates.send(InvocationUpdate::Finished {
            invocation_id,
            tool: tool_name.clone(),
            result: Err(ToolError::invalid_input(format!(
                "unknown tool '{tool_name}'"
            ))),
        });
        return;
    };

    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
    let ctx = ToolContext::new(invocation_id.clone(), progress_tx, cancel.clone());

    // Forward widget progress onto the shared channel. Ends when the
    // context (sole sender) is dropped, which is how Finished is kept
    // strictly after every Widget update.
    let forwarder = {
        let updates = updates.clone();
        let invocation_id = invocation_id.clone();
        tokio::spawn(async move {
            while let Some(progress) = progress_rx.recv().await {
                let _ = updates.send(InvocationUpdate::Widget {
                    invocation_id: invocation_id.clone(),
                    progress,
                });
            }
        })
    };

    let deadline = if tool.timeout() < default_timeout {
        tool.timeout()
    } else {
        default_timeout
    };
    let result = tokio::select! {
        outcome = tokio::time::timeout(deadline, tool.execute(arguments, &ctx)) => {
            match outcome {
                Ok(result) => result,
                Err(_) => Err(ToolError::Timeout(deadline)),
            }
        }
        () = cancel.cancelled() => Err(ToolError::Cancelled),
    };

    drop(ctx);
    let _ = forwarder.await;

    debug!(invocation = %invocation_id, tool = %tool_name, ok = result.is_ok(), "invocation finished");
    let _ = updates.send(InvocationUpdate::Finished {
        invocation_id,
        tool: tool_name,
        result,
    });
}
