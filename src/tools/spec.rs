//! Tool contract shared by every concrete tool.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::widgets::{WidgetPatch, WidgetState};

/// Widget-facing progress a running tool reports mid-execution.
#[derive(Debug, Clone)]
pub enum ToolProgress {
    /// First render of the tool's widget, full initial state.
    WidgetCreated { widget: WidgetState },
    /// In-place update to the previously created widget.
    WidgetPatched { patch: WidgetPatch },
}

/// Per-invocation execution context handed to `ToolSpec::execute`.
pub struct ToolContext {
    invocation_id: String,
    progress_tx: mpsc::UnboundedSender<ToolProgress>,
    cancel: CancellationToken,
}

impl ToolContext {
    #[must_use]
    pub fn new(
        invocation_id: impl Into<String>,
        progress_tx: mpsc::UnboundedSender<ToolProgress>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            progress_tx,
            cancel,
        }
    }

    #[must_use]
    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }

    /// Announce the tool's widget with its initial state. Best-effort: a
    /// turn that stopped listening silently swallows progress.
    pub fn create_widget(&self, widget: WidgetState) {
        let _ = self
            .progress_tx
            .send(ToolProgress::WidgetCreated { widget });
    }

    /// Patch the previously announced widget.
    pub fn patch_widget(&self, patch: WidgetPatch) {
        let _ = self.progress_tx.send(ToolProgress::WidgetPatched { patch });
    }

    /// True once the turn has been cancelled. Long-running tools should
    /// check this between steps and bail with `ToolError::Cancelled`.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Structured output of a successful tool run.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    /// Fed back to the reasoner verbatim.
    pub output: Value,
    /// One-line human summary for logs.
    pub summary: String,
}

impl ToolResult {
    #[must_use]
    pub fn new(output: Value, summary: impl Into<String>) -> Self {
        Self {
            output,
            summary: summary.into(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ToolError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

impl ToolError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn execution_failed(msg: impl Into<String>) -> Self {
        Self::ExecutionFailed(msg.into())
    }
}

/// A named capability the reasoner can invoke during a turn.
#[async_trait]
pub trait ToolSpec: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the expected input object.
    fn input_schema(&self) -> Value;

    /// Per-invocation deadline. The coordinator converts an expiry into a
    /// tool failure for this invocation only.
    fn timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError>;
}

/// Extract a required string field from a tool input object.
pub fn required_str<'a>(input: &'a Value, field: &str) -> Result<&'a str, ToolError> {
    input
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ToolError::invalid_input(format!("missing required field '{field}'")))
}

/// Extract an optional string field.
pub fn optional_str<'a>(input: &'a Value, field: &str) -> Option<&'a str> {
    input.get(field).and_then(Value::as_str)
}

/// Extract an optional unsigned integer field.
pub fn optional_u64(input: &Value, field: &str) -> Option<u64> {
    input.get(field).and_then(Value::as_u64)
}

/// Extract an optional float field, accepting integers too.
pub fn optional_f64(input: &Value, field: &str) -> Option<f64> {
    input.get(field).and_then(Value::as_f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn required_str_rejects_missing_and_blank() {
        let input = json!({"query": "lakers odds", "blank": "  "});
        assert_eq!(required_str(&input, "query").unwrap(), "lakers odds");
        assert!(required_str(&input, "absent").is_err());
        assert!(required_str(&input, "blank").is_err());
    }

    #[test]
    fn optional_extractors_tolerate_absence() {
        let input = json!({"stake": 25.5, "limit": 3});
        assert_eq!(optional_f64(&input, "stake"), Some(25.5));
        assert_eq!(optional_u64(&input, "limit"), Some(3));
        assert_eq!(optional_str(&input, "sport"), None);
    }

    #[tokio::test]
    async fn context_progress_is_best_effort() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let ctx = ToolContext::new("inv_1", tx, CancellationToken::new());
        ctx.patch_widget(WidgetPatch::MarkReady);
        assert!(!ctx.is_cancelled());
    }
}
