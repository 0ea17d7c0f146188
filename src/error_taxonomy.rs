//! Error classification used at subsystem boundaries.
//!
//! Three categories drive turn behavior: `transient` failures are retried,
//! `tool` failures are recorded on their invocation without aborting the
//! turn, and `fatal` failures error the whole turn.

use serde::{Deserialize, Serialize};

use crate::reasoner::ReasonerError;
use crate::store::StoreError;
use crate::tools::ToolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Transient,
    Tool,
    Fatal,
}

impl ErrorCategory {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Tool => "tool",
            ErrorCategory::Fatal => "fatal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Warning,
    Error,
    Critical,
}

/// Uniform error shape crossing subsystem boundaries and the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub recoverable: bool,
    pub code: String,
    pub message: String,
}

impl ErrorEnvelope {
    #[must_use]
    pub fn new(
        category: ErrorCategory,
        severity: ErrorSeverity,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            severity,
            recoverable: category != ErrorCategory::Fatal,
            code: code.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Fatal, ErrorSeverity::Critical, code, message)
    }
}

impl std::fmt::Display for ErrorEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}/{}] {}", self.category.as_str(), self.code, self.message)
    }
}

impl From<&ReasonerError> for ErrorEnvelope {
    fn from(err: &ReasonerError) -> Self {
        if err.is_transient() {
            Self::new(
                ErrorCategory::Transient,
                ErrorSeverity::Warning,
                "reasoner_transient",
                err.to_string(),
            )
        } else {
            Self::fatal("reasoner_failed", err.to_string())
        }
    }
}

impl From<&ToolError> for ErrorEnvelope {
    fn from(err: &ToolError) -> Self {
        let (code, severity) = match err {
            ToolError::InvalidInput(_) => ("tool_invalid_input", ErrorSeverity::Warning),
            ToolError::ExecutionFailed(_) => ("tool_execution_failed", ErrorSeverity::Error),
            ToolError::Timeout(_) => ("tool_timeout", ErrorSeverity::Error),
            ToolError::Cancelled => ("tool_cancelled", ErrorSeverity::Warning),
        };
        // A tool failure never aborts the turn by itself.
        Self::new(ErrorCategory::Tool, severity, code, err.to_string())
    }
}

impl From<&StoreError> for ErrorEnvelope {
    fn from(err: &StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::fatal("store_not_found", what.clone()),
            StoreError::PermissionDenied => {
                Self::fatal("store_permission_denied", "permission denied")
            }
            StoreError::Io(e) => Self::fatal("store_io", e.to_string()),
            StoreError::Serde(e) => Self::fatal("store_serde", e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn transient_reasoner_errors_are_recoverable() {
        let err = ReasonerError::Upstream {
            status: 503,
            message: "overloaded".to_string(),
        };
        let envelope = ErrorEnvelope::from(&err);
        assert_eq!(envelope.category, ErrorCategory::Transient);
        assert!(envelope.recoverable);
    }

    #[test]
    fn tool_failures_never_classify_fatal() {
        let err = ToolError::Timeout(std::time::Duration::from_secs(30));
        let envelope = ErrorEnvelope::from(&err);
        assert_eq!(envelope.category, ErrorCategory::Tool);
        assert_eq!(envelope.code, "tool_timeout");
    }

    #[test]
    fn store_failures_are_fatal() {
        let err = StoreError::PermissionDenied;
        let envelope = ErrorEnvelope::from(&err);
        assert_eq!(envelope.category, ErrorCategory::Fatal);
        assert!(!envelope.recoverable);
    }
}
