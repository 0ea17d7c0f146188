//! Reasoning-step contract and the OpenAI-compatible chat client.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::models::new_id;
use crate::tools::ToolDefinition;

/// One message of the conversation handed to the reasoner.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }

    /// Tool outcome fed back for the synthesis step. Serialized into a
    /// system message so any chat-completions upstream accepts it.
    #[must_use]
    pub fn tool_outcome(tool: &str, outcome: &Value) -> Self {
        Self {
            role: "system".to_string(),
            content: format!("Tool '{tool}' returned: {outcome}"),
        }
    }
}

/// A tool call the reasoner wants dispatched.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub invocation_id: String,
    pub tool: String,
    pub arguments: Value,
}

/// Outcome of one reasoning step.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Final assistant text; the turn moves to synthesis output.
    Reply(String),
    /// Dispatch these tools, then ask again with their results.
    ToolCalls(Vec<ToolCallRequest>),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ReasonerError {
    #[error("reasoner transport: {0}")]
    Transport(String),
    #[error("reasoner upstream {status}: {message}")]
    Upstream { status: u16, message: String },
    #[error("reasoner response malformed: {0}")]
    Malformed(String),
}

impl ReasonerError {
    /// Rate limits and server errors are worth retrying; everything else
    /// fails the turn immediately.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            ReasonerError::Transport(_) => true,
            ReasonerError::Upstream { status, .. } => *status == 429 || *status >= 500,
            ReasonerError::Malformed(_) => false,
        }
    }
}

/// One reasoning step: given the conversation so far and the available
/// tools, either reply or request tool calls.
#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn decide(
        &self,
        conversation: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<Decision, ReasonerError>;
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<RawToolCall>,
}

#[derive(Debug, Deserialize)]
struct RawToolCall {
    #[serde(default)]
    id: Option<String>,
    function: RawFunction,
}

#[derive(Debug, Deserialize)]
struct RawFunction {
    name: String,
    /// JSON-encoded argument object, per the chat-completions wire format.
    arguments: String,
}

/// Chat-completions client against any OpenAI-compatible endpoint.
pub struct ChatReasoner {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    retry: RetryPolicy,
}

impl ChatReasoner {
    #[must_use]
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        let base_url = base_url.into();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            retry,
        }
    }

    async fn send_once(
        &self,
        conversation: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<Decision, ReasonerError> {
        let mut body = json!({
            "model": self.model,
            "messages": conversation,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(
                tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.input_schema,
                            }
                        })
                    })
                    .collect(),
            );
            body["tool_choice"] = json!("auto");
        }

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ReasonerError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ReasonerError::Upstream {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ReasonerError::Malformed(e.to_string()))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ReasonerError::Malformed("no choices".to_string()))?;

        if !choice.message.tool_calls.is_empty() {
            let mut calls = Vec::with_capacity(choice.message.tool_calls.len());
            for raw in choice.message.tool_calls {
                let arguments: Value = serde_json::from_str(&raw.function.arguments)
                    .map_err(|e| ReasonerError::Malformed(format!("tool arguments: {e}")))?;
                calls.push(ToolCallRequest {
                    invocation_id: raw.id.unwrap_or_else(|| new_id("inv")),
                    tool: raw.function.name,
                    arguments,
                });
            }
            return Ok(Decision::ToolCalls(calls));
        }

        match choice.message.content {
            Some(text) if !text.is_empty() => Ok(Decision::Reply(text)),
            _ => Err(ReasonerError::Malformed(
                "neither content nor tool calls".to_string(),
            )),
        }
    }
}

#[async_trait]
impl Reasoner for ChatReasoner {
    async fn decide(
        &self,
        conversation: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<Decision, ReasonerError> {
        let mut attempt = 0;
        loop {
            match self.send_once(conversation, tools).await {
                Ok(decision) => {
                    debug!(attempt, "reasoner decision received");
                    return Ok(decision);
                }
                Err(err) if err.is_transient() && attempt < self.retry.max_retries() => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(attempt, %err, ?delay, "transient reasoner failure, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Deterministic test double: pops one pre-scripted outcome per call.
pub struct ScriptedReasoner {
    script: std::sync::Mutex<std::collections::VecDeque<Result<Decision, ReasonerError>>>,
}

impl ScriptedReasoner {
    #[must_use]
    pub fn new(outcomes: Vec<Result<Decision, ReasonerError>>) -> Self {
        Self {
            script: std::sync::Mutex::new(outcomes.into()),
        }
    }
}

#[async_trait]
impl Reasoner for ScriptedReasoner {
    async fn decide(
        &self,
        _conversation: &[ChatMessage],
        _tools: &[ToolDefinition],
    ) -> Result<Decision, ReasonerError> {
        let next = {
            let mut script = match self.script.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            script.pop_front()
        };
        next.unwrap_or_else(|| {
            Ok(Decision::Reply(
                "Nothing further scripted.".to_string(),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RetryConfig, RetryPolicy};
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries: 2,
            initial_delay_ms: 1,
            backoff_multiplier: 1.0,
            max_delay_ms: 1,
        })
    }

    fn reasoner(uri: &str) -> ChatReasoner {
        ChatReasoner::new(
            reqwest::Client::new(),
            uri,
            Some("test-key".to_string()),
            "deepseek-chat",
            fast_retry(),
        )
    }

    #[tokio::test]
    async fn parses_tool_calls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{
                    "message": {
                        "content": null,
                        "tool_calls": [{
                            "id": "call_abc",
                            "function": {
                                "name": "get_odds",
                                "arguments": "{\"sport\":\"nba\"}"
                            }
                        }]
                    }
                }]
            })))
            .mount(&server)
            .await;

        let decision = reasoner(&server.uri()).decide(&[], &[]).await.unwrap();
        match decision {
            Decision::ToolCalls(calls) => {
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].tool, "get_odds");
                assert_eq!(calls[0].invocation_id, "call_abc");
                assert_eq!(calls[0].arguments, json!({"sport": "nba"}));
            }
            other => panic!("expected tool calls, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn retries_rate_limits_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "Take the under."}}]
            })))
            .mount(&server)
            .await;

        let decision = reasoner(&server.uri()).decide(&[], &[]).await.unwrap();
        assert_eq!(decision, Decision::Reply("Take the under.".to_string()));
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
            .expect(1)
            .mount(&server)
            .await;

        let err = reasoner(&server.uri()).decide(&[], &[]).await.unwrap_err();
        assert!(matches!(err, ReasonerError::Upstream { status: 400, .. }));
        assert!(!err.is_transient());
    }
}
