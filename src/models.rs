//! Persistent data model: threads, thread items, attachments, and the
//! caller identity every row is scoped to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::core::widgets::WidgetState;

/// Generate a prefixed identifier, e.g. `thr_1f2e3d4c5b6a`.
#[must_use]
pub fn new_id(prefix: &str) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}", &hex[..12])
}

/// Privilege level attached to a caller identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Privilege {
    User,
    Service,
}

/// Caller identity. Every store operation is checked against the owner
/// recorded on the row unless the caller holds service privilege.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub user_id: String,
    pub privilege: Privilege,
}

impl Owner {
    #[must_use]
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            privilege: Privilege::User,
        }
    }

    #[must_use]
    pub fn service(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            privilege: Privilege::Service,
        }
    }

    /// Whether this caller may touch a row owned by `owner_id`.
    #[must_use]
    pub fn can_access(&self, owner_id: &str) -> bool {
        self.privilege == Privilege::Service || self.user_id == owner_id
    }
}

/// One conversation. Owner identity is immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub owner_id: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ThreadRecord {
    #[must_use]
    pub fn new(owner: &Owner) -> Self {
        let now = Utc::now();
        Self {
            id: new_id("thr"),
            title: None,
            created_at: now,
            updated_at: now,
            owner_id: owner.user_id.clone(),
            metadata: Map::new(),
        }
    }
}

/// Discriminant for the polymorphic item payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    UserMessage,
    AssistantMessage,
    ToolCall,
    Widget,
    Error,
}

/// Lifecycle status recorded on a persisted tool-call item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Running,
    Succeeded,
    Failed,
}

/// Kind-specific payload of a thread item, tagged by `kind` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemPayload {
    UserMessage {
        text: String,
    },
    AssistantMessage {
        text: String,
    },
    ToolCall {
        invocation_id: String,
        tool: String,
        arguments: Value,
        status: ToolCallStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Widget {
        invocation_id: String,
        widget: WidgetState,
        frozen: bool,
    },
    Error {
        message: String,
    },
}

impl ItemPayload {
    #[must_use]
    pub fn kind(&self) -> ItemKind {
        match self {
            ItemPayload::UserMessage { .. } => ItemKind::UserMessage,
            ItemPayload::AssistantMessage { .. } => ItemKind::AssistantMessage,
            ItemPayload::ToolCall { .. } => ItemKind::ToolCall,
            ItemPayload::Widget { .. } => ItemKind::Widget,
            ItemPayload::Error { .. } => ItemKind::Error,
        }
    }
}

/// One append-only entry in a thread's timeline. `position` is assigned by
/// the store on first append and is strictly increasing per thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadItem {
    pub id: String,
    pub thread_id: String,
    pub position: u64,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: ItemPayload,
}

impl ThreadItem {
    /// Build an item awaiting its store-assigned position.
    #[must_use]
    pub fn new(thread: &ThreadRecord, payload: ItemPayload) -> Self {
        Self {
            id: new_id("item"),
            thread_id: thread.id.clone(),
            position: 0,
            owner_id: thread.owner_id.clone(),
            created_at: Utc::now(),
            payload,
        }
    }

    #[must_use]
    pub fn kind(&self) -> ItemKind {
        self.payload.kind()
    }
}

/// Reference to externally stored binary content. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub content_kind: String,
    pub size_bytes: u64,
    pub locator: String,
    pub created_at: DateTime<Utc>,
    pub owner_id: String,
}

impl Attachment {
    #[must_use]
    pub fn new(
        owner: &Owner,
        thread_id: Option<String>,
        content_kind: impl Into<String>,
        size_bytes: u64,
        locator: impl Into<String>,
    ) -> Self {
        Self {
            id: new_id("att"),
            thread_id,
            content_kind: content_kind.into(),
            size_bytes,
            locator: locator.into(),
            created_at: Utc::now(),
            owner_id: owner.user_id.clone(),
        }
    }
}

/// Trim text to a display summary, dropping control characters.
#[must_use]
pub fn summarize_text(text: &str, limit: usize) -> String {
    let mut out = String::new();
    for ch in text.chars() {
        if out.chars().count() >= limit.saturating_sub(3) {
            out.push_str("...");
            return out;
        }
        if ch.is_control() && ch != '\n' && ch != '\t' {
            continue;
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ids_carry_prefix() {
        let id = new_id("thr");
        assert!(id.starts_with("thr_"));
        assert_eq!(id.len(), 4 + 12);
    }

    #[test]
    fn owner_scoping_allows_service_everywhere() {
        let user = Owner::user("u1");
        let service = Owner::service("svc");
        assert!(user.can_access("u1"));
        assert!(!user.can_access("u2"));
        assert!(service.can_access("u1"));
        assert!(service.can_access("u2"));
    }

    #[test]
    fn item_payload_round_trips_with_kind_tag() {
        let payload = ItemPayload::UserMessage {
            text: "show me odds".to_string(),
        };
        let raw = serde_json::to_value(&payload).unwrap();
        assert_eq!(raw["kind"], "user_message");
        let back: ItemPayload = serde_json::from_value(raw).unwrap();
        assert_eq!(back.kind(), ItemKind::UserMessage);
    }

    #[test]
    fn summarize_text_truncates() {
        let out = summarize_text("abcdefghijklmnopqrstuvwxyz", 10);
        assert_eq!(out, "abcdefg...");
    }
}
