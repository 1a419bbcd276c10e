//! Conversation and message model.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chat::ids::{ConversationId, MessageId};
use crate::llm::backend::HistoryEntry;

/// Title given to new and cleared conversations.
pub const DEFAULT_TITLE: &str = "New Chat";

/// Title used when a rename leaves nothing after trimming.
pub const UNTITLED_TITLE: &str = "Untitled Chat";

/// Appended to auto-assigned titles that were cut short.
pub const TITLE_TRUNCATION_MARKER: &str = "...";

/// Author of a message.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Typed by the person using the chat.
    User,
    /// Produced by the model (or synthesized on failure).
    #[serde(alias = "model")]
    Assistant,
}

impl Role {
    /// Stable string form for storage and display.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    /// Role name on the Gemini wire, which calls the assistant `model`.
    #[must_use]
    pub const fn wire_name(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "model",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "user" => Ok(Self::User),
            "assistant" | "model" => Ok(Self::Assistant),
            _ => Err(value.to_string()),
        }
    }
}

/// One entry of a conversation. Never modified after creation.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique message identifier.
    pub id: MessageId,
    /// Who wrote the message.
    pub role: Role,
    /// Message text.
    pub content: String,
    /// Thinking transcript shown alongside a successful assistant reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Build a user message stamped with the current time.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            role: Role::User,
            content: content.into(),
            thinking: None,
            timestamp: Utc::now(),
        }
    }

    /// Build an assistant message stamped with the current time.
    #[must_use]
    pub fn assistant(content: impl Into<String>, thinking: Option<String>) -> Self {
        Self {
            id: MessageId::new(),
            role: Role::Assistant,
            content: content.into(),
            thinking,
            timestamp: Utc::now(),
        }
    }

    /// Role and content only; what the model gets to see.
    #[must_use]
    pub fn history_entry(&self) -> HistoryEntry {
        HistoryEntry {
            role: self.role,
            content: self.content.clone(),
        }
    }
}

/// A named, ordered thread of messages.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Unique conversation identifier.
    pub id: ConversationId,
    /// Display title.
    pub title: String,
    /// Messages in append order.
    pub messages: Vec<Message>,
    /// Creation time, never changed.
    pub created_at: DateTime<Utc>,
    /// Last append, rename or clear.
    pub updated_at: DateTime<Utc>,
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

impl Conversation {
    /// Empty conversation with the default title.
    #[must_use]
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: ConversationId::new(),
            title: DEFAULT_TITLE.to_string(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a message.
    ///
    /// The first user message of an empty conversation also names it.
    /// Returns `true` when the title was assigned by this call.
    pub fn push_message(&mut self, message: Message, title_max_chars: usize) -> bool {
        let assign_title = self.messages.is_empty() && message.role == Role::User;
        if assign_title {
            self.title = derive_title(&message.content, title_max_chars);
        }
        self.messages.push(message);
        self.touch();
        assign_title
    }

    /// Rename, falling back to [`UNTITLED_TITLE`] for blank input.
    pub fn rename(&mut self, title: &str) {
        let trimmed = title.trim();
        self.title = if trimmed.is_empty() {
            UNTITLED_TITLE.to_string()
        } else {
            trimmed.to_string()
        };
        self.touch();
    }

    /// Drop every message and restore the default title.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.title = DEFAULT_TITLE.to_string();
        self.touch();
    }

    /// Ordered role/content pairs for the outbound request.
    #[must_use]
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.messages.iter().map(Message::history_entry).collect()
    }

    fn touch(&mut self) {
        let now = Utc::now();
        // Keep updated_at monotonic even if the wall clock steps back.
        if now > self.updated_at {
            self.updated_at = now;
        }
    }
}

/// Title derived from the first user message.
#[must_use]
pub fn derive_title(content: &str, max_chars: usize) -> String {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return DEFAULT_TITLE.to_string();
    }
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let mut title: String = trimmed.chars().take(max_chars).collect();
    title.push_str(TITLE_TRUNCATION_MARKER);
    title
}
