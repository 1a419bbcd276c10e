//! Boundary between the chat workflow and a text-generation service.

use std::future::Future;
use std::pin::Pin;

use crate::chat::types::Role;
use crate::llm::errors::LlmResult;

/// Boxed future type for backend calls.
pub type ChatFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One prior turn as the model sees it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HistoryEntry {
    /// Who wrote it.
    pub role: Role,
    /// What was written.
    pub content: String,
}

impl HistoryEntry {
    /// Convenience constructor.
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Text-generation service used by the message exchange.
pub trait ChatBackend: Send + Sync {
    /// Generate the next assistant reply for `history`.
    ///
    /// `history` is in chronological order and ends with the user message
    /// being answered.
    ///
    /// # Errors
    /// Returns an error if the service cannot be reached, refuses the
    /// request, or times out.
    fn send(&self, history: Vec<HistoryEntry>) -> ChatFuture<'_, LlmResult<String>>;
}
