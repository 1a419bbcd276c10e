//! Send workflow: user message in, assistant message out.
//!
//! A send runs in two phases. Phase 1 marks the conversation as sending,
//! records the thinking transcript and appends the user message; it always
//! completes before phase 2 awaits the backend. Phase 2 appends exactly one
//! assistant message (the reply, or [`FAILURE_REPLY`]) and returns the
//! conversation to idle.
//!
//! At most one send is in flight per conversation. Other conversations stay
//! readable, switchable and sendable meanwhile.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::chat::config::ExchangeConfig;
use crate::chat::ids::{ConversationId, MessageId};
use crate::chat::manager::{ChatEvent, ConversationManager};
use crate::chat::thinking::thinking_transcript;
use crate::chat::types::Message;
use crate::llm::backend::ChatBackend;
use crate::llm::errors::{FailureKind, LlmError};

/// Assistant text recorded when the backend call fails.
pub const FAILURE_REPLY: &str =
    "Sorry, I encountered an error while processing your request. Please try again.";

/// Why a send was not started.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SendRejection {
    /// Content was empty or whitespace.
    EmptyContent,
    /// The active conversation already has a send in flight.
    AlreadySending,
}

/// Result of [`ChatSession::send_message`].
///
/// Errors from the backend never escape; they show up here as
/// [`SendOutcome::Failed`] and in the conversation as [`FAILURE_REPLY`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SendOutcome {
    /// Nothing was changed.
    Rejected(SendRejection),
    /// The reply was appended.
    Succeeded {
        /// Appended assistant message.
        message_id: MessageId,
    },
    /// The failure reply was appended.
    Failed {
        /// Appended assistant message.
        message_id: MessageId,
        /// What went wrong.
        kind: FailureKind,
    },
    /// The exchange was cleared or its conversation deleted before the
    /// reply arrived; the reply was dropped.
    Discarded,
}

/// Per-conversation state while a send is in flight.
struct PendingExchange {
    ticket: u64,
    thinking: String,
}

/// Message exchange workflow over a [`ConversationManager`].
pub struct ChatSession {
    manager: Arc<ConversationManager>,
    backend: Arc<dyn ChatBackend>,
    pending: Mutex<HashMap<ConversationId, PendingExchange>>,
    next_ticket: AtomicU64,
    request_timeout: Duration,
}

impl ChatSession {
    /// Wire the workflow to its state manager and backend.
    #[must_use]
    pub fn new(
        manager: Arc<ConversationManager>,
        backend: Arc<dyn ChatBackend>,
        config: &ExchangeConfig,
    ) -> Self {
        Self {
            manager,
            backend,
            pending: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(0),
            request_timeout: config.request_timeout,
        }
    }

    /// Underlying state manager.
    #[must_use]
    pub const fn manager(&self) -> &Arc<ConversationManager> {
        &self.manager
    }

    /// Send `content` in the active conversation and wait for the reply.
    pub async fn send_message(&self, content: &str) -> SendOutcome {
        if content.trim().is_empty() {
            return SendOutcome::Rejected(SendRejection::EmptyContent);
        }

        // Phase 1: claim the conversation and append the user message under
        // one pending guard, so a clear cannot land in between.
        let conversation_id = self.manager.active_conversation_id().await;
        let thinking = thinking_transcript(content);
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let mut claimed = self.pending.lock().await;
        if claimed.contains_key(&conversation_id) {
            debug!("Rejecting overlapping send in {conversation_id}");
            return SendOutcome::Rejected(SendRejection::AlreadySending);
        }
        claimed.insert(
            conversation_id,
            PendingExchange {
                ticket,
                thinking: thinking.clone(),
            },
        );
        self.manager
            .notify(ChatEvent::ExchangeStarted(conversation_id));

        let user_history = self
            .manager
            .append_message(conversation_id, Message::user(content))
            .await;
        let Some(history) = user_history else {
            claimed.remove(&conversation_id);
            drop(claimed);
            self.manager
                .notify(ChatEvent::ExchangeFinished(conversation_id));
            return SendOutcome::Discarded;
        };
        drop(claimed);

        // Phase 2: wait for the backend without holding any lock.
        debug!(
            "Sending {} messages from {conversation_id}",
            history.len()
        );
        let result = tokio::time::timeout(self.request_timeout, self.backend.send(history))
            .await
            .unwrap_or(Err(LlmError::Timeout));

        let (reply, failure) = match result {
            Ok(text) => (Message::assistant(text, Some(thinking)), None),
            Err(err) => {
                if err.is_rate_limited() {
                    warn!("Gemini quota exhausted: {err}");
                } else {
                    warn!("Failed to get response: {err}");
                }
                (Message::assistant(FAILURE_REPLY, None), Some(err.failure_kind()))
            }
        };
        let message_id = reply.id;

        let mut pending = self.pending.lock().await;
        if !is_current(&pending, conversation_id, ticket) {
            debug!("Dropping reply for cleared exchange in {conversation_id}");
            return SendOutcome::Discarded;
        }
        let appended = self
            .manager
            .append_message(conversation_id, reply)
            .await
            .is_some();
        pending.remove(&conversation_id);
        drop(pending);
        self.manager
            .notify(ChatEvent::ExchangeFinished(conversation_id));

        match (appended, failure) {
            (false, _) => SendOutcome::Discarded,
            (true, None) => SendOutcome::Succeeded { message_id },
            (true, Some(kind)) => SendOutcome::Failed { message_id, kind },
        }
    }

    /// Empty the active conversation and drop its transient state.
    ///
    /// Legal at any time; an in-flight reply for it will be discarded.
    pub async fn clear_chat(&self) {
        let conversation_id = self.manager.active_conversation_id().await;
        let mut pending = self.pending.lock().await;
        let was_sending = pending.remove(&conversation_id).is_some();
        self.manager.clear_conversation(conversation_id).await;
        drop(pending);

        if was_sending {
            self.manager
                .notify(ChatEvent::ExchangeFinished(conversation_id));
        }
    }

    /// Whether the active conversation is waiting for a reply.
    pub async fn is_loading(&self) -> bool {
        let conversation_id = self.manager.active_conversation_id().await;
        self.is_sending(conversation_id).await
    }

    /// Whether `conversation_id` is waiting for a reply.
    pub async fn is_sending(&self, conversation_id: ConversationId) -> bool {
        self.pending.lock().await.contains_key(&conversation_id)
    }

    /// Thinking transcript of the active conversation's pending send.
    pub async fn thinking(&self) -> Option<String> {
        let conversation_id = self.manager.active_conversation_id().await;
        self.pending
            .lock()
            .await
            .get(&conversation_id)
            .map(|exchange| exchange.thinking.clone())
    }
}

fn is_current(
    pending: &HashMap<ConversationId, PendingExchange>,
    conversation_id: ConversationId,
    ticket: u64,
) -> bool {
    pending
        .get(&conversation_id)
        .is_some_and(|exchange| exchange.ticket == ticket)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use tokio::sync::{Notify, Semaphore, oneshot};

    use super::*;
    use crate::chat::errors::ChatResult;
    use crate::chat::store::{ConversationStore, MemoryConversationStore, StoreFuture};
    use crate::chat::types::{Conversation, DEFAULT_TITLE, Role};
    use crate::llm::backend::{ChatFuture, HistoryEntry};
    use crate::llm::errors::LlmResult;

    /// Replays canned results and records every history it was sent.
    #[derive(Default)]
    struct ScriptedBackend {
        replies: std::sync::Mutex<VecDeque<LlmResult<String>>>,
        seen: std::sync::Mutex<Vec<Vec<HistoryEntry>>>,
    }

    impl ScriptedBackend {
        fn with(replies: Vec<LlmResult<String>>) -> Arc<Self> {
            Arc::new(Self {
                replies: std::sync::Mutex::new(replies.into()),
                seen: std::sync::Mutex::default(),
            })
        }

        fn seen(&self) -> Vec<Vec<HistoryEntry>> {
            self.seen.lock().map(|seen| seen.clone()).unwrap_or_default()
        }
    }

    impl ChatBackend for ScriptedBackend {
        fn send(&self, history: Vec<HistoryEntry>) -> ChatFuture<'_, LlmResult<String>> {
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(history);
            }
            let next = self
                .replies
                .lock()
                .ok()
                .and_then(|mut replies| replies.pop_front())
                .unwrap_or_else(|| Ok("default reply".to_string()));
            Box::pin(async move { next })
        }
    }

    /// Blocks until released, so tests can look at the `Sending` state.
    struct GatedBackend {
        entered: Notify,
        release: std::sync::Mutex<Option<oneshot::Receiver<LlmResult<String>>>>,
    }

    impl GatedBackend {
        fn new() -> (Arc<Self>, oneshot::Sender<LlmResult<String>>) {
            let (tx, rx) = oneshot::channel();
            let backend = Arc::new(Self {
                entered: Notify::new(),
                release: std::sync::Mutex::new(Some(rx)),
            });
            (backend, tx)
        }
    }

    impl ChatBackend for GatedBackend {
        fn send(&self, _history: Vec<HistoryEntry>) -> ChatFuture<'_, LlmResult<String>> {
            let release = self.release.lock().ok().and_then(|mut slot| slot.take());
            self.entered.notify_one();
            Box::pin(async move {
                match release {
                    Some(rx) => rx.await.unwrap_or(Err(LlmError::Timeout)),
                    None => Ok("ungated".to_string()),
                }
            })
        }
    }

    /// Holds every save until permits are added.
    struct GatedStore {
        inner: MemoryConversationStore,
        saving: Notify,
        open: Semaphore,
    }

    impl ConversationStore for GatedStore {
        fn load(&self) -> StoreFuture<'_, ChatResult<Vec<Conversation>>> {
            self.inner.load()
        }

        fn save(&self, conversations: &[Conversation]) -> StoreFuture<'_, ChatResult<()>> {
            let save = self.inner.save(conversations);
            Box::pin(async move {
                self.saving.notify_one();
                if let Ok(permit) = self.open.acquire().await {
                    drop(permit);
                }
                save.await
            })
        }
    }

    async fn session_with(backend: Arc<dyn ChatBackend>) -> ChatSession {
        let config = ExchangeConfig::default();
        let store = Arc::new(MemoryConversationStore::new());
        let manager = Arc::new(ConversationManager::load(store, &config).await);
        ChatSession::new(manager, backend, &config)
    }

    #[tokio::test]
    async fn test_successful_send_appends_user_then_assistant() {
        let backend = ScriptedBackend::with(vec![Ok("Hi there!".to_string())]);
        let session = session_with(backend.clone()).await;

        let outcome = session.send_message("Hello").await;
        assert!(matches!(outcome, SendOutcome::Succeeded { .. }));

        let messages = session.manager().active_messages().await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "Hello");
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "Hi there!");
        assert_eq!(messages[1].thinking, Some(thinking_transcript("Hello")));
        assert_eq!(session.manager().active_conversation().await.title, "Hello");

        assert!(!session.is_loading().await);
        assert!(session.thinking().await.is_none());
    }

    #[tokio::test]
    async fn test_backend_sees_full_history_including_new_message() {
        let backend = ScriptedBackend::with(vec![Ok("one".to_string()), Ok("two".to_string())]);
        let session = session_with(backend.clone()).await;

        session.send_message("first").await;
        session.send_message("second").await;

        let seen = backend.seen();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], vec![HistoryEntry::new(Role::User, "first")]);
        assert_eq!(
            seen[1],
            vec![
                HistoryEntry::new(Role::User, "first"),
                HistoryEntry::new(Role::Assistant, "one"),
                HistoryEntry::new(Role::User, "second"),
            ]
        );
    }

    #[tokio::test]
    async fn test_blank_content_changes_nothing() {
        let backend = ScriptedBackend::with(Vec::new());
        let session = session_with(backend.clone()).await;
        let before = session.manager().active_conversation().await;

        for content in ["", "   ", "\n\t"] {
            assert_eq!(
                session.send_message(content).await,
                SendOutcome::Rejected(SendRejection::EmptyContent)
            );
        }

        assert_eq!(session.manager().active_conversation().await, before);
        assert!(backend.seen().is_empty());
    }

    #[tokio::test]
    async fn test_quota_failure_appends_apology() {
        let backend = ScriptedBackend::with(vec![Err(LlmError::RateLimited(
            "Resource has been exhausted".to_string(),
        ))]);
        let session = session_with(backend).await;

        let outcome = session.send_message("Hello").await;
        assert!(matches!(
            outcome,
            SendOutcome::Failed {
                kind: FailureKind::RateLimited,
                ..
            }
        ));

        let messages = session.manager().active_messages().await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, FAILURE_REPLY);
        assert!(messages[1].thinking.is_none());
        assert!(!session.is_loading().await);
    }

    #[tokio::test]
    async fn test_title_only_assigned_on_first_message() {
        let backend = ScriptedBackend::with(Vec::new());
        let session = session_with(backend).await;

        session.send_message("Hello").await;
        session
            .send_message("This message is exactly forty characters")
            .await;

        let conversation = session.manager().active_conversation().await;
        assert_eq!(conversation.title, "Hello");
        assert_eq!(conversation.messages.len(), 4);
    }

    #[tokio::test]
    async fn test_long_first_message_is_truncated() {
        let backend = ScriptedBackend::with(Vec::new());
        let session = session_with(backend).await;

        session
            .send_message("This message is exactly forty characters")
            .await;
        assert_eq!(
            session.manager().active_conversation().await.title,
            "This message is exactly forty ..."
        );
    }

    #[tokio::test]
    async fn test_loading_state_while_waiting() {
        let (backend, release) = GatedBackend::new();
        let session = Arc::new(session_with(backend.clone()).await);

        let task = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.send_message("Hello").await })
        };
        backend.entered.notified().await;

        // Phase 1 is visible before the backend answers.
        assert!(session.is_loading().await);
        assert_eq!(session.thinking().await, Some(thinking_transcript("Hello")));
        assert_eq!(session.manager().active_messages().await.len(), 1);
        assert_eq!(
            session.send_message("again").await,
            SendOutcome::Rejected(SendRejection::AlreadySending)
        );

        assert!(release.send(Ok("done".to_string())).is_ok());
        let outcome = task.await;
        assert!(matches!(outcome, Ok(SendOutcome::Succeeded { .. })));
        assert!(!session.is_loading().await);
        assert_eq!(session.manager().active_messages().await.len(), 2);
    }

    #[tokio::test]
    async fn test_other_conversations_stay_usable_while_sending() {
        let (backend, release) = GatedBackend::new();
        let session = Arc::new(session_with(backend.clone()).await);
        let busy = session.manager().active_conversation_id().await;

        let task = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.send_message("slow").await })
        };
        backend.entered.notified().await;

        let other = session.manager().create_conversation().await;
        assert!(!session.is_loading().await);
        assert!(session.is_sending(busy).await);
        assert!(matches!(
            session.send_message("fast").await,
            SendOutcome::Succeeded { .. }
        ));
        assert_eq!(
            session
                .manager()
                .conversation(other)
                .await
                .map(|conversation| conversation.messages.len()),
            Some(2)
        );

        assert!(release.send(Ok("late".to_string())).is_ok());
        assert!(matches!(task.await, Ok(SendOutcome::Succeeded { .. })));
        let busy_messages = session
            .manager()
            .conversation(busy)
            .await
            .map(|conversation| conversation.messages)
            .unwrap_or_default();
        assert_eq!(busy_messages.len(), 2);
        assert_eq!(busy_messages[1].content, "late");
    }

    #[tokio::test]
    async fn test_clear_chat_discards_in_flight_reply() {
        let (backend, release) = GatedBackend::new();
        let session = Arc::new(session_with(backend.clone()).await);

        let task = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.send_message("Hello").await })
        };
        backend.entered.notified().await;

        session.clear_chat().await;
        assert!(!session.is_loading().await);
        assert!(session.thinking().await.is_none());

        assert!(release.send(Ok("too late".to_string())).is_ok());
        assert_eq!(task.await.ok(), Some(SendOutcome::Discarded));

        let conversation = session.manager().active_conversation().await;
        assert!(conversation.messages.is_empty());
        assert_eq!(conversation.title, DEFAULT_TITLE);
    }

    #[tokio::test]
    async fn test_clear_waits_for_user_message_append() {
        let config = ExchangeConfig::default();
        let store = Arc::new(GatedStore {
            inner: MemoryConversationStore::new(),
            saving: Notify::new(),
            open: Semaphore::new(0),
        });
        let manager = Arc::new(ConversationManager::load(store.clone(), &config).await);
        let session = Arc::new(ChatSession::new(
            manager,
            ScriptedBackend::with(Vec::new()),
            &config,
        ));

        let send = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.send_message("Hello").await })
        };
        store.saving.notified().await;

        // The user message is still being stored; the exchange keeps its claim.
        assert!(session.pending.try_lock().is_err());

        let clear = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.clear_chat().await })
        };
        store.open.add_permits(64);
        assert!(send.await.is_ok());
        assert!(clear.await.is_ok());

        let messages = session.manager().active_messages().await;
        assert!(messages.is_empty(), "no user message left without a reply");
        assert!(!session.is_loading().await);
        assert!(session.thinking().await.is_none());
    }

    #[tokio::test]
    async fn test_clear_chat_when_idle() {
        let backend = ScriptedBackend::with(Vec::new());
        let session = session_with(backend).await;
        session.send_message("Hello").await;

        session.clear_chat().await;
        assert!(session.manager().active_messages().await.is_empty());
        assert!(!session.is_loading().await);
    }

    #[tokio::test]
    async fn test_request_timeout_becomes_failure() {
        struct NeverBackend;

        impl ChatBackend for NeverBackend {
            fn send(&self, _history: Vec<HistoryEntry>) -> ChatFuture<'_, LlmResult<String>> {
                Box::pin(std::future::pending())
            }
        }

        let config = ExchangeConfig {
            request_timeout: Duration::from_millis(20),
            ..ExchangeConfig::default()
        };
        let store = Arc::new(MemoryConversationStore::new());
        let manager = Arc::new(ConversationManager::load(store, &config).await);
        let session = ChatSession::new(manager, Arc::new(NeverBackend), &config);

        let outcome = session.send_message("Hello").await;
        assert!(matches!(
            outcome,
            SendOutcome::Failed {
                kind: FailureKind::Timeout,
                ..
            }
        ));
        let messages = session.manager().active_messages().await;
        assert_eq!(messages.last().map(|m| m.content.as_str()), Some(FAILURE_REPLY));
    }

    #[tokio::test]
    async fn test_exchange_events() {
        let backend = ScriptedBackend::with(Vec::new());
        let session = session_with(backend).await;
        let id = session.manager().active_conversation_id().await;
        let mut events = session.manager().subscribe();

        session.send_message("Hello").await;

        let mut received = Vec::new();
        while let Ok(event) = events.try_recv() {
            received.push(event);
        }
        assert_eq!(received.first(), Some(&ChatEvent::ExchangeStarted(id)));
        assert_eq!(received.last(), Some(&ChatEvent::ExchangeFinished(id)));
        assert_eq!(
            received
                .iter()
                .filter(|event| matches!(event, ChatEvent::MessageAppended { .. }))
                .count(),
            2
        );
    }
}
