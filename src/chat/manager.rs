//! In-memory conversation state with write-through persistence.
//!
//! The manager owns every conversation and the active pointer. All mutations
//! take the write lock, apply the change, mirror the full list to the store
//! and then broadcast a [`ChatEvent`]. Readers get cloned snapshots.
//!
//! The list is never empty, and the active pointer always names a
//! conversation in it.

use std::cmp::Reverse;
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast};
use tracing::{debug, error, info};

use crate::chat::config::ExchangeConfig;
use crate::chat::ids::{ConversationId, MessageId};
use crate::chat::store::{ConversationStore, load_or_default};
use crate::chat::types::{Conversation, Message, Role};
use crate::llm::backend::HistoryEntry;

/// Buffered notifications per subscriber before old ones are dropped.
const EVENT_CAPACITY: usize = 64;

/// Change notification emitted after every state mutation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChatEvent {
    /// A conversation was created and made active.
    ConversationCreated(ConversationId),
    /// The active pointer moved.
    ConversationSwitched(ConversationId),
    /// A conversation was removed.
    ConversationDeleted {
        /// Removed conversation.
        deleted: ConversationId,
        /// Active conversation after the removal.
        active: ConversationId,
    },
    /// A conversation was renamed.
    ConversationRenamed(ConversationId),
    /// A conversation lost its messages.
    ConversationCleared(ConversationId),
    /// A message was appended.
    MessageAppended {
        /// Target conversation.
        conversation_id: ConversationId,
        /// New message.
        message_id: MessageId,
        /// Its author.
        role: Role,
    },
    /// A send entered the `Sending` state; thinking text is available.
    ExchangeStarted(ConversationId),
    /// A send left the `Sending` state.
    ExchangeFinished(ConversationId),
}

struct ChatState {
    conversations: Vec<Conversation>,
    active_id: ConversationId,
}

impl ChatState {
    fn new(conversations: Vec<Conversation>) -> Self {
        let conversations = if conversations.is_empty() {
            vec![Conversation::new()]
        } else {
            conversations
        };
        let active_id = conversations[0].id;
        Self {
            conversations,
            active_id,
        }
    }

    fn position(&self, id: ConversationId) -> Option<usize> {
        self.conversations
            .iter()
            .position(|conversation| conversation.id == id)
    }

    fn get_mut(&mut self, id: ConversationId) -> Option<&mut Conversation> {
        self.conversations
            .iter_mut()
            .find(|conversation| conversation.id == id)
    }

    fn active(&self) -> &Conversation {
        let index = self.position(self.active_id).unwrap_or(0);
        &self.conversations[index]
    }
}

/// Owner of all conversations and the active pointer.
pub struct ConversationManager {
    state: RwLock<ChatState>,
    store: Arc<dyn ConversationStore>,
    events: broadcast::Sender<ChatEvent>,
    title_max_chars: usize,
}

impl ConversationManager {
    /// Restore state from `store`, falling back to one fresh conversation.
    ///
    /// The first stored conversation becomes active.
    pub async fn load(store: Arc<dyn ConversationStore>, config: &ExchangeConfig) -> Self {
        let conversations = load_or_default(store.as_ref()).await;
        info!("Restored {} conversations", conversations.len());
        Self::with_conversations(store, conversations, config)
    }

    /// Start from an explicit list; an empty list becomes one fresh conversation.
    #[must_use]
    pub fn with_conversations(
        store: Arc<dyn ConversationStore>,
        conversations: Vec<Conversation>,
        config: &ExchangeConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: RwLock::new(ChatState::new(conversations)),
            store,
            events,
            title_max_chars: config.title_max_chars,
        }
    }

    /// Receive change notifications from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    /// Create an empty conversation and make it active.
    pub async fn create_conversation(&self) -> ConversationId {
        let conversation = Conversation::new();
        let id = conversation.id;

        let mut state = self.state.write().await;
        state.conversations.push(conversation);
        state.active_id = id;
        self.persist(&state).await;
        drop(state);

        info!("Created conversation {id}");
        self.notify(ChatEvent::ConversationCreated(id));
        id
    }

    /// Make `id` active. Unknown ids are ignored.
    ///
    /// Returns whether the pointer now names `id`.
    pub async fn switch_conversation(&self, id: ConversationId) -> bool {
        let mut state = self.state.write().await;
        if state.position(id).is_none() {
            debug!("Ignoring switch to unknown conversation {id}");
            return false;
        }
        state.active_id = id;
        drop(state);

        debug!("Switched to conversation {id}");
        self.notify(ChatEvent::ConversationSwitched(id));
        true
    }

    /// Remove `id`.
    ///
    /// Refused for the last remaining conversation and ignored for unknown
    /// ids. Deleting the active conversation moves the pointer to the first
    /// remaining one under the same lock.
    pub async fn delete_conversation(&self, id: ConversationId) -> bool {
        let mut state = self.state.write().await;
        if state.conversations.len() <= 1 {
            debug!("Refusing to delete the only conversation");
            return false;
        }
        let Some(index) = state.position(id) else {
            debug!("Ignoring delete of unknown conversation {id}");
            return false;
        };

        state.conversations.remove(index);
        if state.active_id == id {
            state.active_id = state.conversations[0].id;
        }
        let active = state.active_id;
        self.persist(&state).await;
        drop(state);

        info!("Deleted conversation {id}");
        self.notify(ChatEvent::ConversationDeleted {
            deleted: id,
            active,
        });
        true
    }

    /// Rename `id`; blank titles become the untitled placeholder.
    pub async fn update_conversation_title(&self, id: ConversationId, title: &str) -> bool {
        let mut state = self.state.write().await;
        let Some(conversation) = state.get_mut(id) else {
            return false;
        };
        conversation.rename(title);
        debug!("Renamed conversation {id} to {:?}", conversation.title);
        self.persist(&state).await;
        drop(state);

        self.notify(ChatEvent::ConversationRenamed(id));
        true
    }

    /// Drop every message of `id` and restore the default title.
    pub async fn clear_conversation(&self, id: ConversationId) -> bool {
        let mut state = self.state.write().await;
        let Some(conversation) = state.get_mut(id) else {
            return false;
        };
        conversation.clear();
        self.persist(&state).await;
        drop(state);

        debug!("Cleared conversation {id}");
        self.notify(ChatEvent::ConversationCleared(id));
        true
    }

    /// Append `message` to `id` and return the resulting history.
    ///
    /// `None` if the conversation no longer exists.
    pub(crate) async fn append_message(
        &self,
        id: ConversationId,
        message: Message,
    ) -> Option<Vec<HistoryEntry>> {
        let message_id = message.id;
        let role = message.role;

        let mut state = self.state.write().await;
        let conversation = state.get_mut(id)?;
        if conversation.push_message(message, self.title_max_chars) {
            debug!("Named conversation {id} {:?}", conversation.title);
        }
        let history = conversation.history();
        self.persist(&state).await;
        drop(state);

        self.notify(ChatEvent::MessageAppended {
            conversation_id: id,
            message_id,
            role,
        });
        Some(history)
    }

    /// Identifier of the active conversation.
    pub async fn active_conversation_id(&self) -> ConversationId {
        self.state.read().await.active().id
    }

    /// Snapshot of the active conversation.
    pub async fn active_conversation(&self) -> Conversation {
        self.state.read().await.active().clone()
    }

    /// Messages of the active conversation.
    pub async fn active_messages(&self) -> Vec<Message> {
        self.state.read().await.active().messages.clone()
    }

    /// Snapshot of one conversation.
    pub async fn conversation(&self, id: ConversationId) -> Option<Conversation> {
        let state = self.state.read().await;
        state
            .conversations
            .iter()
            .find(|conversation| conversation.id == id)
            .cloned()
    }

    /// All conversations in insertion order.
    pub async fn conversations(&self) -> Vec<Conversation> {
        self.state.read().await.conversations.clone()
    }

    /// All conversations, most recently updated first.
    pub async fn conversations_by_recency(&self) -> Vec<Conversation> {
        let mut conversations = self.conversations().await;
        conversations.sort_by_key(|conversation| Reverse(conversation.updated_at));
        conversations
    }

    /// Number of conversations; always at least one.
    pub async fn conversation_count(&self) -> usize {
        self.state.read().await.conversations.len()
    }

    pub(crate) fn notify(&self, event: ChatEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn persist(&self, state: &ChatState) {
        if let Err(err) = self.store.save(&state.conversations).await {
            error!("Failed to persist conversations: {err}");
        }
    }
}
