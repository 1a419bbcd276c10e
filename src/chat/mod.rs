//! Chat subsystem for the Gemini front-end.
//!
//! - `types`: messages, conversations and title rules
//! - `ids`: conversation and message identifiers
//! - `config`: storage, model and exchange settings
//! - `store`: persistence of the conversation list
//! - `manager`: conversation list and active selection
//! - `exchange`: the send workflow and its transient state
//! - `thinking`: placeholder transcript shown while waiting

pub mod config;
pub mod errors;
pub mod exchange;
pub mod ids;
pub mod manager;
pub mod store;
pub mod thinking;
pub mod types;

pub use config::{ChatConfig, ExchangeConfig, GeminiConfig, StorageConfig};
pub use errors::{ChatError, ChatResult};
pub use exchange::{ChatSession, FAILURE_REPLY, SendOutcome, SendRejection};
pub use ids::{ConversationId, MessageId};
pub use manager::{ChatEvent, ConversationManager};
pub use store::{
    ConversationStore, JsonFileConversationStore, MemoryConversationStore, StoreFuture,
    load_or_default,
};
pub use thinking::thinking_transcript;
pub use types::{Conversation, DEFAULT_TITLE, Message, Role, UNTITLED_TITLE, derive_title};
