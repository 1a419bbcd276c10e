//! Model access: the backend trait the chat workflow talks to and the Gemini
//! implementation behind it.

pub mod backend;
pub mod errors;
pub mod gemini;

pub use backend::{ChatBackend, ChatFuture, HistoryEntry};
pub use errors::{FailureKind, LlmError, LlmResult};
pub use gemini::{GeminiClient, GenerationConfig, NO_RESPONSE_REPLY};
