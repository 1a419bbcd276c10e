//! Durable storage for the conversation list.
//!
//! The whole list lives under one storage key as a JSON array. Dates are
//! RFC 3339 text on disk and `DateTime<Utc>` in memory. Loading never fails
//! from the caller's point of view: [`load_or_default`] falls back to a single
//! fresh conversation.

use std::collections::HashSet;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::chat::config::StorageConfig;
use crate::chat::errors::{ChatError, ChatResult};
use crate::chat::types::Conversation;

/// Boxed future type for store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Conversation list storage.
pub trait ConversationStore: Send + Sync {
    /// Read and decode the stored list.
    ///
    /// # Errors
    /// Returns an error if nothing is stored, the data is malformed, or
    /// storage access fails.
    fn load(&self) -> StoreFuture<'_, ChatResult<Vec<Conversation>>>;

    /// Overwrite the stored list.
    ///
    /// # Errors
    /// Returns an error if encoding or storage access fails.
    fn save(&self, conversations: &[Conversation]) -> StoreFuture<'_, ChatResult<()>>;
}

/// Serialize the conversation list.
///
/// # Errors
/// Returns an error if serialization fails.
pub fn encode_conversations(conversations: &[Conversation]) -> ChatResult<String> {
    Ok(serde_json::to_string(conversations)?)
}

/// Decode a stored conversation list.
///
/// # Errors
/// Returns an error if the text is not a valid list or the list is empty.
pub fn decode_conversations(raw: &str) -> ChatResult<Vec<Conversation>> {
    let conversations: Vec<Conversation> = serde_json::from_str(raw)?;
    if conversations.is_empty() {
        return Err(ChatError::EmptyStore);
    }
    Ok(dedupe_ids(conversations))
}

/// Load the stored list, or a single fresh conversation if that fails.
pub async fn load_or_default(store: &dyn ConversationStore) -> Vec<Conversation> {
    match store.load().await {
        Ok(conversations) => {
            debug!("Loaded {} conversations", conversations.len());
            conversations
        }
        Err(ChatError::MissingKey(location)) => {
            debug!("No stored conversations at {location}, starting fresh");
            vec![Conversation::new()]
        }
        Err(err) => {
            warn!("Discarding unreadable conversation store: {err}");
            vec![Conversation::new()]
        }
    }
}

/// Keep the first conversation for each id.
fn dedupe_ids(conversations: Vec<Conversation>) -> Vec<Conversation> {
    let mut seen = HashSet::with_capacity(conversations.len());
    let total = conversations.len();
    let unique: Vec<Conversation> = conversations
        .into_iter()
        .filter(|conversation| seen.insert(conversation.id))
        .collect();
    if unique.len() != total {
        warn!(
            "Dropped {} conversations with duplicate ids",
            total - unique.len()
        );
    }
    unique
}

/// Stores the list as `<data_dir>/<storage_key>.json`.
pub struct JsonFileConversationStore {
    path: PathBuf,
}

impl JsonFileConversationStore {
    /// Store backed by the file named in `config`.
    #[must_use]
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            path: config.path(),
        }
    }

    /// Store backed by an explicit file path.
    #[must_use]
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File the store reads and writes.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConversationStore for JsonFileConversationStore {
    fn load(&self) -> StoreFuture<'_, ChatResult<Vec<Conversation>>> {
        Box::pin(async move {
            let raw = match tokio::fs::read_to_string(&self.path).await {
                Ok(raw) => raw,
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    return Err(ChatError::MissingKey(self.path.display().to_string()));
                }
                Err(err) => return Err(err.into()),
            };
            decode_conversations(&raw)
        })
    }

    fn save(&self, conversations: &[Conversation]) -> StoreFuture<'_, ChatResult<()>> {
        let encoded = encode_conversations(conversations);
        Box::pin(async move {
            let raw = encoded?;
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }

            // Write-then-rename so a crash never leaves a half-written list.
            let tmp = self.path.with_extension("json.tmp");
            tokio::fs::write(&tmp, raw.as_bytes()).await?;
            tokio::fs::rename(&tmp, &self.path).await?;
            Ok(())
        })
    }
}

/// Keeps the encoded list in memory.
///
/// Goes through the same encode/decode path as the file store.
#[derive(Default)]
pub struct MemoryConversationStore {
    raw: Mutex<Option<String>>,
}

impl MemoryConversationStore {
    /// Empty store; loading it reports a missing key.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with raw text, which need not be valid.
    #[cfg(test)]
    #[must_use]
    pub(crate) fn with_raw(raw: impl Into<String>) -> Self {
        Self {
            raw: Mutex::new(Some(raw.into())),
        }
    }

    /// Current raw contents.
    pub async fn raw(&self) -> Option<String> {
        self.raw.lock().await.clone()
    }
}

impl ConversationStore for MemoryConversationStore {
    fn load(&self) -> StoreFuture<'_, ChatResult<Vec<Conversation>>> {
        Box::pin(async move {
            let guard = self.raw.lock().await;
            let raw = guard
                .as_deref()
                .ok_or_else(|| ChatError::MissingKey("memory".to_string()))?;
            decode_conversations(raw)
        })
    }

    fn save(&self, conversations: &[Conversation]) -> StoreFuture<'_, ChatResult<()>> {
        let encoded = encode_conversations(conversations);
        Box::pin(async move {
            let raw = encoded?;
            *self.raw.lock().await = Some(raw);
            Ok(())
        })
    }
}
