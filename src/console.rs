//! Interactive terminal front-end.
//!
//! Lines starting with `/` are commands; anything else is sent to the model
//! in the active conversation.

use std::io::{self, Write};
use std::str::FromStr;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::broadcast::error::RecvError;

use crate::chat::exchange::{ChatSession, SendOutcome, SendRejection};
use crate::chat::ids::ConversationId;
use crate::chat::manager::ChatEvent;
use crate::chat::thinking::thinking_transcript;
use crate::chat::types::{Conversation, Message, Role};

const HELP: &str = "\
Commands:
  /new               start a new conversation
  /list              list conversations, most recent first
  /switch <n|id>     make a conversation active
  /rename <title>    rename the active conversation
  /delete [n|id]     delete a conversation (default: active)
  /clear             remove all messages from the active conversation
  /history           print the active conversation
  /help              show this help
  /quit              exit
Anything else is sent as a message.";

/// One parsed input line.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command {
    /// Blank line.
    Empty,
    /// Text for the model.
    Send(String),
    /// `/new`
    New,
    /// `/list`
    List,
    /// `/switch <target>`
    Switch(String),
    /// `/rename <title>`; the title may be empty.
    Rename(String),
    /// `/delete [target]`
    Delete(Option<String>),
    /// `/clear`
    Clear,
    /// `/history`
    History,
    /// `/help`
    Help,
    /// `/quit` or `/exit`
    Quit,
    /// A command that needs an argument was given none.
    MissingArgument(&'static str),
    /// Unrecognized `/word`.
    Unknown(String),
}

/// Parse one line of console input.
#[must_use]
pub fn parse_command(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() {
        return Command::Empty;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Command::Send(line.to_string());
    };

    let (name, arg) = rest
        .split_once(char::is_whitespace)
        .map_or((rest, ""), |(name, arg)| (name, arg.trim()));
    let arg = (!arg.is_empty()).then(|| arg.to_string());

    match name.to_ascii_lowercase().as_str() {
        "new" => Command::New,
        "list" | "ls" => Command::List,
        "switch" => arg.map_or(Command::MissingArgument("/switch <n|id>"), Command::Switch),
        "rename" => Command::Rename(arg.unwrap_or_default()),
        "delete" | "rm" => Command::Delete(arg),
        "clear" => Command::Clear,
        "history" => Command::History,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        _ => Command::Unknown(name.to_string()),
    }
}

/// Console bound to a session and an output sink.
pub struct Console<W> {
    session: Arc<ChatSession>,
    out: W,
}

impl<W: Write> Console<W> {
    /// Create a console writing to `out`.
    #[must_use]
    pub const fn new(session: Arc<ChatSession>, out: W) -> Self {
        Self { session, out }
    }

    /// Consume the console and return its output sink.
    #[cfg(test)]
    #[must_use]
    pub(crate) fn into_inner(self) -> W {
        self.out
    }

    /// Read commands from `input` until `/quit` or end of input.
    ///
    /// # Errors
    /// Returns an error if reading input or writing output fails.
    pub async fn run<R>(&mut self, input: R) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = input.lines();
        self.print_active().await?;

        loop {
            write!(self.out, "> ")?;
            self.out.flush()?;
            let Some(line) = lines.next_line().await? else {
                writeln!(self.out)?;
                break;
            };
            match parse_command(&line) {
                Command::Quit => break,
                command => self.execute(command).await?,
            }
        }
        Ok(())
    }

    /// Run one command.
    ///
    /// # Errors
    /// Returns an error if writing output fails.
    pub async fn execute(&mut self, command: Command) -> io::Result<()> {
        let manager = Arc::clone(self.session.manager());
        match command {
            Command::Empty | Command::Quit => Ok(()),
            Command::Send(content) => self.send(&content).await,
            Command::New => {
                manager.create_conversation().await;
                self.print_active().await
            }
            Command::List => self.print_list().await,
            Command::Switch(target) => {
                let switched = match self.resolve(&target).await {
                    Some(id) => manager.switch_conversation(id).await,
                    None => false,
                };
                if switched {
                    self.print_active().await
                } else {
                    writeln!(self.out, "No conversation matches {target:?}.")
                }
            }
            Command::Rename(title) => {
                let id = manager.active_conversation_id().await;
                manager.update_conversation_title(id, &title).await;
                let title = manager.active_conversation().await.title;
                writeln!(self.out, "Renamed to {title:?}.")
            }
            Command::Delete(target) => self.delete(target.as_deref()).await,
            Command::Clear => {
                self.session.clear_chat().await;
                writeln!(self.out, "Conversation cleared.")
            }
            Command::History => self.print_history().await,
            Command::Help => writeln!(self.out, "{HELP}"),
            Command::MissingArgument(usage) => writeln!(self.out, "Usage: {usage}"),
            Command::Unknown(name) => {
                writeln!(self.out, "Unknown command /{name}. Type /help for a list.")
            }
        }
    }

    async fn send(&mut self, content: &str) -> io::Result<()> {
        let session = Arc::clone(&self.session);
        let mut events = session.manager().subscribe();
        let send = session.send_message(content);
        tokio::pin!(send);

        let mut listening = true;
        let mut thinking_shown = false;
        let outcome = loop {
            tokio::select! {
                outcome = &mut send => break outcome,
                event = events.recv(), if listening => match event {
                    Ok(ChatEvent::ExchangeStarted(_)) if !thinking_shown => {
                        // The send still holds the pending map while it stores
                        // the user message; render from the content instead.
                        writeln!(self.out, "{}", indent(&thinking_transcript(content), "  | "))?;
                        thinking_shown = true;
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => listening = false,
                },
            }
        };

        match outcome {
            SendOutcome::Rejected(SendRejection::EmptyContent) => Ok(()),
            SendOutcome::Rejected(SendRejection::AlreadySending) => {
                writeln!(self.out, "Still waiting for the previous reply.")
            }
            SendOutcome::Discarded => writeln!(self.out, "(reply discarded)"),
            SendOutcome::Succeeded { message_id } | SendOutcome::Failed { message_id, .. } => {
                let messages = session.manager().active_messages().await;
                if let Some(message) = messages.iter().find(|m| m.id == message_id) {
                    // Fast replies can land before the started event is read.
                    if let (false, Some(thinking)) = (thinking_shown, &message.thinking) {
                        writeln!(self.out, "{}", indent(thinking, "  | "))?;
                    }
                    write_message(&mut self.out, message)?;
                }
                if let SendOutcome::Failed { kind, .. } = outcome {
                    writeln!(self.out, "  ({})", kind.label())?;
                }
                Ok(())
            }
        }
    }

    async fn delete(&mut self, target: Option<&str>) -> io::Result<()> {
        let manager = Arc::clone(self.session.manager());
        let id = match target {
            Some(target) => match self.resolve(target).await {
                Some(id) => id,
                None => return writeln!(self.out, "No conversation matches {target:?}."),
            },
            None => manager.active_conversation_id().await,
        };

        if manager.delete_conversation(id).await {
            writeln!(self.out, "Deleted conversation {}.", id.short())?;
            self.print_active().await
        } else {
            writeln!(self.out, "The last conversation cannot be deleted.")
        }
    }

    /// Map a 1-based `/list` index, a full id or an id prefix to a conversation.
    async fn resolve(&self, target: &str) -> Option<ConversationId> {
        let conversations = self.session.manager().conversations_by_recency().await;
        resolve_target(&conversations, target)
    }

    async fn print_list(&mut self) -> io::Result<()> {
        let manager = self.session.manager();
        let active = manager.active_conversation_id().await;
        let conversations = manager.conversations_by_recency().await;

        for (index, conversation) in conversations.iter().enumerate() {
            let marker = if conversation.id == active { '*' } else { ' ' };
            let busy = if self.session.is_sending(conversation.id).await {
                " [sending]"
            } else {
                ""
            };
            writeln!(
                self.out,
                "{marker} {:>2}. {} ({} messages, {}) {}{busy}",
                index + 1,
                conversation.title,
                conversation.messages.len(),
                conversation.updated_at.format("%Y-%m-%d %H:%M"),
                conversation.id.short(),
            )?;
        }
        Ok(())
    }

    async fn print_active(&mut self) -> io::Result<()> {
        let conversation = self.session.manager().active_conversation().await;
        writeln!(
            self.out,
            "== {} ({} messages) ==",
            conversation.title,
            conversation.messages.len()
        )
    }

    async fn print_history(&mut self) -> io::Result<()> {
        self.print_active().await?;
        let messages = self.session.manager().active_messages().await;
        for message in &messages {
            write_message(&mut self.out, message)?;
        }
        Ok(())
    }
}

fn resolve_target(conversations: &[Conversation], target: &str) -> Option<ConversationId> {
    let target = target.trim();
    if let Ok(index) = target.parse::<usize>() {
        return index
            .checked_sub(1)
            .and_then(|index| conversations.get(index))
            .map(|conversation| conversation.id);
    }
    if let Ok(id) = ConversationId::from_str(target) {
        return conversations
            .iter()
            .any(|conversation| conversation.id == id)
            .then_some(id);
    }

    let prefix = target.to_ascii_lowercase();
    let mut matches = conversations
        .iter()
        .filter(|conversation| conversation.id.to_string().starts_with(&prefix));
    match (matches.next(), matches.next()) {
        (Some(conversation), None) if !prefix.is_empty() => Some(conversation.id),
        _ => None,
    }
}

fn write_message<W: Write>(out: &mut W, message: &Message) -> io::Result<()> {
    let speaker = match message.role {
        Role::User => "you",
        Role::Assistant => "gemini",
    };
    writeln!(
        out,
        "[{}] {speaker}: {}",
        message.timestamp.format("%H:%M"),
        message.content
    )
}

fn indent(text: &str, prefix: &str) -> String {
    text.lines()
        .map(|line| format!("{prefix}{line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::config::ExchangeConfig;
    use crate::chat::exchange::FAILURE_REPLY;
    use crate::chat::manager::ConversationManager;
    use crate::chat::errors::ChatResult;
    use crate::chat::store::{ConversationStore, MemoryConversationStore, StoreFuture};
    use crate::llm::backend::{ChatBackend, ChatFuture, HistoryEntry};
    use crate::llm::errors::{LlmError, LlmResult};

    struct EchoBackend;

    impl ChatBackend for EchoBackend {
        fn send(&self, history: Vec<HistoryEntry>) -> ChatFuture<'_, LlmResult<String>> {
            let last = history.last().map(|entry| entry.content.clone());
            Box::pin(async move { Ok(format!("echo: {}", last.unwrap_or_default())) })
        }
    }

    struct QuotaBackend;

    impl ChatBackend for QuotaBackend {
        fn send(&self, _history: Vec<HistoryEntry>) -> ChatFuture<'_, LlmResult<String>> {
            Box::pin(async { Err(LlmError::RateLimited("quota".to_string())) })
        }
    }

    /// Yields once inside every save, like a store doing real I/O.
    #[derive(Default)]
    struct YieldingStore {
        inner: MemoryConversationStore,
    }

    impl ConversationStore for YieldingStore {
        fn load(&self) -> StoreFuture<'_, ChatResult<Vec<Conversation>>> {
            self.inner.load()
        }

        fn save(&self, conversations: &[Conversation]) -> StoreFuture<'_, ChatResult<()>> {
            let save = self.inner.save(conversations);
            Box::pin(async move {
                tokio::task::yield_now().await;
                save.await
            })
        }
    }

    async fn console_with(backend: Arc<dyn ChatBackend>) -> Console<Vec<u8>> {
        console_over(Arc::new(MemoryConversationStore::new()), backend).await
    }

    async fn console_over(
        store: Arc<dyn ConversationStore>,
        backend: Arc<dyn ChatBackend>,
    ) -> Console<Vec<u8>> {
        let config = ExchangeConfig::default();
        let manager = Arc::new(ConversationManager::load(store, &config).await);
        Console::new(Arc::new(ChatSession::new(manager, backend, &config)), Vec::new())
    }

    fn output(console: Console<Vec<u8>>) -> String {
        String::from_utf8_lossy(&console.into_inner()).into_owned()
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("   "), Command::Empty);
        assert_eq!(parse_command(" Hello "), Command::Send("Hello".to_string()));
        assert_eq!(parse_command("/new"), Command::New);
        assert_eq!(parse_command("/LIST"), Command::List);
        assert_eq!(parse_command("/switch 2"), Command::Switch("2".to_string()));
        assert_eq!(
            parse_command("/switch"),
            Command::MissingArgument("/switch <n|id>")
        );
        assert_eq!(
            parse_command("/rename  My   title "),
            Command::Rename("My   title".to_string())
        );
        assert_eq!(parse_command("/rename"), Command::Rename(String::new()));
        assert_eq!(parse_command("/delete"), Command::Delete(None));
        assert_eq!(parse_command("/rm 3"), Command::Delete(Some("3".to_string())));
        assert_eq!(parse_command("/exit"), Command::Quit);
        assert_eq!(parse_command("/frobnicate"), Command::Unknown("frobnicate".to_string()));
    }

    #[test]
    fn test_resolve_target() {
        let conversations = vec![Conversation::new(), Conversation::new()];
        let second = conversations[1].id;

        assert_eq!(resolve_target(&conversations, "2"), Some(second));
        assert_eq!(resolve_target(&conversations, "0"), None);
        assert_eq!(resolve_target(&conversations, "3"), None);
        assert_eq!(resolve_target(&conversations, &second.to_string()), Some(second));
        assert_eq!(resolve_target(&conversations, &second.short()), Some(second));
        assert_eq!(
            resolve_target(&conversations, &ConversationId::new().to_string()),
            None
        );
    }

    #[tokio::test]
    async fn test_send_prints_thinking_and_reply() {
        let mut console = console_with(Arc::new(EchoBackend)).await;
        let result = console.run(&b"Hello\n/quit\n"[..]).await;
        assert!(result.is_ok());

        let text = output(console);
        assert!(text.contains("  | Working through the query: \"Hello\""));
        assert!(text.contains("gemini: echo: Hello"));
    }

    #[tokio::test]
    async fn test_send_with_suspending_store_prints_thinking_once() {
        let store = Arc::new(YieldingStore::default());
        let mut console = console_over(store, Arc::new(EchoBackend)).await;
        let run = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            console.run(&b"Hello\n"[..]),
        )
        .await;
        assert!(matches!(run, Ok(Ok(()))));

        let text = output(console);
        assert_eq!(text.matches("Working through the query").count(), 1);
        assert!(text.contains("gemini: echo: Hello"));
    }

    #[tokio::test]
    async fn test_failed_send_prints_apology() {
        let mut console = console_with(Arc::new(QuotaBackend)).await;
        let result = console.run(&b"Hello\n"[..]).await;
        assert!(result.is_ok());

        let text = output(console);
        assert!(text.contains(FAILURE_REPLY));
        assert!(text.contains("(rate limit reached)"));
    }

    #[tokio::test]
    async fn test_conversation_commands() {
        let mut console = console_with(Arc::new(EchoBackend)).await;
        let input = b"first\n/new\nsecond\n/rename Renamed\n/list\n/switch 2\n/history\n";
        let result = console.run(&input[..]).await;
        assert!(result.is_ok());

        let manager = Arc::clone(console.session.manager());
        assert_eq!(manager.conversation_count().await, 2);
        assert_eq!(manager.active_conversation().await.title, "first");

        let text = output(console);
        assert!(text.contains("Renamed to \"Renamed\"."));
        assert!(text.contains("*  1. Renamed (2 messages"));
        assert!(text.contains("you: first"));
    }

    #[tokio::test]
    async fn test_delete_last_conversation_is_refused() {
        let mut console = console_with(Arc::new(EchoBackend)).await;
        let result = console.run(&b"/delete\n/delete 7\n"[..]).await;
        assert!(result.is_ok());

        let text = output(console);
        assert!(text.contains("The last conversation cannot be deleted."));
        assert!(text.contains("No conversation matches \"7\"."));
    }

    #[tokio::test]
    async fn test_clear_and_unknown_commands() {
        let mut console = console_with(Arc::new(EchoBackend)).await;
        let result = console.run(&b"Hello\n/clear\n/bogus\n/switch\n"[..]).await;
        assert!(result.is_ok());

        let manager = Arc::clone(console.session.manager());
        assert!(manager.active_messages().await.is_empty());

        let text = output(console);
        assert!(text.contains("Conversation cleared."));
        assert!(text.contains("Unknown command /bogus."));
        assert!(text.contains("Usage: /switch <n|id>"));
    }
}
