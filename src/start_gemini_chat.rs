//! Startup helpers for the Gemini chat console.

use std::io;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

use crate::chat::config::ChatConfig;
use crate::chat::exchange::ChatSession;
use crate::chat::manager::ConversationManager;
use crate::chat::store::JsonFileConversationStore;
use crate::console::Console;
use crate::llm::gemini::GeminiClient;

/// Run the console (used by the `gemini-chat` binary).
///
/// # Returns
/// `ExitCode::SUCCESS` when the user quits, `1` on startup failure.
#[must_use]
pub fn run() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref()))
        .with_writer(io::stderr)
        .init();

    tracing::info!("Starting Gemini chat v{}", env!("CARGO_PKG_VERSION"));

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("Failed to create runtime: {e}");
            return ExitCode::from(1);
        }
    };

    if let Err(e) = rt.block_on(run_console()) {
        tracing::error!("{e:#}");
        return ExitCode::from(1);
    }

    ExitCode::SUCCESS
}

/// Filter from `RUST_LOG`-style directives, `info` when unset or invalid.
fn log_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|raw| EnvFilter::try_new(raw).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Build the session from the environment and drive the console on stdin.
///
/// # Errors
/// Returns an error if configuration is invalid, the API key is missing,
/// or the terminal cannot be read or written.
pub async fn run_console() -> anyhow::Result<()> {
    let session = initialize(&ChatConfig::from_env()?).await?;
    let mut console = Console::new(session, io::stdout());
    console
        .run(BufReader::new(tokio::io::stdin()))
        .await
        .context("Console I/O failed")
}

/// Wire store, manager, Gemini client and session from `config`.
///
/// # Errors
/// Returns an error if `config` is invalid or no API key is configured.
pub async fn initialize(config: &ChatConfig) -> anyhow::Result<Arc<ChatSession>> {
    config.validate().context("Invalid configuration")?;

    let store = Arc::new(JsonFileConversationStore::new(&config.storage));
    tracing::info!("Conversation store: {}", store.path().display());

    let manager = Arc::new(ConversationManager::load(store, &config.exchange).await);
    let backend = GeminiClient::new(&config.gemini).context("Failed to create Gemini client")?;
    tracing::info!("Gemini model: {}", backend.model());

    Ok(Arc::new(ChatSession::new(
        manager,
        Arc::new(backend),
        &config.exchange,
    )))
}
