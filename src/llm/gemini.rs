//! Gemini `generateContent` client.
//!
//! One non-streaming POST per reply. The whole conversation history goes out
//! with every call; the service keeps no state between requests.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::chat::config::GeminiConfig;
use crate::llm::backend::{ChatBackend, ChatFuture, HistoryEntry};
use crate::llm::errors::{LlmError, LlmResult};

/// Reply used when the service answers without any candidate text.
pub const NO_RESPONSE_REPLY: &str = "No response generated.";

/// Upstream status string for quota exhaustion.
const RESOURCE_EXHAUSTED: &str = "RESOURCE_EXHAUSTED";

/// TCP connect budget, separate from the overall request timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Sampling parameters sent with every request.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    /// Sampling temperature.
    pub temperature: f32,
    /// Nucleus sampling mass.
    pub top_p: f32,
    /// Top-k sampling width.
    pub top_k: u32,
    /// Maximum tokens generated.
    pub max_output_tokens: u32,
}

impl From<&GeminiConfig> for GenerationConfig {
    fn from(config: &GeminiConfig) -> Self {
        Self {
            temperature: config.temperature,
            top_p: config.top_p,
            top_k: config.top_k,
            max_output_tokens: config.max_output_tokens,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<WireContent<'a>>,
    generation_config: &'a GenerationConfig,
}

#[derive(Serialize)]
struct WireContent<'a> {
    role: &'static str,
    parts: Vec<WirePart<'a>>,
}

#[derive(Serialize)]
struct WirePart<'a> {
    text: &'a str,
}

impl<'a> GenerateContentRequest<'a> {
    fn new(history: &'a [HistoryEntry], generation_config: &'a GenerationConfig) -> Self {
        let contents = history
            .iter()
            .map(|entry| WireContent {
                role: entry.role.wire_name(),
                parts: vec![WirePart {
                    text: &entry.content,
                }],
            })
            .collect();
        Self {
            contents,
            generation_config,
        }
    }
}

#[derive(Deserialize)]
struct GenerateContentResponse {
    candidates: Option<Vec<Candidate>>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
    status: Option<String>,
}

/// Async Gemini client.
pub struct GeminiClient {
    client: Client,
    endpoint: Url,
    api_key: String,
    model: String,
    generation: GenerationConfig,
}

impl GeminiClient {
    /// Build a client from configuration.
    ///
    /// # Errors
    /// Returns an error if no API key is configured, the endpoint URL is
    /// invalid, or the HTTP client cannot be built.
    pub fn new(config: &GeminiConfig) -> LlmResult<Self> {
        let api_key = config
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| LlmError::ApiKeyRequired("Gemini".to_string()))?
            .to_string();

        let endpoint = generate_content_url(&config.base_url, &config.model)?;
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(config.http_timeout)
            .build()?;

        Ok(Self {
            client,
            endpoint,
            api_key,
            model: config.model.clone(),
            generation: GenerationConfig::from(config),
        })
    }

    /// Model this client talks to.
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }
}

impl ChatBackend for GeminiClient {
    fn send(&self, history: Vec<HistoryEntry>) -> ChatFuture<'_, LlmResult<String>> {
        Box::pin(async move {
            let request = GenerateContentRequest::new(&history, &self.generation);
            debug!("Sending {} messages to {}", history.len(), self.model);

            let response = self
                .client
                .post(self.endpoint.clone())
                .query(&[("key", self.api_key.as_str())])
                .json(&request)
                .send()
                .await
                .map_err(map_transport)?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                let err = map_status_error(status, &body);
                warn!("Gemini API error: {err}");
                return Err(err);
            }

            let body = response.text().await.map_err(map_transport)?;
            Ok(extract_reply(&body))
        })
    }
}

/// `{base_url}/models/{model}:generateContent`
fn generate_content_url(base_url: &str, model: &str) -> Result<Url, url::ParseError> {
    Url::parse(&format!(
        "{}/models/{model}:generateContent",
        base_url.trim_end_matches('/')
    ))
}

fn map_transport(err: reqwest::Error) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout
    } else {
        LlmError::Http(err)
    }
}

fn map_status_error(status: StatusCode, body: &str) -> LlmError {
    let envelope = serde_json::from_str::<ErrorEnvelope>(body).ok();
    let upstream_status = envelope
        .as_ref()
        .and_then(|envelope| envelope.error.status.clone())
        .unwrap_or_default();
    let message = envelope
        .and_then(|envelope| envelope.error.message)
        .filter(|message| !message.trim().is_empty())
        .or_else(|| Some(body.trim().to_string()).filter(|body| !body.is_empty()))
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("Unknown error")
                .to_string()
        });

    if status == StatusCode::TOO_MANY_REQUESTS || upstream_status == RESOURCE_EXHAUSTED {
        LlmError::RateLimited(message)
    } else {
        LlmError::Api {
            status: status.as_u16(),
            message,
        }
    }
}

/// Text of the first part of the first candidate.
///
/// A body that cannot be read as a response, or carries no candidate, yields
/// [`NO_RESPONSE_REPLY`].
fn extract_reply(body: &str) -> String {
    let response = match serde_json::from_str::<GenerateContentResponse>(body) {
        Ok(response) => response,
        Err(err) => {
            warn!("Unreadable Gemini response: {err}");
            return NO_RESPONSE_REPLY.to_string();
        }
    };

    response
        .candidates
        .and_then(|candidates| candidates.into_iter().next())
        .and_then(|candidate| candidate.content)
        .and_then(|content| content.parts.into_iter().next())
        .map_or_else(
            || NO_RESPONSE_REPLY.to_string(),
            |part| part.text.unwrap_or_default(),
        )
}
