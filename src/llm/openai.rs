//! OpenAI Chat Completions backend.
//!
//! Streaming goes through `reqwest-eventsource`; one-shot completions go
//! through a rig agent.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use reqwest_eventsource::{Error as EventSourceError, Event, EventSource, retry};
use rig::client::CompletionClient;
use rig::completion::Prompt;
use rig::providers::openai;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::traits::{ChunkStream, CompletionBackend, CompletionRequest, ModelTier, PromptMessage};
use super::LlmError;
use crate::events::DONE_SENTINEL;
use crate::storage::AiConfig;

pub struct OpenAiBackend {
    http: Client,
    agents: openai::Client,
    api_key: String,
    api_base: String,
    code_model: String,
    chat_model: String,
}

impl OpenAiBackend {
    pub fn new(config: &AiConfig, api_key: &str) -> Result<Self, LlmError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LlmError::Config(e.to_string()))?;

        let agents = openai::Client::builder()
            .api_key(api_key)
            .base_url(&config.base_url)
            .build()
            .map_err(|e| LlmError::Config(e.to_string()))?;

        Ok(Self {
            http,
            agents,
            api_key: api_key.to_string(),
            api_base: config.base_url.trim_end_matches('/').to_string(),
            code_model: config.code_model.clone(),
            chat_model: config.chat_model.clone(),
        })
    }

    fn model(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Code => &self.code_model,
            ModelTier::Chat => &self.chat_model,
        }
    }
}

#[async_trait]
impl CompletionBackend for OpenAiBackend {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn stream(&self, request: CompletionRequest) -> Result<ChunkStream, LlmError> {
        let body = ChatBody {
            model: self.model(request.tier).to_string(),
            messages: request.messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            response_format: request
                .json_mode
                .then(|| serde_json::json!({ "type": "json_object" })),
            stream: true,
        };

        let url = format!("{}/chat/completions", self.api_base);
        log::debug!("Opening completion stream: model={} url={}", body.model, url);

        let request = self.http.post(&url).bearer_auth(&self.api_key).json(&body);
        let mut events =
            EventSource::new(request).map_err(|e| LlmError::Connection(e.to_string()))?;
        events.set_retry_policy(Box::new(retry::Never));

        // Wait for the upstream to accept the request so a refusal surfaces
        // before any bytes reach the caller.
        let mut pending = match events.next().await {
            Some(Ok(Event::Open)) => None,
            Some(Ok(Event::Message(message))) => Some(message.data),
            Some(Err(err)) => {
                events.close();
                return Err(open_error(err).await);
            }
            None => return Err(LlmError::Stream("Upstream closed before opening".to_string())),
        };

        let stream = async_stream::try_stream! {
            loop {
                let data = match pending.take() {
                    Some(data) => Some(data),
                    None => next_data(&mut events).await?,
                };
                let Some(data) = data else { break };
                if data == DONE_SENTINEL {
                    break;
                }
                if let Some(content) = delta_content(&data)? {
                    yield content;
                }
            }
            events.close();
        };

        Ok(Box::pin(stream))
    }

    async fn complete(&self, request: CompletionRequest) -> Result<String, LlmError> {
        let prompt = request
            .last_user()
            .ok_or_else(|| LlmError::Completion("No user message".to_string()))?
            .to_string();

        let mut builder = self
            .agents
            .agent(self.model(request.tier))
            .preamble(request.system().unwrap_or_default());
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(temperature as f64);
        }
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(max_tokens as u64);
        }
        if request.json_mode {
            builder = builder.additional_params(serde_json::json!({
                "response_format": { "type": "json_object" }
            }));
        }
        let agent = builder.build();

        agent
            .prompt(prompt.as_str())
            .await
            .map_err(|e| LlmError::Completion(e.to_string()))
    }
}

/// Text carried by one streamed chunk, `None` for role-only and empty deltas.
fn delta_content(data: &str) -> Result<Option<String>, LlmError> {
    let chunk: ChatChunk = serde_json::from_str(data)
        .map_err(|e| LlmError::Parse(format!("Failed to parse chunk: {}", e)))?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|content| !content.is_empty()))
}

/// Payload of the next upstream message, `None` once the stream ends.
async fn next_data(events: &mut EventSource) -> Result<Option<String>, LlmError> {
    loop {
        match events.next().await {
            Some(Ok(Event::Open)) => continue,
            Some(Ok(Event::Message(message))) => return Ok(Some(message.data)),
            Some(Err(EventSourceError::StreamEnded)) | None => return Ok(None),
            Some(Err(err)) => {
                events.close();
                return Err(LlmError::Stream(err.to_string()));
            }
        }
    }
}

async fn open_error(err: EventSourceError) -> LlmError {
    match err {
        EventSourceError::InvalidStatusCode(status, response) => LlmError::Api {
            status: status.as_u16(),
            message: response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_string()),
        },
        other => LlmError::Connection(other.to_string()),
    }
}

#[derive(Debug, Serialize)]
struct ChatBody {
    model: String,
    messages: Vec<PromptMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}
