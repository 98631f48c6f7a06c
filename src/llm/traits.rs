//! Backend trait definitions.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Serialize;

use super::LlmError;
use crate::models::ChatMessage;

/// Fragments of model output in arrival order.
pub type ChunkStream = BoxStream<'static, Result<String, LlmError>>;

/// A chat-completion provider that can stream its output.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Backend name for logging and health output.
    fn name(&self) -> &'static str;

    /// Open a streaming completion. Errors here mean the upstream call never
    /// started; errors inside the stream are transport interruptions.
    async fn stream(&self, request: CompletionRequest) -> Result<ChunkStream, LlmError>;

    /// One-shot completion. The default drains [`CompletionBackend::stream`].
    async fn complete(&self, request: CompletionRequest) -> Result<String, LlmError> {
        let mut stream = self.stream(request).await?;
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            out.push_str(&chunk?);
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PromptMessage {
    pub role: String,
    pub content: String,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

impl From<&ChatMessage> for PromptMessage {
    fn from(message: &ChatMessage) -> Self {
        Self {
            role: message.role.as_str().to_string(),
            content: message.content.clone(),
        }
    }
}

/// Which configured model a request should run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    /// Large model used for project generation and refinement.
    Code,
    /// Small model used for chat and persona generation.
    Chat,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub tier: ModelTier,
    pub messages: Vec<PromptMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Ask the provider for a JSON object response.
    pub json_mode: bool,
}

impl CompletionRequest {
    pub fn new(tier: ModelTier, messages: Vec<PromptMessage>) -> Self {
        Self {
            tier,
            messages,
            max_tokens: None,
            temperature: None,
            json_mode: false,
        }
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn json(mut self) -> Self {
        self.json_mode = true;
        self
    }

    /// First system message, used as the agent preamble.
    pub fn system(&self) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| m.role == "system")
            .map(|m| m.content.as_str())
    }

    /// Last user message.
    pub fn last_user(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
    }
}
