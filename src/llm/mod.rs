//! Upstream model providers.

mod openai;
mod scripted;
mod traits;

pub use openai::OpenAiBackend;
pub use scripted::{Script, ScriptedBackend, demo_project};
pub use traits::{ChunkStream, CompletionBackend, CompletionRequest, ModelTier, PromptMessage};

use std::sync::Arc;

use crate::storage::AiConfig;

/// Errors from completion backends.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Completion failed: {0}")]
    Completion(String),
}

/// Picks the backend from configuration: OpenAI when a key is present,
/// otherwise the built-in demo generator.
pub fn create_backend(config: &AiConfig) -> Result<Arc<dyn CompletionBackend>, LlmError> {
    match &config.api_key {
        Some(key) => {
            log::info!("LLM backend: openai at {}", config.base_url);
            Ok(Arc::new(OpenAiBackend::new(config, key)?))
        }
        None => {
            log::warn!("OPENAI_API_KEY not set, using the demo backend");
            Ok(Arc::new(ScriptedBackend::demo()))
        }
    }
}
