//! Language-model adapter boundary.
//!
//! The orchestrator needs exactly two operations: generate a complete
//! response, or stream one token-by-token. Streaming is optional; the
//! default implementation falls back to batch generation and delivers the
//! whole response as one token, which the sentence splitter copes with.

mod openai;
pub mod sse;

pub use openai::OpenAiChatAdapter;

use crate::config::LlmConfig;
use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One message in the conversation sent to the model.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Sampling options passed through to the provider.
#[derive(Debug, Clone, Copy)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub max_tokens: usize,
}

impl From<&LlmConfig> for GenerationOptions {
    fn from(config: &LlmConfig) -> Self {
        Self {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }
}

/// Language-model provider adapter.
#[async_trait]
pub trait LlmAdapter: Send + Sync {
    /// Whether `generate_stream` delivers real incremental tokens.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Generate a complete response.
    async fn generate(
        &self,
        messages: &[ChatMessage],
        opts: &GenerationOptions,
    ) -> Result<String>;

    /// Stream a response as token fragments into `tokens`.
    ///
    /// The default implementation batches and sends the full text once.
    /// Implementations must stop promptly when the receiver is dropped
    /// (that is how turn cancellation propagates).
    async fn generate_stream(
        &self,
        messages: &[ChatMessage],
        opts: &GenerationOptions,
        tokens: mpsc::Sender<String>,
    ) -> Result<()> {
        let text = self.generate(messages, opts).await?;
        let _ = tokens.send(text).await;
        Ok(())
    }
}
