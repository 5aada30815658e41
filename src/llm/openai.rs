//! OpenAI-compatible chat completion adapter (batch + SSE streaming).

use crate::error::{CallError, Result};
use crate::llm::sse::SseParser;
use crate::llm::{ChatMessage, GenerationOptions, LlmAdapter};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Overall request timeout for batch generation.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Chat completion adapter for OpenAI-compatible endpoints.
pub struct OpenAiChatAdapter {
    endpoint: String,
    api_key: Option<String>,
    model: String,
    client: reqwest::Client,
}

impl OpenAiChatAdapter {
    /// Create an adapter for a `/chat/completions` endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(endpoint: &str, api_key: Option<String>, model: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CallError::Llm(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            endpoint: endpoint.to_owned(),
            api_key,
            model: model.to_owned(),
            client,
        })
    }

    fn request_body(
        &self,
        messages: &[ChatMessage],
        opts: &GenerationOptions,
        stream: bool,
    ) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": opts.temperature,
            "max_tokens": opts.max_tokens,
            "stream": stream,
        })
    }

    async fn post(&self, body: serde_json::Value) -> Result<reqwest::Response> {
        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| CallError::Llm(format!("chat request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CallError::Llm(format!(
                "chat endpoint returned {status}: {body}"
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl LlmAdapter for OpenAiChatAdapter {
    fn supports_streaming(&self) -> bool {
        true
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        opts: &GenerationOptions,
    ) -> Result<String> {
        let response = self.post(self.request_body(messages, opts, false)).await?;
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CallError::Llm(format!("invalid chat response: {e}")))?;
        let text = json["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_owned();
        Ok(text)
    }

    async fn generate_stream(
        &self,
        messages: &[ChatMessage],
        opts: &GenerationOptions,
        tokens: mpsc::Sender<String>,
    ) -> Result<()> {
        let response = self.post(self.request_body(messages, opts, true)).await?;
        let mut body = response.bytes_stream();
        let mut parser = SseParser::new();
        let mut token_count = 0_usize;

        while let Some(chunk) = body.next().await {
            let chunk =
                chunk.map_err(|e| CallError::Llm(format!("chat stream failed: {e}")))?;
            for event in parser.push(&chunk) {
                if event.is_done() {
                    debug!(token_count, "chat stream complete");
                    return Ok(());
                }
                let json: serde_json::Value = match serde_json::from_str(&event.data) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("skipping malformed stream event: {e}");
                        continue;
                    }
                };
                let Some(delta) = json["choices"][0]["delta"]["content"].as_str() else {
                    continue;
                };
                if delta.is_empty() {
                    continue;
                }
                token_count += 1;
                if tokens.send(delta.to_owned()).await.is_err() {
                    // Receiver dropped: the turn was cancelled.
                    debug!(token_count, "token receiver closed, abandoning stream");
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn options() -> GenerationOptions {
        GenerationOptions {
            temperature: 0.7,
            max_tokens: 128,
        }
    }

    #[tokio::test]
    async fn batch_generation_extracts_message_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(serde_json::json!({"stream": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "Thirty dollars."}}]
            })))
            .mount(&server)
            .await;

        let adapter = OpenAiChatAdapter::new(
            &format!("{}/v1/chat/completions", server.uri()),
            Some("key".to_owned()),
            "gpt-4o-mini",
        )
        .expect("adapter");

        let text = adapter
            .generate(&[ChatMessage::user("What's the price?")], &options())
            .await
            .expect("generation");
        assert_eq!(text, "Thirty dollars.");
    }

    #[tokio::test]
    async fn streaming_delivers_token_fragments() {
        let server = MockServer::start().await;
        let sse_body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Our plans \"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"start at \"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"thirty dollars.\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({"stream": true})))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse_body, "text/event-stream"))
            .mount(&server)
            .await;

        let adapter =
            OpenAiChatAdapter::new(&server.uri(), None, "gpt-4o-mini").expect("adapter");
        let (tx, mut rx) = mpsc::channel(16);
        adapter
            .generate_stream(&[ChatMessage::user("price?")], &options(), tx)
            .await
            .expect("stream");

        let mut collected = String::new();
        while let Ok(token) = rx.try_recv() {
            collected.push_str(&token);
        }
        assert_eq!(collected, "Our plans start at thirty dollars.");
    }

    #[tokio::test]
    async fn http_error_maps_to_llm_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let adapter =
            OpenAiChatAdapter::new(&server.uri(), None, "gpt-4o-mini").expect("adapter");
        let err = adapter
            .generate(&[ChatMessage::user("hi")], &options())
            .await
            .expect_err("should fail");
        assert!(matches!(err, CallError::Llm(_)));
    }
}
