//! HTTP batch transcription adapter.
//!
//! Posts one utterance per request as a multipart upload to an
//! OpenAI-compatible `/audio/transcriptions` endpoint and reads the
//! `text` field of the JSON response.

use crate::error::{CallError, Result};
use crate::stt::{SttAdapter, TranscriptionResult};
use async_trait::async_trait;
use reqwest::multipart;
use std::time::Duration;
use tracing::debug;

/// Request timeout; a turn is better failed than stalled.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Batch STT over HTTP.
pub struct HttpSttAdapter {
    endpoint: String,
    api_key: Option<String>,
    model: String,
    client: reqwest::Client,
}

impl HttpSttAdapter {
    /// Create an adapter for the given endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(endpoint: &str, api_key: Option<String>, model: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CallError::Stt(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            endpoint: endpoint.to_owned(),
            api_key,
            model: model.to_owned(),
            client,
        })
    }
}

#[async_trait]
impl SttAdapter for HttpSttAdapter {
    async fn transcribe(&self, audio: &[u8]) -> Result<TranscriptionResult> {
        debug!(bytes = audio.len(), "posting utterance for transcription");

        let file_part = multipart::Part::bytes(audio.to_vec())
            .file_name("utterance.ulaw")
            .mime_str("audio/basic")
            .map_err(|e| CallError::Stt(format!("invalid mime type: {e}")))?;
        let form = multipart::Form::new()
            .text("model", self.model.clone())
            .part("file", file_part);

        let mut request = self.client.post(&self.endpoint).multipart(form);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CallError::Stt(format!("transcription request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CallError::Stt(format!(
                "transcription endpoint returned {status}: {body}"
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CallError::Stt(format!("invalid transcription response: {e}")))?;
        let text = json["text"].as_str().unwrap_or_default().to_owned();
        let confidence = json["confidence"].as_f64().map(|c| c as f32);

        Ok(TranscriptionResult { text, confidence })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn transcribes_via_multipart_post() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/audio/transcriptions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "text": "what's the price",
                "confidence": 0.93,
            })))
            .mount(&server)
            .await;

        let adapter = HttpSttAdapter::new(
            &format!("{}/v1/audio/transcriptions", server.uri()),
            Some("key".to_owned()),
            "whisper-1",
        )
        .expect("adapter");

        let result = adapter.transcribe(&[0xFF; 800]).await.expect("transcription");
        assert_eq!(result.text, "what's the price");
        assert_eq!(result.confidence, Some(0.93));
    }

    #[tokio::test]
    async fn server_error_maps_to_stt_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let adapter = HttpSttAdapter::new(&server.uri(), None, "whisper-1").expect("adapter");
        let err = adapter.transcribe(&[0xFF; 160]).await.expect_err("should fail");
        assert!(matches!(err, CallError::Stt(_)));
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn missing_text_field_yields_empty_result() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let adapter = HttpSttAdapter::new(&server.uri(), None, "whisper-1").expect("adapter");
        let result = adapter.transcribe(&[0xFF; 160]).await.expect("response");
        assert!(result.text.is_empty());
        assert!(result.confidence.is_none());
    }
}
