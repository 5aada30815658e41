//! HTTP synthesis adapter.
//!
//! Posts text to a speech endpoint and reads wire-format audio from the
//! response body, either buffered or as a chunked stream. An optional
//! second endpoint serves the filler voice.

use crate::audio::duration_of_bytes;
use crate::error::{CallError, Result};
use crate::tts::{SynthesizedSpeech, TtsAdapter, TtsCapabilities};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Request timeout for one synthesis.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Speech synthesis over HTTP.
pub struct HttpTtsAdapter {
    endpoint: String,
    /// Optional endpoint for the low-latency filler voice.
    filler_endpoint: Option<String>,
    api_key: Option<String>,
    voice: String,
    /// Byte rate of the returned wire audio, for duration computation.
    bytes_per_second: u32,
    client: reqwest::Client,
}

impl HttpTtsAdapter {
    /// Create an adapter for the given synthesis endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(
        endpoint: &str,
        api_key: Option<String>,
        voice: &str,
        bytes_per_second: u32,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CallError::Tts(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            endpoint: endpoint.to_owned(),
            filler_endpoint: None,
            api_key,
            voice: voice.to_owned(),
            bytes_per_second,
            client,
        })
    }

    /// Use a dedicated endpoint (warmer voice, smaller model) for fillers.
    pub fn with_filler_endpoint(mut self, endpoint: &str) -> Self {
        self.filler_endpoint = Some(endpoint.to_owned());
        self
    }

    async fn post(&self, endpoint: &str, text: &str) -> Result<reqwest::Response> {
        let body = serde_json::json!({
            "input": text,
            "voice": self.voice,
            "response_format": "ulaw",
        });
        let mut request = self.client.post(endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| CallError::Tts(format!("synthesis request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CallError::Tts(format!(
                "synthesis endpoint returned {status}: {body}"
            )));
        }
        Ok(response)
    }

    async fn synthesize_via(&self, endpoint: &str, text: &str) -> Result<SynthesizedSpeech> {
        let response = self.post(endpoint, text).await?;
        let audio = response
            .bytes()
            .await
            .map_err(|e| CallError::Tts(format!("failed to read synthesis body: {e}")))?;
        debug!(bytes = audio.len(), "synthesized utterance");
        Ok(SynthesizedSpeech {
            duration: duration_of_bytes(audio.len(), self.bytes_per_second),
            audio,
        })
    }
}

#[async_trait]
impl TtsAdapter for HttpTtsAdapter {
    fn capabilities(&self) -> TtsCapabilities {
        TtsCapabilities {
            streaming: true,
            filler_voice: self.filler_endpoint.is_some(),
        }
    }

    async fn synthesize(&self, text: &str) -> Result<SynthesizedSpeech> {
        self.synthesize_via(&self.endpoint, text).await
    }

    async fn synthesize_stream(&self, text: &str, chunks: mpsc::Sender<Bytes>) -> Result<()> {
        let response = self.post(&self.endpoint, text).await?;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| CallError::Tts(format!("synthesis stream failed: {e}")))?;
            if chunk.is_empty() {
                continue;
            }
            if chunks.send(chunk).await.is_err() {
                // Receiver dropped: turn cancelled mid-synthesis.
                debug!("audio receiver closed, abandoning synthesis stream");
                return Ok(());
            }
        }
        Ok(())
    }

    async fn synthesize_filler(&self, text: &str) -> Result<SynthesizedSpeech> {
        match &self.filler_endpoint {
            Some(endpoint) => self.synthesize_via(endpoint, text).await,
            None => self.synthesize(text).await,
        }
    }
}
