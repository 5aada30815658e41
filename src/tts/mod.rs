//! Text-to-speech adapter boundary.
//!
//! Adapters return wire-ready audio (the format the telephony leg
//! expects); all transcoding lives inside the adapter. Streaming synthesis
//! and a dedicated low-latency filler voice are optional capabilities.

mod http;

pub use http::HttpTtsAdapter;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;

/// What a configured TTS adapter can do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TtsCapabilities {
    /// `synthesize_stream` delivers audio incrementally.
    pub streaming: bool,
    /// `synthesize_filler` uses a separate warmer, lower-latency voice.
    pub filler_voice: bool,
}

/// One synthesized utterance.
#[derive(Debug, Clone)]
pub struct SynthesizedSpeech {
    /// Wire-format audio bytes.
    pub audio: Bytes,
    /// Playback duration of `audio`.
    pub duration: Duration,
}

/// Text-to-speech provider adapter.
#[async_trait]
pub trait TtsAdapter: Send + Sync {
    fn capabilities(&self) -> TtsCapabilities {
        TtsCapabilities::default()
    }

    /// Synthesize one utterance completely.
    async fn synthesize(&self, text: &str) -> Result<SynthesizedSpeech>;

    /// Stream synthesis, delivering audio chunks as they are produced.
    ///
    /// The default implementation synthesizes in one shot and delivers a
    /// single chunk. Implementations must stop promptly when the receiver
    /// is dropped.
    async fn synthesize_stream(&self, text: &str, chunks: mpsc::Sender<Bytes>) -> Result<()> {
        let speech = self.synthesize(text).await?;
        let _ = chunks.send(speech.audio).await;
        Ok(())
    }

    /// Synthesize with the filler voice when the provider has one.
    ///
    /// The default implementation uses the main voice.
    async fn synthesize_filler(&self, text: &str) -> Result<SynthesizedSpeech> {
        self.synthesize(text).await
    }
}
