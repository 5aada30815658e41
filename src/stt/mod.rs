//! Speech-to-text adapter boundary.
//!
//! STT providers are a capability set: every adapter can transcribe a
//! complete utterance in one shot; some also offer a streaming session
//! that emits partial and final results as audio is fed in. The
//! orchestrator probes at session start and compensates for the missing
//! capability with energy-gap segmentation and a longer debounce.

mod http;
mod segmenter;

pub use http::HttpSttAdapter;
pub use segmenter::UtteranceSegmenter;

use crate::error::{CallError, Result};
use crate::pipeline::messages::SttEvent;
use crate::session::CallId;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// What a configured STT adapter can do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SttCapabilities {
    /// The adapter streams partial results (VAD happens provider-side).
    pub streaming_partials: bool,
}

/// Result of a batch transcription.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptionResult {
    pub text: String,
    pub confidence: Option<f32>,
}

/// A live streaming transcription session for one call.
#[async_trait]
pub trait SttStream: Send {
    /// Feed a chunk of wire audio.
    async fn feed(&mut self, audio: &[u8]) -> Result<()>;

    /// Close the stream; remaining audio is flushed as a final result.
    async fn finish(&mut self) -> Result<()>;
}

/// Speech-to-text provider adapter.
#[async_trait]
pub trait SttAdapter: Send + Sync {
    fn capabilities(&self) -> SttCapabilities {
        SttCapabilities::default()
    }

    /// Transcribe one complete utterance.
    async fn transcribe(&self, audio: &[u8]) -> Result<TranscriptionResult>;

    /// Open a streaming session delivering events to `events`.
    ///
    /// # Errors
    ///
    /// The default implementation reports the capability as unsupported.
    async fn start_stream(
        &self,
        call: &CallId,
        events: mpsc::Sender<SttEvent>,
    ) -> Result<Box<dyn SttStream>> {
        let _ = (call, events);
        Err(CallError::Unsupported(
            "streaming transcription".to_owned(),
        ))
    }
}
