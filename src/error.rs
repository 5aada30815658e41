//! Error types for the call orchestrator.

/// Top-level error type for the voice-agent call system.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// Telephony transport error (media stream, egress).
    #[error("telephony error: {0}")]
    Telephony(String),

    /// Speech-to-text transcription error.
    #[error("STT error: {0}")]
    Stt(String),

    /// Language model generation error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Text-to-speech synthesis error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// Session state machine violation or lifecycle error.
    ///
    /// Fatal for the session: the orchestrator tears the call down but
    /// the process keeps serving other calls.
    #[error("session error: {0}")]
    Session(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Call recording error (audio or transcript persistence).
    #[error("recording error: {0}")]
    Recording(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// Requested capability is not offered by the configured adapter.
    #[error("unsupported capability: {0}")]
    Unsupported(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CallError {
    /// Whether this error must tear down the whole session rather than
    /// just failing the current turn.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Session(_))
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, CallError>;
