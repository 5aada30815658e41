//! Message types passed between session pipeline stages.

use crate::pipeline::metrics::{Bottleneck, LatencyBreakdown};
use crate::session::CallStatus;
use bytes::Bytes;
use std::time::Instant;

/// A frame of inbound caller audio (opaque wire bytes, µ-law on the PSTN).
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub audio: Bytes,
    /// Timestamp when the frame was received from telephony.
    pub received_at: Instant,
}

/// A transcription event from the STT engine.
#[derive(Debug, Clone)]
pub struct SttEvent {
    pub kind: SttEventKind,
    /// Timestamp when the event was received.
    pub at: Instant,
}

/// Partial (in-progress) or final transcription text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SttEventKind {
    Partial(String),
    Final(String),
}

impl SttEventKind {
    pub fn text(&self) -> &str {
        match self {
            Self::Partial(t) | Self::Final(t) => t,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, Self::Final(_))
    }
}

/// A sentence accumulated from LLM tokens, ready for TTS.
#[derive(Debug, Clone)]
pub struct SentenceChunk {
    /// Complete sentence text.
    pub text: String,
    /// Whether this is the last sentence of the response.
    pub is_final: bool,
}

/// What fired a barge-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BargeInTrigger {
    /// Inbound RMS exceeded the threshold during active playback.
    Energy,
    /// A final transcript arrived during active playback.
    Transcript,
}

/// Low-latency control events between stages.
///
/// `seq` identifies the turn an event belongs to; stale events from a
/// cancelled turn are ignored by comparing against the current sequence.
#[derive(Debug, Clone)]
pub enum ControlEvent {
    BargeIn {
        trigger: BargeInTrigger,
    },
    /// A pre-synthesised filler was handed to telephony.
    FillerEmitted {
        seq: u64,
        at: Instant,
    },
    /// First byte of real (sentence) agent audio was handed to telephony.
    FirstAudio {
        seq: u64,
        at: Instant,
    },
    /// The speech stage emitted all audio for the turn; caller-side
    /// playback drains at `estimated_end`.
    SpeechFlushed {
        seq: u64,
        estimated_end: Instant,
    },
    /// Synthesis or outbound send failed; the turn must fail.
    SpeechFailed {
        seq: u64,
        error: String,
    },
}

/// Observability events broadcast per session (UI, logging, tests).
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StatusChanged {
        status: CallStatus,
    },
    Transcription {
        text: String,
        is_final: bool,
    },
    UtteranceAccepted {
        text: String,
    },
    FillerEmitted {
        text: String,
    },
    AcknowledgmentEmitted {
        text: String,
    },
    AgentSentence {
        text: String,
    },
    BargeIn {
        trigger: BargeInTrigger,
    },
    TurnCompleted {
        turn_id: String,
        breakdown: LatencyBreakdown,
        bottleneck: Bottleneck,
    },
    TurnCancelled {
        turn_id: String,
    },
    TurnFailed {
        turn_id: String,
        error: String,
    },
}
