//! Uniform facade over the external service adapters.
//!
//! The four collaborators are capability sets: a minimum operation set
//! plus optional extras (streaming, filler voice). Feature detection runs
//! once per session and selects code paths up front instead of probing on
//! the hot path.

use crate::llm::LlmAdapter;
use crate::stt::SttAdapter;
use crate::telephony::TelephonyAdapter;
use crate::tts::TtsAdapter;
use std::sync::Arc;

/// The external collaborators of one orchestrator process.
#[derive(Clone)]
pub struct AdapterSet {
    pub telephony: Arc<dyn TelephonyAdapter>,
    pub stt: Arc<dyn SttAdapter>,
    pub llm: Arc<dyn LlmAdapter>,
    pub tts: Arc<dyn TtsAdapter>,
}

/// Capabilities detected at session start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionCapabilities {
    /// STT streams partial results; enables the short debounce.
    pub stt_partials: bool,
    /// LLM streams tokens; enables sentence-level TTS pipelining.
    pub llm_streaming: bool,
    /// TTS streams audio chunks; enables early first-byte playback.
    pub tts_streaming: bool,
    /// TTS offers a dedicated filler voice.
    pub filler_voice: bool,
}

impl SessionCapabilities {
    pub fn probe(adapters: &AdapterSet) -> Self {
        let stt = adapters.stt.capabilities();
        let tts = adapters.tts.capabilities();
        Self {
            stt_partials: stt.streaming_partials,
            llm_streaming: adapters.llm.supports_streaming(),
            tts_streaming: tts.streaming,
            filler_voice: tts.filler_voice,
        }
    }
}
