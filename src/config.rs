//! Configuration types for the call orchestrator.

use crate::error::{CallError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Top-level configuration for one orchestrator process.
///
/// Every field has a sensible default so an empty TOML file is a valid
/// configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Wire audio format settings.
    pub audio: AudioConfig,
    /// Transcription aggregation / debounce settings.
    pub aggregator: AggregatorConfig,
    /// Utterance segmentation for batch-only STT adapters.
    pub segmenter: SegmenterConfig,
    /// Barge-in (caller interrupt) detection settings.
    pub barge_in: BargeInConfig,
    /// Echo filter settings (self-transcription rejection).
    pub echo: EchoConfig,
    /// Filler and acknowledgment scheduling settings.
    pub filler: FillerConfig,
    /// Sentence segmentation of the LLM token stream.
    pub sentence: SentenceConfig,
    /// Latency thresholds for bottleneck labelling.
    pub metrics: MetricsConfig,
    /// Per-call recording settings.
    pub recording: RecordingConfig,
    /// Greeting (first agent utterance) settings.
    pub greeting: GreetingConfig,
    /// LLM generation options passed through the adapter.
    pub llm: LlmConfig,
}

impl OrchestratorConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw)
            .map_err(|e| CallError::Config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Load configuration from a TOML file, or fall back to defaults when
    /// the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error only when the file exists but cannot be parsed.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.is_file() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Write configuration to a TOML file, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = toml::to_string_pretty(self)
            .map_err(|e| CallError::Config(format!("failed to serialize config: {e}")))?;
        std::fs::write(path, raw)?;
        Ok(())
    }
}

/// Wire audio format configuration.
///
/// Telephony audio is 8kHz µ-law: one byte per sample, 8000 bytes per
/// second. The orchestrator only needs the byte rate; everything else
/// about the wire format lives below the telephony adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Audio byte rate in bytes per second.
    pub bytes_per_second: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            bytes_per_second: 8_000,
        }
    }
}

/// Transcription aggregation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Debounce interval when the STT adapter streams partial results.
    ///
    /// Partials mean voice-activity detection happens upstream, so a short
    /// settle window is enough.
    pub partial_debounce_ms: u64,
    /// Debounce interval when the STT adapter is batch-only.
    pub batch_debounce_ms: u64,
    /// Minimum partial length (chars) that counts as a continuation while
    /// a response is being generated.
    pub min_continuation_chars: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            partial_debounce_ms: 150,
            batch_debounce_ms: 800,
            min_continuation_chars: 5,
        }
    }
}

/// Utterance segmentation configuration (batch-STT mode only).
///
/// When the STT adapter offers no streaming endpoint, inbound audio is
/// chopped into utterances on energy gaps before batch transcription.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    /// RMS above which a frame counts as speech.
    pub speech_rms_threshold: f32,
    /// Silence gap that ends an utterance.
    pub silence_gap_ms: u64,
    /// Minimum utterance length; shorter bursts are discarded.
    pub min_speech_ms: u64,
    /// Audio kept from before speech onset so the first phoneme isn't
    /// clipped.
    pub pre_roll_ms: u64,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            speech_rms_threshold: 0.01,
            silence_gap_ms: 600,
            min_speech_ms: 250,
            pre_roll_ms: 120,
        }
    }
}

/// Barge-in detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BargeInConfig {
    /// Whether energy-based barge-in detection is enabled.
    ///
    /// Final-transcript barge-in is always active outside the greeting.
    pub enabled: bool,
    /// RMS threshold (normalized 0..1 over 16-bit PCM) above which inbound
    /// audio during playback counts as the caller speaking.
    pub rms_threshold: f32,
    /// Grace period after playback starts during which energy triggers are
    /// ignored, masking speaker warm-up echo.
    pub grace_ms: u64,
}

impl Default for BargeInConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rms_threshold: 0.015,
            grace_ms: 1_500,
        }
    }
}

/// Echo filter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EchoConfig {
    /// How long an agent utterance stays eligible for echo matching.
    ///
    /// Bounded by the longest plausible loopback round-trip.
    pub window_secs: u64,
    /// Maximum number of register entries kept.
    pub max_entries: usize,
    /// Token-overlap ratio at or above which a transcript is treated as an
    /// echo of a register entry.
    pub overlap_threshold: f32,
    /// Minimum transcript length (chars) accepted while agent audio is
    /// still playing; shorter results are treated as corrupt.
    pub min_len_during_playback: usize,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            window_secs: 10,
            max_entries: 16,
            overlap_threshold: 0.8,
            min_len_during_playback: 3,
        }
    }
}

/// Filler and acknowledgment configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FillerConfig {
    /// Whether fillers are emitted at all.
    pub enabled: bool,
    /// Minimum gap between acknowledgments on one session.
    pub ack_cooldown_ms: u64,
    /// Extra generic fillers merged into the built-in list.
    pub extra_generic: Vec<String>,
    /// Personalised filler templates keyed by prospect name; `{name}` is
    /// the only substitution placeholder.
    pub personalized: HashMap<String, Vec<String>>,
}

impl Default for FillerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ack_cooldown_ms: 3_000,
            extra_generic: Vec::new(),
            personalized: HashMap::new(),
        }
    }
}

/// Sentence segmentation configuration for the LLM token stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SentenceConfig {
    /// Minimum buffered length before a terminal punctuation mark flushes.
    pub min_chars: usize,
    /// Buffered length at which the buffer flushes unconditionally.
    pub max_chars: usize,
}

impl Default for SentenceConfig {
    fn default() -> Self {
        Self {
            min_chars: 60,
            max_chars: 200,
        }
    }
}

/// Latency thresholds that drive the per-turn bottleneck label.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Target STT latency in milliseconds.
    pub stt_target_ms: u64,
    /// Target LLM latency in milliseconds.
    pub llm_target_ms: u64,
    /// Target TTS latency in milliseconds.
    pub tts_target_ms: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            stt_target_ms: 500,
            llm_target_ms: 1_500,
            tts_target_ms: 800,
        }
    }
}

/// Per-call recording configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Whether call recording is enabled.
    pub enabled: bool,
    /// Root directory; each call gets a subdirectory named by call id.
    pub root_dir: PathBuf,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            root_dir: PathBuf::from("recordings"),
        }
    }
}

/// Greeting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GreetingConfig {
    /// The first agent utterance of every call. Barge-in is disabled while
    /// it plays; caller speech is deferred, not discarded.
    pub text: String,
    /// Personalised greeting used when the prospect name is known;
    /// `{name}` is the only substitution placeholder.
    pub personalized_text: Option<String>,
}

impl Default for GreetingConfig {
    fn default() -> Self {
        Self {
            text: "Hello! Thanks for taking the call. How can I help you today?".to_owned(),
            personalized_text: Some(
                "Hello {name}! Thanks for taking the call. How can I help you today?".to_owned(),
            ),
        }
    }
}

/// LLM generation options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// System prompt prepended to every generation.
    pub system_prompt: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Maximum tokens per response.
    pub max_tokens: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            system_prompt: "You are a friendly phone agent. Keep responses short and \
                            conversational; the caller hears them as speech."
                .to_owned(),
            temperature: 0.7,
            max_tokens: 256,
        }
    }
}
