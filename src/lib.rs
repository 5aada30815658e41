//! Voxcall: real-time voice-agent orchestration for phone calls.
//!
//! For every active call the crate runs a full-duplex pipeline:
//! Caller → Telephony → STT → Turn engine → LLM → TTS → Caller
//!
//! # Architecture
//!
//! The pipeline is built from independent stages connected by async
//! channels:
//! - **Inbound audio**: taps caller frames for energy (barge-in) and
//!   feeds the STT engine
//! - **Aggregation**: debounces and merges partial/final transcripts
//!   into consolidated utterances
//! - **Turn engine**: the state machine gating one active turn per call,
//!   with filler injection, continuation handling and barge-in
//!   cancellation
//! - **Speech**: serializes sentence-chunked LLM output through TTS onto
//!   the outbound audio timeline
//!
//! Telephony, STT, LLM and TTS are external collaborators behind the
//! narrow async traits in [`telephony`], [`stt`], [`llm`] and [`tts`];
//! reference HTTP/WebSocket adapters are included.

pub mod adapters;
pub mod audio;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod recording;
pub mod runtime;
pub mod session;
pub mod stt;
pub mod telephony;
pub mod tts;

pub use adapters::{AdapterSet, SessionCapabilities};
pub use config::OrchestratorConfig;
pub use error::{CallError, Result};
pub use pipeline::coordinator::SessionOrchestrator;
pub use pipeline::filler::{FillerCache, FillerLibrary};
pub use pipeline::messages::{InboundFrame, SessionEvent};
pub use runtime::CallRuntime;
pub use session::{CallId, CallSession, CallStatus};
