//! Process-level call runtime.
//!
//! Routes telephony events to per-call session orchestrators. Sessions
//! are fully independent: a fatal error tears down that call only, and
//! the runtime keeps serving the rest.

use crate::adapters::AdapterSet;
use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::pipeline::coordinator::SessionOrchestrator;
use crate::pipeline::filler::FillerCache;
use crate::pipeline::messages::{InboundFrame, SessionEvent};
use crate::session::{CallId, CallSession, CallStatus};
use crate::telephony::TelephonyEvent;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Audio frames buffered per call before frames are dropped.
const AUDIO_CHANNEL_SIZE: usize = 64;

/// Per-session event fan-in depth.
const EVENT_CHANNEL_SIZE: usize = 64;

struct SessionHandle {
    audio_tx: mpsc::Sender<InboundFrame>,
    reaper: JoinHandle<()>,
}

/// Routes telephony traffic to per-call orchestrators.
pub struct CallRuntime {
    config: OrchestratorConfig,
    adapters: AdapterSet,
    filler_cache: Arc<FillerCache>,
    events: Option<broadcast::Sender<(CallId, SessionEvent)>>,
    /// Known prospect names keyed by caller id, for personalised
    /// greetings and fillers.
    prospects: HashMap<String, String>,
}

impl CallRuntime {
    pub fn new(
        config: OrchestratorConfig,
        adapters: AdapterSet,
        filler_cache: Arc<FillerCache>,
    ) -> Self {
        Self {
            config,
            adapters,
            filler_cache,
            events: None,
            prospects: HashMap::new(),
        }
    }

    /// Attach an observability sink receiving `(call, event)` pairs.
    pub fn with_events(mut self, tx: broadcast::Sender<(CallId, SessionEvent)>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Register prospect names keyed by caller id.
    pub fn with_prospects(mut self, prospects: HashMap<String, String>) -> Self {
        self.prospects = prospects;
        self
    }

    /// Dispatch telephony events until the provider stream closes.
    ///
    /// # Errors
    ///
    /// Currently infallible at the runtime level; session-fatal errors
    /// are contained per call.
    pub async fn run(self, mut telephony_rx: mpsc::Receiver<TelephonyEvent>) -> Result<()> {
        let mut sessions: HashMap<CallId, SessionHandle> = HashMap::new();

        while let Some(event) = telephony_rx.recv().await {
            match event {
                TelephonyEvent::CallStarted { call, caller } => {
                    if sessions.contains_key(&call) {
                        warn!("duplicate call start for {call}, ignoring");
                        continue;
                    }
                    info!("call {call} started (caller {caller})");
                    let handle = self.spawn_session(call.clone(), caller);
                    sessions.insert(call, handle);
                }
                TelephonyEvent::InboundAudio { call, audio } => {
                    let Some(handle) = sessions.get(&call) else {
                        warn!("audio for unknown call {call}, dropping");
                        continue;
                    };
                    let frame = InboundFrame {
                        audio,
                        received_at: Instant::now(),
                    };
                    match handle.audio_tx.try_send(frame) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            // Real-time audio: dropping beats backpressure.
                            debug!("audio channel full for {call}, dropping frame");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            debug!("session {call} already wound down, dropping frame");
                            sessions.remove(&call);
                        }
                    }
                }
                TelephonyEvent::CallEnded { call } => {
                    let Some(handle) = sessions.remove(&call) else {
                        warn!("end event for unknown call {call}, dropping");
                        continue;
                    };
                    info!("call {call} ended");
                    // Closing the audio channel lets the pipeline flush
                    // and wind down on its own.
                    drop(handle.audio_tx);
                    let _ = handle.reaper.await;
                }
            }
        }

        // Provider stream closed: wind down every remaining session.
        info!("telephony stream closed, ending {} sessions", sessions.len());
        for (_, handle) in sessions.drain() {
            drop(handle.audio_tx);
            let _ = handle.reaper.await;
        }
        Ok(())
    }

    fn spawn_session(&self, call: CallId, caller: String) -> SessionHandle {
        let mut session = CallSession::new(call.clone(), caller.clone());
        session.status = CallStatus::Connected;
        if let Some(name) = self.prospects.get(&caller) {
            session = session.with_prospect_name(name.clone());
        }

        let (audio_tx, audio_rx) = mpsc::channel::<InboundFrame>(AUDIO_CHANNEL_SIZE);

        let mut orchestrator = SessionOrchestrator::new(
            self.config.clone(),
            self.adapters.clone(),
            session,
            Arc::clone(&self.filler_cache),
        );

        // Relay per-session events into the global sink, tagged by call.
        if let Some(global) = &self.events {
            let (session_tx, mut session_rx) = broadcast::channel(EVENT_CHANNEL_SIZE);
            orchestrator = orchestrator.with_events(session_tx);
            let global = global.clone();
            let id = call.clone();
            tokio::spawn(async move {
                while let Ok(event) = session_rx.recv().await {
                    let _ = global.send((id.clone(), event));
                }
            });
        }

        let task = tokio::spawn(orchestrator.run(audio_rx));
        let reaper = tokio::spawn(async move {
            match task.await {
                Ok(Ok(session)) => {
                    info!(
                        "session {} closed cleanly after {} turns",
                        session.id, session.metrics.turns_completed
                    );
                }
                Ok(Err(e)) => {
                    // Fatal inconsistency: this session only.
                    error!("session {call} torn down: {e}");
                }
                Err(e) => error!("session {call} task panicked: {e}"),
            }
        });

        SessionHandle { audio_tx, reaper }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CallError;
    use crate::llm::{ChatMessage, GenerationOptions, LlmAdapter};
    use crate::stt::{SttAdapter, TranscriptionResult};
    use crate::telephony::TelephonyAdapter;
    use crate::tts::{SynthesizedSpeech, TtsAdapter};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::time::Duration;

    struct NullTelephony;

    #[async_trait]
    impl TelephonyAdapter for NullTelephony {
        async fn make_call(&self, _phone: &str) -> crate::error::Result<CallId> {
            Ok(CallId::generate())
        }
        async fn end_call(&self, _call: &CallId) -> crate::error::Result<()> {
            Ok(())
        }
        async fn send_audio(&self, _call: &CallId, _audio: Bytes) -> crate::error::Result<()> {
            Ok(())
        }
        async fn clear_egress_buffer(&self, _call: &CallId) -> crate::error::Result<()> {
            Ok(())
        }
    }

    struct NullStt;

    #[async_trait]
    impl SttAdapter for NullStt {
        async fn transcribe(&self, _audio: &[u8]) -> crate::error::Result<TranscriptionResult> {
            Err(CallError::Stt("no transcription in tests".to_owned()))
        }
    }

    struct NullLlm;

    #[async_trait]
    impl LlmAdapter for NullLlm {
        async fn generate(
            &self,
            _messages: &[ChatMessage],
            _opts: &GenerationOptions,
        ) -> crate::error::Result<String> {
            Ok(String::new())
        }
    }

    struct NullTts;

    #[async_trait]
    impl TtsAdapter for NullTts {
        async fn synthesize(&self, _text: &str) -> crate::error::Result<SynthesizedSpeech> {
            Ok(SynthesizedSpeech {
                audio: Bytes::from_static(&[0xFF; 160]),
                duration: Duration::from_millis(20),
            })
        }
    }

    fn adapters() -> AdapterSet {
        AdapterSet {
            telephony: Arc::new(NullTelephony),
            stt: Arc::new(NullStt),
            llm: Arc::new(NullLlm),
            tts: Arc::new(NullTts),
        }
    }

    #[tokio::test]
    async fn unknown_call_events_are_dropped() {
        let runtime = CallRuntime::new(
            OrchestratorConfig::default(),
            adapters(),
            Arc::new(FillerCache::default()),
        );
        let (tx, rx) = mpsc::channel(8);

        tx.send(TelephonyEvent::InboundAudio {
            call: CallId::from("ghost"),
            audio: Bytes::from_static(&[0xFF; 160]),
        })
        .await
        .expect("send");
        tx.send(TelephonyEvent::CallEnded {
            call: CallId::from("ghost"),
        })
        .await
        .expect("send");
        drop(tx);

        // Must terminate without panicking despite the unknown call id.
        runtime.run(rx).await.expect("runtime run");
    }

    #[tokio::test]
    async fn session_lifecycle_start_to_end() {
        let runtime = CallRuntime::new(
            OrchestratorConfig::default(),
            adapters(),
            Arc::new(FillerCache::default()),
        );
        let (tx, rx) = mpsc::channel(8);

        tx.send(TelephonyEvent::CallStarted {
            call: CallId::from("c1"),
            caller: "+15550100".to_owned(),
        })
        .await
        .expect("send");
        tx.send(TelephonyEvent::InboundAudio {
            call: CallId::from("c1"),
            audio: Bytes::from_static(&[0xFF; 160]),
        })
        .await
        .expect("send");
        tx.send(TelephonyEvent::CallEnded {
            call: CallId::from("c1"),
        })
        .await
        .expect("send");
        drop(tx);

        runtime.run(rx).await.expect("runtime run");
    }
}
