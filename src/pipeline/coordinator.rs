//! Session orchestrator: wires the per-call pipeline stages together.
//!
//! One orchestrator runs per active call. It owns the session state and
//! drives three cooperating tasks joined by channels:
//!
//! - an **inbound task** tapping caller audio for energy (barge-in) and
//!   feeding the STT engine (streaming, or via the utterance segmenter
//!   plus a batch transcribe worker),
//! - the **main task** (this module's `drive` loop) running transcription
//!   aggregation and the turn state machine, and
//! - a **speech task** serializing the TTS queue into the outbound audio
//!   timeline.
//!
//! Cancellation is cooperative: barge-in sets the shared flag cluster and
//! a per-turn watermark drops queued speech; call teardown goes through a
//! `CancellationToken`.

use crate::adapters::{AdapterSet, SessionCapabilities};
use crate::audio::rms_of_mulaw;
use crate::config::OrchestratorConfig;
use crate::error::{CallError, Result};
use crate::llm::{ChatMessage, GenerationOptions};
use crate::pipeline::aggregator::{
    AggregatorContext, FinalOutcome, PartialOutcome, TranscriptAggregator, Utterance,
};
use crate::pipeline::barge_in::BargeInDetector;
use crate::pipeline::echo::{EchoRegister, EchoVerdict};
use crate::pipeline::filler::{ConversationStage, FillerCache, FillerLibrary, FillerScheduler};
use crate::pipeline::messages::{
    BargeInTrigger, ControlEvent, InboundFrame, SentenceChunk, SessionEvent, SttEvent,
};
use crate::pipeline::metrics::{TurnStage, bottleneck};
use crate::pipeline::playback::PlaybackClock;
use crate::pipeline::sentence::SentenceSplitter;
use crate::pipeline::turn::{Turn, TurnFlags, TurnPhase};
use crate::recording::CallRecorder;
use crate::session::{CallSession, CallStatus, SpeakerRole};
use crate::stt::{SttAdapter, SttStream, UtteranceSegmenter};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Channel buffer sizes.
const STT_CHANNEL_SIZE: usize = 32;
const SPEECH_CHANNEL_SIZE: usize = 16;
const TOKEN_CHANNEL_SIZE: usize = 64;
const UTTERANCE_CHANNEL_SIZE: usize = 4;
const TTS_CHUNK_CHANNEL_SIZE: usize = 8;

/// Idle tick when no debounce is armed.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

/// Pre-synthesised audio kinds flowing through the speech queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PrewarmKind {
    Greeting,
    Filler,
    Ack,
}

/// One item of the per-session speech queue.
#[derive(Debug)]
struct SpeechItem {
    /// Turn sequence number; items at or below the cancellation watermark
    /// are dropped unplayed.
    seq: u64,
    payload: SpeechPayload,
}

#[derive(Debug)]
enum SpeechPayload {
    Prewarmed {
        text: String,
        audio: Bytes,
        kind: PrewarmKind,
    },
    Sentence(SentenceChunk),
}

/// How a turn ended.
#[derive(Debug)]
enum TurnOutcome {
    Completed,
    Failed,
    /// Cheap continuation cancel; the merged text re-aggregates.
    Cancelled,
    /// A full utterance displaced the turn; process it immediately.
    Restart(Utterance),
    CancelledBargeIn,
    CallEnded,
}

/// Orchestrates the full pipeline for one call.
pub struct SessionOrchestrator {
    config: OrchestratorConfig,
    adapters: AdapterSet,
    session: Option<CallSession>,
    filler_cache: Arc<FillerCache>,
    cancel: CancellationToken,
    event_tx: Option<broadcast::Sender<SessionEvent>>,
}

impl SessionOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        adapters: AdapterSet,
        session: CallSession,
        filler_cache: Arc<FillerCache>,
    ) -> Self {
        Self {
            config,
            adapters,
            session: Some(session),
            filler_cache,
            cancel: CancellationToken::new(),
            event_tx: None,
        }
    }

    /// Attach an observability event broadcaster.
    pub fn with_events(mut self, tx: broadcast::Sender<SessionEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Token for external teardown (hangup handling).
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request graceful teardown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Run the call until the media stream ends or teardown is requested.
    ///
    /// Returns the final session (history and metrics) on a clean end.
    ///
    /// # Errors
    ///
    /// Returns an error on a fatal internal inconsistency; the caller
    /// tears this session down and keeps serving others.
    pub async fn run(mut self, audio_rx: mpsc::Receiver<InboundFrame>) -> Result<CallSession> {
        let mut session = self
            .session
            .take()
            .ok_or_else(|| CallError::Session("orchestrator already ran".to_owned()))?;
        let call = session.id.clone();
        info!("session {call}: pipeline starting");

        let caps = SessionCapabilities::probe(&self.adapters);
        debug!("session {call}: capabilities {caps:?}");

        let clock = Arc::new(PlaybackClock::new(self.config.audio.bytes_per_second));
        let flags = TurnFlags::new();
        let watermark = Arc::new(AtomicU64::new(0));
        let echo = Arc::new(Mutex::new(EchoRegister::new(&self.config.echo)));
        let detector = Arc::new(BargeInDetector::new(
            &self.config.barge_in,
            Arc::clone(&clock),
            flags.clone(),
        ));

        let recorder = if self.config.recording.enabled {
            match CallRecorder::create(&self.config.recording.root_dir, &call) {
                Ok(r) => Some(Arc::new(Mutex::new(r))),
                Err(e) => {
                    warn!("session {call}: recording disabled, setup failed: {e}");
                    None
                }
            }
        } else {
            None
        };

        let (stt_tx, stt_rx) = mpsc::channel::<SttEvent>(STT_CHANNEL_SIZE);
        let (control_tx, control_rx) = mpsc::unbounded_channel::<ControlEvent>();
        let (speech_tx, speech_rx) = mpsc::channel::<SpeechItem>(SPEECH_CHANNEL_SIZE);

        // STT feed: streaming when offered, segmenter + batch worker
        // otherwise. A failed stream start falls back to batch.
        let mut stt_partials = caps.stt_partials;
        let mut batch_worker: Option<JoinHandle<()>> = None;
        let feed = if stt_partials {
            match self
                .adapters
                .stt
                .start_stream(&call, stt_tx.clone())
                .await
            {
                Ok(stream) => SttFeed::Stream(stream),
                Err(e) => {
                    warn!("session {call}: STT stream unavailable, using batch mode: {e}");
                    stt_partials = false;
                    let (feed, worker) = self.batch_feed(stt_tx.clone());
                    batch_worker = Some(worker);
                    feed
                }
            }
        } else {
            let (feed, worker) = self.batch_feed(stt_tx.clone());
            batch_worker = Some(worker);
            feed
        };
        drop(stt_tx);

        let inbound_handle = {
            let ctl = InboundStageControl {
                detector: Arc::clone(&detector),
                control_tx: control_tx.clone(),
                recorder: recorder.clone(),
                cancel: self.cancel.clone(),
            };
            tokio::spawn(run_inbound_stage(audio_rx, feed, ctl))
        };

        let speech_handle = {
            let ctl = SpeechStageControl {
                call: call.clone(),
                telephony: Arc::clone(&self.adapters.telephony),
                tts: Arc::clone(&self.adapters.tts),
                caps,
                clock: Arc::clone(&clock),
                flags: flags.clone(),
                watermark: Arc::clone(&watermark),
                echo: Arc::clone(&echo),
                recorder: recorder.clone(),
                control_tx,
                cancel: self.cancel.clone(),
            };
            tokio::spawn(run_speech_stage(speech_rx, ctl))
        };

        session.status = CallStatus::Active;
        emit(&self.event_tx, SessionEvent::StatusChanged {
            status: CallStatus::Active,
        });

        let library = FillerLibrary::from_config(&self.config.filler);
        let scheduler =
            FillerScheduler::new(&self.config.filler, library, Arc::clone(&self.filler_cache));

        let mut driver = Driver {
            config: self.config.clone(),
            adapters: self.adapters.clone(),
            session,
            agg: TranscriptAggregator::new(&self.config.aggregator, stt_partials),
            scheduler,
            clock,
            flags,
            watermark,
            echo,
            detector,
            speech_tx,
            event_tx: self.event_tx.clone(),
            recorder: recorder.clone(),
            next_seq: 0,
            debounce_deadline: None,
            pending_utterance: None,
        };

        let result = drive(&mut driver, stt_rx, control_rx, &self.cancel).await;

        // Teardown: stop the stage tasks, flush leftovers, finalize.
        self.cancel.cancel();
        let _ = tokio::join!(inbound_handle, speech_handle);
        if let Some(worker) = batch_worker {
            let _ = worker.await;
        }

        // The driver must hold the last recorder reference so finalize
        // can take it out of the Arc.
        drop(recorder);
        let mut session = driver.into_session();
        session.status = if result.is_ok() {
            CallStatus::Ended
        } else {
            CallStatus::Failed
        };
        emit(&self.event_tx, SessionEvent::StatusChanged {
            status: session.status,
        });
        info!(
            "session {call}: pipeline finished ({} turns, {} cancelled, {} failed)",
            session.metrics.turns_completed,
            session.metrics.turns_cancelled,
            session.metrics.turns_failed,
        );

        result.map(|()| session)
    }

    fn batch_feed(&self, stt_tx: mpsc::Sender<SttEvent>) -> (SttFeed, JoinHandle<()>) {
        let (utterance_tx, utterance_rx) = mpsc::channel::<Vec<u8>>(UTTERANCE_CHANNEL_SIZE);
        let worker = tokio::spawn(run_batch_transcribe_stage(
            utterance_rx,
            Arc::clone(&self.adapters.stt),
            stt_tx,
            self.cancel.clone(),
        ));
        let feed = SttFeed::Batch {
            segmenter: UtteranceSegmenter::new(&self.config.segmenter, &self.config.audio),
            utterance_tx,
        };
        (feed, worker)
    }
}

fn emit(tx: &Option<broadcast::Sender<SessionEvent>>, event: SessionEvent) {
    if let Some(tx) = tx {
        let _ = tx.send(event);
    }
}

/// Signal derived from one STT event by the main task.
#[derive(Debug)]
enum SttSignal {
    None,
    /// Transcript-triggered barge-in fired (flags and clock already set).
    BargeIn(BargeInTrigger),
    /// The caller kept speaking before playback started.
    Continuation(String),
}

/// State owned by the main task.
struct Driver {
    config: OrchestratorConfig,
    adapters: AdapterSet,
    session: CallSession,
    agg: TranscriptAggregator,
    scheduler: FillerScheduler,
    clock: Arc<PlaybackClock>,
    flags: TurnFlags,
    watermark: Arc<AtomicU64>,
    echo: Arc<Mutex<EchoRegister>>,
    detector: Arc<BargeInDetector>,
    speech_tx: mpsc::Sender<SpeechItem>,
    event_tx: Option<broadcast::Sender<SessionEvent>>,
    recorder: Option<Arc<Mutex<CallRecorder>>>,
    next_seq: u64,
    debounce_deadline: Option<Instant>,
    pending_utterance: Option<Utterance>,
}

impl Driver {
    fn alloc_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn emit(&self, event: SessionEvent) {
        emit(&self.event_tx, event);
    }

    fn into_session(mut self) -> CallSession {
        // Caller speech that never finalised (hangup mid-sentence) is still
        // worth keeping in the history.
        if let Some(utterance) = self.agg.fire(Instant::now()) {
            self.session.record_turn(SpeakerRole::User, &utterance.text);
            self.record_transcript(SpeakerRole::User, &utterance.text);
        }
        if let Some(partial) = self.agg.take_pending_barge_in() {
            self.session.record_turn(SpeakerRole::User, &partial);
            self.record_transcript(SpeakerRole::User, &partial);
        }
        if let Some(recorder) = self.recorder.take() {
            if let Ok(mutex) = Arc::try_unwrap(recorder).map(Mutex::into_inner) {
                match mutex {
                    Ok(rec) => {
                        if let Err(e) = rec.finalize() {
                            warn!("failed to finalize recording: {e}");
                        }
                    }
                    Err(_) => warn!("recorder lock poisoned, recording not finalized"),
                }
            }
        }
        self.session
    }

    fn record_transcript(&self, role: SpeakerRole, text: &str) {
        if let Some(recorder) = &self.recorder
            && let Ok(mut rec) = recorder.lock()
        {
            rec.record_transcript(role, text);
        }
    }

    fn aggregator_context(&self) -> AggregatorContext {
        AggregatorContext {
            generating: self.flags.generating(),
            playback_started: self.flags.playback_started(),
            greeting_active: self.flags.greeting_active(),
        }
    }

    /// Classify one STT event: echo filtering, barge-in transcript
    /// trigger, aggregation. Arms the debounce as a side effect.
    fn handle_stt(&mut self, event: SttEvent) -> SttSignal {
        let now = event.at;
        let is_final = event.kind.is_final();
        let text = event.kind.text().to_owned();
        self.emit(SessionEvent::Transcription {
            text: text.clone(),
            is_final,
        });

        let playback_active = self.clock.is_active(now);
        let verdict = match self.echo.lock() {
            Ok(reg) => reg.verdict(&text, now, playback_active),
            Err(_) => EchoVerdict::Pass,
        };
        match verdict {
            EchoVerdict::Echo => {
                debug!("dropping echoed transcript: \"{text}\"");
                return SttSignal::None;
            }
            EchoVerdict::Corrupt => {
                if is_final {
                    self.session.metrics.transcription_errors += 1;
                }
                return SttSignal::None;
            }
            EchoVerdict::Pass => {}
        }

        if is_final {
            if let Some(trigger) = self.detector.check_final_transcript(now) {
                self.detector.fire();
                // The interrupting text seeds the next turn.
                if let FinalOutcome::Armed { deadline } =
                    self.agg
                        .on_final(&text, &AggregatorContext::default(), now)
                {
                    self.debounce_deadline = Some(deadline);
                }
                return SttSignal::BargeIn(trigger);
            }
            match self.agg.on_final(&text, &self.aggregator_context(), now) {
                FinalOutcome::Armed { deadline } => self.debounce_deadline = Some(deadline),
                FinalOutcome::Deferred => debug!("deferring transcript during greeting"),
                FinalOutcome::Ignored => {}
            }
            return SttSignal::None;
        }

        match self.agg.on_partial(&text, &self.aggregator_context(), now) {
            PartialOutcome::Continuation { partial } => SttSignal::Continuation(partial),
            PartialOutcome::Stored | PartialOutcome::Ignored => SttSignal::None,
        }
    }

    async fn enqueue(&mut self, item: SpeechItem) {
        if self.speech_tx.send(item).await.is_err() {
            warn!("speech queue closed");
        }
    }

    /// Emit an acknowledgment unless the cooldown holds.
    async fn enqueue_ack(&mut self, now: Instant) {
        let Some(ack) = self.scheduler.pick_acknowledgment(now) else {
            return;
        };
        let seq = self.alloc_seq();
        self.emit(SessionEvent::AcknowledgmentEmitted {
            text: ack.text.clone(),
        });
        self.enqueue(SpeechItem {
            seq,
            payload: SpeechPayload::Prewarmed {
                text: ack.text,
                audio: ack.audio,
                kind: PrewarmKind::Ack,
            },
        })
        .await;
    }

    /// Conversation messages for the LLM: system prompt plus history.
    fn build_messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.session.history.len() + 1);
        messages.push(ChatMessage::system(&self.config.llm.system_prompt));
        for turn in &self.session.history {
            messages.push(match turn.role {
                SpeakerRole::User => ChatMessage::user(&turn.text),
                SpeakerRole::Agent => ChatMessage::assistant(&turn.text),
            });
        }
        messages
    }

    fn greeting_text(&self) -> Option<String> {
        let greeting = &self.config.greeting;
        let text = match (&self.session.prospect_name, &greeting.personalized_text) {
            (Some(name), Some(template)) => template.replace("{name}", name),
            _ => greeting.text.clone(),
        };
        let text = text.trim().to_owned();
        (!text.is_empty()).then_some(text)
    }
}

/// Main task: greeting, then the aggregate → turn loop until the media
/// stream ends.
async fn drive(
    driver: &mut Driver,
    mut stt_rx: mpsc::Receiver<SttEvent>,
    mut control_rx: mpsc::UnboundedReceiver<ControlEvent>,
    cancel: &CancellationToken,
) -> Result<()> {
    play_greeting(driver, &mut stt_rx, &mut control_rx, cancel).await;

    'session: loop {
        if cancel.is_cancelled() {
            break;
        }

        // A turn displaced by a mid-generation utterance, or one that
        // completed aggregation while the previous turn was speaking,
        // runs before anything else.
        if let Some(utterance) = driver.pending_utterance.take() {
            let outcome = run_turn(driver, &mut stt_rx, &mut control_rx, cancel, utterance).await?;
            // Per-turn flags must not leak into the idle phase: a stale
            // `playback_started` would shunt fresh partials into the
            // barge-in slot instead of opening a new cycle.
            driver.flags.reset_for_turn();
            match outcome {
                TurnOutcome::Restart(merged) => driver.pending_utterance = Some(merged),
                TurnOutcome::CallEnded => break 'session,
                TurnOutcome::Completed
                | TurnOutcome::Failed
                | TurnOutcome::Cancelled
                | TurnOutcome::CancelledBargeIn => {}
            }
            continue;
        }

        let deadline = driver
            .debounce_deadline
            .map_or_else(|| Instant::now() + IDLE_WAIT, |d| d);

        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep_until(deadline.into()) => {
                if driver.debounce_deadline.take().is_some() {
                    let now = Instant::now();
                    if let Some(utterance) = driver.agg.fire(now) {
                        driver.pending_utterance = Some(utterance);
                    }
                }
            }
            event = stt_rx.recv() => {
                let Some(event) = event else { break 'session };
                match driver.handle_stt(event) {
                    SttSignal::Continuation(_) => {
                        // Caller still composing an utterance: acknowledge.
                        driver.enqueue_ack(Instant::now()).await;
                    }
                    SttSignal::BargeIn(trigger) => {
                        // No active turn; residual playback was already
                        // cleared by the detector.
                        debug!("stray barge-in ({trigger:?}) outside a turn");
                    }
                    SttSignal::None => {}
                }
            }
            ctrl = control_rx.recv() => {
                let Some(ctrl) = ctrl else { break 'session };
                match ctrl {
                    ControlEvent::BargeIn { trigger } => {
                        debug!("stray barge-in control ({trigger:?}) outside a turn");
                    }
                    other => debug!("stale control event outside a turn: {other:?}"),
                }
            }
        }
    }
    Ok(())
}

/// Play the greeting with barge-in disabled and caller speech deferred.
async fn play_greeting(
    driver: &mut Driver,
    stt_rx: &mut mpsc::Receiver<SttEvent>,
    control_rx: &mut mpsc::UnboundedReceiver<ControlEvent>,
    cancel: &CancellationToken,
) {
    let Some(text) = driver.greeting_text() else {
        return;
    };

    driver.flags.set_greeting_active(true);
    let speech = match driver.adapters.tts.synthesize(&text).await {
        Ok(s) => s,
        Err(e) => {
            // A call without a greeting is degraded, not dead.
            warn!("greeting synthesis failed: {e}");
            driver.flags.set_greeting_active(false);
            return;
        }
    };

    let seq = driver.alloc_seq();
    driver
        .enqueue(SpeechItem {
            seq,
            payload: SpeechPayload::Prewarmed {
                text: text.clone(),
                audio: speech.audio,
                kind: PrewarmKind::Greeting,
            },
        })
        .await;

    // Wait for the greeting to flush and its playback estimate to drain.
    // Caller transcripts arriving meanwhile are deferred by the
    // aggregator, not processed.
    let mut drain_until: Option<Instant> = None;
    loop {
        let deadline = drain_until.map_or_else(|| Instant::now() + IDLE_WAIT, |d| d);
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep_until(deadline.into()), if drain_until.is_some() => break,
            event = stt_rx.recv() => {
                let Some(event) = event else { break };
                let _ = driver.handle_stt(event);
            }
            ctrl = control_rx.recv() => {
                match ctrl {
                    Some(ControlEvent::SpeechFlushed { seq: s, estimated_end }) if s == seq => {
                        drain_until = Some(estimated_end);
                    }
                    Some(ControlEvent::SpeechFailed { seq: s, error }) if s == seq => {
                        warn!("greeting playback failed: {error}");
                        break;
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        }
    }
    driver.flags.set_greeting_active(false);

    driver.session.record_turn(SpeakerRole::Agent, &text);
    driver.record_transcript(SpeakerRole::Agent, &text);
    driver.emit(SessionEvent::AgentSentence { text });
    info!("greeting finished, conversation open");
}

/// Drive one turn: filler, LLM stream, sentence-chunked TTS, drain.
async fn run_turn(
    driver: &mut Driver,
    stt_rx: &mut mpsc::Receiver<SttEvent>,
    control_rx: &mut mpsc::UnboundedReceiver<ControlEvent>,
    cancel: &CancellationToken,
    utterance: Utterance,
) -> Result<TurnOutcome> {
    let accepted_at = Instant::now();
    let mut turn = Turn::new();
    turn.metrics.mark_at(TurnStage::SttStart, utterance.started_at);
    turn.metrics.mark_at(TurnStage::SttEnd, accepted_at);
    turn.begin_aggregating()?;
    turn.begin_generating()?;

    driver.flags.reset_for_turn();
    driver.flags.set_generating(true);
    driver.clock.begin_turn();
    let seq = driver.alloc_seq();

    info!("turn {}: accepted \"{}\"", turn.id, utterance.text);
    driver.emit(SessionEvent::UtteranceAccepted {
        text: utterance.text.clone(),
    });

    let stage = ConversationStage::from_turn_count(driver.session.user_turn_count());
    driver
        .session
        .record_turn(SpeakerRole::User, &utterance.text);
    driver.record_transcript(SpeakerRole::User, &utterance.text);

    // Filler first: it masks the whole LLM round-trip.
    let prospect = driver.session.prospect_name.clone();
    if let Some(filler) = driver
        .scheduler
        .pick_filler(stage, &utterance.text, prospect.as_deref())
    {
        driver.emit(SessionEvent::FillerEmitted {
            text: filler.text.clone(),
        });
        driver
            .enqueue(SpeechItem {
                seq,
                payload: SpeechPayload::Prewarmed {
                    text: filler.text,
                    audio: filler.audio,
                    kind: PrewarmKind::Filler,
                },
            })
            .await;
    }

    // Start the LLM stream.
    turn.metrics.mark(TurnStage::LlmStart);
    let messages = driver.build_messages();
    let opts = GenerationOptions::from(&driver.config.llm);
    let (token_tx, mut token_rx) = mpsc::channel::<String>(TOKEN_CHANNEL_SIZE);
    let llm = Arc::clone(&driver.adapters.llm);
    let mut llm_task: Option<JoinHandle<Result<()>>> = Some(tokio::spawn(async move {
        llm.generate_stream(&messages, &opts, token_tx).await
    }));

    let mut splitter = SentenceSplitter::new(&driver.config.sentence);
    let mut response_text = String::new();
    let mut tts_started = false;
    let mut llm_done = false;
    let mut flushed_end: Option<Instant> = None;

    let outcome = 'turn: loop {
        // Once the speech queue flushed and generation is over, drain the
        // playback estimate; barge-in stays live until it empties.
        let drain_deadline = match flushed_end {
            Some(end) if llm_done => end,
            _ => Instant::now() + IDLE_WAIT,
        };
        let draining = llm_done && flushed_end.is_some();

        tokio::select! {
            () = cancel.cancelled() => {
                abort_generation(&mut llm_task);
                break 'turn TurnOutcome::CallEnded;
            }
            () = tokio::time::sleep_until(drain_deadline.into()), if draining => {
                if turn.phase() == TurnPhase::Speaking {
                    turn.complete()?;
                } else {
                    turn.complete_silent()?;
                }
                break 'turn TurnOutcome::Completed;
            }
            token = token_rx.recv(), if !llm_done => {
                match token {
                    Some(token) => {
                        if let Some(chunk) = splitter.push(&token) {
                            if !tts_started {
                                turn.metrics.mark(TurnStage::TtsStart);
                                tts_started = true;
                            }
                            push_sentence(driver, seq, &mut response_text, chunk, false).await;
                        }
                    }
                    None => {
                        llm_done = true;
                        driver.flags.set_generating(false);
                        match join_generation(&mut llm_task).await {
                            Ok(()) => {
                                turn.metrics.mark(TurnStage::LlmEnd);
                                if let Some(rest) = splitter.finish() {
                                    if !tts_started {
                                        turn.metrics.mark(TurnStage::TtsStart);
                                        tts_started = true;
                                    }
                                    push_sentence(driver, seq, &mut response_text, rest, false)
                                        .await;
                                }
                                // End-of-response marker for the speech stage.
                                driver
                                    .enqueue(SpeechItem {
                                        seq,
                                        payload: SpeechPayload::Sentence(SentenceChunk {
                                            text: String::new(),
                                            is_final: true,
                                        }),
                                    })
                                    .await;
                            }
                            Err(e) => {
                                error!("turn {}: LLM failed: {e}", turn.id);
                                fail_turn(driver, &mut turn, seq, e.to_string());
                                break 'turn TurnOutcome::Failed;
                            }
                        }
                    }
                }
            }
            event = stt_rx.recv() => {
                let Some(event) = event else {
                    abort_generation(&mut llm_task);
                    break 'turn TurnOutcome::CallEnded;
                };
                match driver.handle_stt(event) {
                    SttSignal::BargeIn(trigger) => {
                        cancel_turn_barge_in(driver, &mut turn, seq, &mut llm_task, trigger)
                            .await?;
                        break 'turn TurnOutcome::CancelledBargeIn;
                    }
                    SttSignal::Continuation(partial) => {
                        if turn.can_cancel_cheaply() {
                            debug!(
                                "turn {}: continuation \"{partial}\", cancelling cheaply",
                                turn.id
                            );
                            cancel_turn_cheap(driver, &mut turn, seq, &mut llm_task)?;
                            driver.agg.merge_for_restart(&utterance);
                            // Re-arm so the merged text fires even if no
                            // further final arrives.
                            driver.debounce_deadline =
                                Some(Instant::now() + driver.agg.debounce());
                            driver.enqueue_ack(Instant::now()).await;
                            break 'turn TurnOutcome::Cancelled;
                        }
                    }
                    SttSignal::None => {}
                }
            }
            // Debounce fired mid-turn: a fresh utterance is ready.
            () = tokio::time::sleep_until(
                driver
                    .debounce_deadline
                    .map_or_else(|| Instant::now() + IDLE_WAIT, |d| d)
                    .into()
            ), if driver.debounce_deadline.is_some() => {
                driver.debounce_deadline = None;
                let Some(new_utterance) = driver.agg.fire(Instant::now()) else {
                    continue;
                };
                if turn.can_cancel_cheaply() {
                    cancel_turn_cheap(driver, &mut turn, seq, &mut llm_task)?;
                    let mut text = utterance.text.clone();
                    if !new_utterance.text.is_empty() {
                        if !text.is_empty() {
                            text.push(' ');
                        }
                        text.push_str(&new_utterance.text);
                    }
                    break 'turn TurnOutcome::Restart(Utterance {
                        text,
                        started_at: utterance.started_at,
                    });
                }
                // Playback already started: run it after this turn.
                driver.pending_utterance = Some(new_utterance);
            }
            ctrl = control_rx.recv() => {
                let Some(ctrl) = ctrl else {
                    abort_generation(&mut llm_task);
                    break 'turn TurnOutcome::CallEnded;
                };
                match ctrl {
                    ControlEvent::BargeIn { trigger } => {
                        cancel_turn_barge_in(driver, &mut turn, seq, &mut llm_task, trigger)
                            .await?;
                        break 'turn TurnOutcome::CancelledBargeIn;
                    }
                    ControlEvent::FillerEmitted { seq: s, at } if s == seq => {
                        turn.metrics.mark_at(TurnStage::FillerStart, at);
                    }
                    ControlEvent::FirstAudio { seq: s, at } if s == seq => {
                        turn.begin_speaking()?;
                        turn.metrics.mark_at(TurnStage::FirstAudio, at);
                    }
                    ControlEvent::SpeechFlushed { seq: s, estimated_end } if s == seq => {
                        turn.metrics.mark(TurnStage::TtsEnd);
                        flushed_end = Some(estimated_end);
                    }
                    ControlEvent::SpeechFailed { seq: s, error } if s == seq => {
                        error!("turn {}: speech failed: {error}", turn.id);
                        abort_generation(&mut llm_task);
                        fail_turn(driver, &mut turn, seq, error);
                        break 'turn TurnOutcome::Failed;
                    }
                    stale => debug!("stale control event: {stale:?}"),
                }
            }
        }
    };

    if let TurnOutcome::Completed = outcome {
        driver
            .session
            .record_turn(SpeakerRole::Agent, &response_text);
        driver.record_transcript(SpeakerRole::Agent, &response_text);

        let breakdown = turn.metrics.breakdown();
        let label = bottleneck(&breakdown, &driver.config.metrics);
        driver.session.metrics.record_turn(&breakdown);
        info!(
            "turn {}: completed in {:?} (stt {:?}, llm {:?}, tts {:?}, ttfa {:?}, bottleneck {label:?})",
            turn.id,
            breakdown.total,
            breakdown.stt,
            breakdown.llm,
            breakdown.tts,
            breakdown.time_to_first_audio,
        );
        driver.emit(SessionEvent::TurnCompleted {
            turn_id: turn.id.clone(),
            breakdown,
            bottleneck: label,
        });
    }

    Ok(outcome)
}

/// Enqueue one sentence for synthesis and account for it.
async fn push_sentence(
    driver: &mut Driver,
    seq: u64,
    response_text: &mut String,
    chunk: String,
    is_final: bool,
) {
    if !response_text.is_empty() {
        response_text.push(' ');
    }
    response_text.push_str(&chunk);
    driver.emit(SessionEvent::AgentSentence {
        text: chunk.clone(),
    });
    driver
        .enqueue(SpeechItem {
            seq,
            payload: SpeechPayload::Sentence(SentenceChunk {
                text: chunk,
                is_final,
            }),
        })
        .await;
}

fn abort_generation(llm_task: &mut Option<JoinHandle<Result<()>>>) {
    if let Some(task) = llm_task.take() {
        task.abort();
    }
}

async fn join_generation(llm_task: &mut Option<JoinHandle<Result<()>>>) -> Result<()> {
    match llm_task.take() {
        Some(task) => match task.await {
            Ok(result) => result,
            Err(e) => Err(CallError::Llm(format!("generation task panicked: {e}"))),
        },
        None => Ok(()),
    }
}

/// Cheap cancellation: playback never started, so dropping queued speech
/// and the token stream is enough. No egress clear, no audible artifact.
fn cancel_turn_cheap(
    driver: &mut Driver,
    turn: &mut Turn,
    seq: u64,
    llm_task: &mut Option<JoinHandle<Result<()>>>,
) -> Result<()> {
    driver.watermark.store(seq, Ordering::Release);
    abort_generation(llm_task);
    driver.flags.set_generating(false);
    turn.cancel()?;
    turn.finish_cancelled()?;
    // The merged utterance re-records the caller's words.
    driver.session.retract_last_user_turn();
    driver.session.metrics.turns_cancelled += 1;
    driver.emit(SessionEvent::TurnCancelled {
        turn_id: turn.id.clone(),
    });
    Ok(())
}

/// Barge-in cancellation: stop emitting, clear the provider's egress
/// buffer, zero the playback estimate. No acknowledgment (it would
/// cascade straight back into the detector).
async fn cancel_turn_barge_in(
    driver: &mut Driver,
    turn: &mut Turn,
    seq: u64,
    llm_task: &mut Option<JoinHandle<Result<()>>>,
    trigger: BargeInTrigger,
) -> Result<()> {
    info!("turn {}: barge-in ({trigger:?})", turn.id);
    driver.watermark.store(seq, Ordering::Release);
    abort_generation(llm_task);
    driver.flags.set_generating(false);
    if let Err(e) = driver
        .adapters
        .telephony
        .clear_egress_buffer(&driver.session.id)
        .await
    {
        warn!("failed to clear egress buffer: {e}");
    }
    turn.cancel()?;
    turn.finish_cancelled()?;
    driver.session.metrics.turns_cancelled += 1;
    driver.emit(SessionEvent::BargeIn { trigger });
    driver.emit(SessionEvent::TurnCancelled {
        turn_id: turn.id.clone(),
    });
    Ok(())
}

/// Non-cancellation failure: the turn dies silently, the session lives.
fn fail_turn(driver: &mut Driver, turn: &mut Turn, seq: u64, error: String) {
    driver.watermark.store(seq, Ordering::Release);
    driver.flags.set_generating(false);
    turn.fail(error.clone());
    driver.session.metrics.turns_failed += 1;
    driver.emit(SessionEvent::TurnFailed {
        turn_id: turn.id.clone(),
        error,
    });
}

// -- Stage runner functions --

/// STT input path chosen at session start.
enum SttFeed {
    Stream(Box<dyn SttStream>),
    Batch {
        segmenter: UtteranceSegmenter,
        utterance_tx: mpsc::Sender<Vec<u8>>,
    },
}

/// Bundled control state for the inbound-audio stage.
struct InboundStageControl {
    detector: Arc<BargeInDetector>,
    control_tx: mpsc::UnboundedSender<ControlEvent>,
    recorder: Option<Arc<Mutex<CallRecorder>>>,
    cancel: CancellationToken,
}

/// Inbound stage: energy tap for barge-in plus the STT feed.
async fn run_inbound_stage(
    mut rx: mpsc::Receiver<InboundFrame>,
    mut feed: SttFeed,
    ctl: InboundStageControl,
) {
    loop {
        tokio::select! {
            () = ctl.cancel.cancelled() => break,
            frame = rx.recv() => {
                let Some(frame) = frame else {
                    // Media stream ended: flush whatever the STT path holds.
                    match &mut feed {
                        SttFeed::Stream(stream) => {
                            if let Err(e) = stream.finish().await {
                                debug!("stt stream finish failed: {e}");
                            }
                        }
                        SttFeed::Batch { segmenter, utterance_tx } => {
                            if let Some(utterance) = segmenter.flush() {
                                let _ = utterance_tx.send(utterance).await;
                            }
                        }
                    }
                    break;
                };

                if let Some(recorder) = &ctl.recorder
                    && let Ok(mut rec) = recorder.lock()
                    && let Err(e) = rec.append_user_audio(&frame.audio)
                {
                    debug!("user audio recording failed: {e}");
                }

                let rms = rms_of_mulaw(&frame.audio);
                if let Some(trigger) = ctl.detector.check_energy(rms, frame.received_at) {
                    info!("energy barge-in detected (rms {rms:.3})");
                    ctl.detector.fire();
                    let _ = ctl.control_tx.send(ControlEvent::BargeIn { trigger });
                }

                match &mut feed {
                    SttFeed::Stream(stream) => {
                        if let Err(e) = stream.feed(&frame.audio).await {
                            warn!("stt stream feed failed: {e}");
                        }
                    }
                    SttFeed::Batch { segmenter, utterance_tx } => {
                        if let Some(utterance) = segmenter.push_frame(&frame.audio, rms)
                            && utterance_tx.send(utterance).await.is_err()
                        {
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Batch transcription worker: one utterance per request, in order.
async fn run_batch_transcribe_stage(
    mut rx: mpsc::Receiver<Vec<u8>>,
    stt: Arc<dyn SttAdapter>,
    tx: mpsc::Sender<SttEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            utterance = rx.recv() => {
                let Some(utterance) = utterance else { break };
                match stt.transcribe(&utterance).await {
                    Ok(result) => {
                        let event = SttEvent {
                            kind: crate::pipeline::messages::SttEventKind::Final(result.text),
                            at: Instant::now(),
                        };
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    // Transient failure: drop this utterance, the next
                    // one starts clean. Retrying would stack latency past
                    // conversational recovery.
                    Err(e) => error!("batch transcription failed: {e}"),
                }
            }
        }
    }
}

/// Bundled control state for the speech stage.
struct SpeechStageControl {
    call: crate::session::CallId,
    telephony: Arc<dyn crate::telephony::TelephonyAdapter>,
    tts: Arc<dyn crate::tts::TtsAdapter>,
    caps: SessionCapabilities,
    clock: Arc<PlaybackClock>,
    flags: TurnFlags,
    watermark: Arc<AtomicU64>,
    echo: Arc<Mutex<EchoRegister>>,
    recorder: Option<Arc<Mutex<CallRecorder>>>,
    control_tx: mpsc::UnboundedSender<ControlEvent>,
    cancel: CancellationToken,
}

impl SpeechStageControl {
    fn cancelled(&self, seq: u64) -> bool {
        seq <= self.watermark.load(Ordering::Acquire) || self.flags.cancel_requested()
    }

    fn record_echo(&self, text: &str, at: Instant) {
        if let Ok(mut reg) = self.echo.lock() {
            reg.record(text, at);
        }
    }

    fn record_agent_audio(&self, audio: &[u8]) {
        if let Some(recorder) = &self.recorder
            && let Ok(mut rec) = recorder.lock()
            && let Err(e) = rec.append_agent_audio(audio)
        {
            debug!("agent audio recording failed: {e}");
        }
    }
}

/// Speech stage: the single consumer of the per-session TTS queue.
///
/// Items are played strictly in enqueue order; at most one synthesis runs
/// at a time; cancellation drops everything at or below the watermark.
async fn run_speech_stage(mut rx: mpsc::Receiver<SpeechItem>, ctl: SpeechStageControl) {
    // Sequence that already reported its first audio byte.
    let mut first_audio_seq: Option<u64> = None;

    loop {
        tokio::select! {
            () = ctl.cancel.cancelled() => break,
            item = rx.recv() => {
                let Some(item) = item else { break };
                let seq = item.seq;
                if ctl.cancelled(seq) {
                    debug!("dropping cancelled speech item (seq {seq})");
                    continue;
                }

                match item.payload {
                    SpeechPayload::Prewarmed { text, audio, kind } => {
                        if audio.is_empty() {
                            continue;
                        }
                        let now = Instant::now();
                        if let Err(e) = ctl.telephony.send_audio(&ctl.call, audio.clone()).await {
                            let _ = ctl.control_tx.send(ControlEvent::SpeechFailed {
                                seq,
                                error: format!("outbound send failed: {e}"),
                            });
                            continue;
                        }
                        ctl.clock.extend(audio.len(), now);
                        ctl.record_agent_audio(&audio);
                        ctl.record_echo(&text, now);
                        match kind {
                            PrewarmKind::Filler => {
                                let _ = ctl
                                    .control_tx
                                    .send(ControlEvent::FillerEmitted { seq, at: now });
                            }
                            PrewarmKind::Greeting => {
                                let estimated_end =
                                    ctl.clock.end_estimate().unwrap_or(now);
                                let _ = ctl.control_tx.send(ControlEvent::SpeechFlushed {
                                    seq,
                                    estimated_end,
                                });
                            }
                            PrewarmKind::Ack => {}
                        }
                    }
                    SpeechPayload::Sentence(chunk) => {
                        if !chunk.text.is_empty() {
                            synthesize_sentence(&ctl, seq, &chunk.text, &mut first_audio_seq)
                                .await;
                        }
                        if chunk.is_final && !ctl.cancelled(seq) {
                            let estimated_end =
                                ctl.clock.end_estimate().unwrap_or_else(Instant::now);
                            let _ = ctl.control_tx.send(ControlEvent::SpeechFlushed {
                                seq,
                                estimated_end,
                            });
                        }
                    }
                }
            }
        }
    }
}

/// Synthesize one sentence and emit its audio, observing cancellation
/// before every chunk.
async fn synthesize_sentence(
    ctl: &SpeechStageControl,
    seq: u64,
    text: &str,
    first_audio_seq: &mut Option<u64>,
) {
    let start = Instant::now();
    let mut emitted_any = false;

    if ctl.caps.tts_streaming {
        let (chunk_tx, mut chunk_rx) = mpsc::channel::<Bytes>(TTS_CHUNK_CHANNEL_SIZE);
        let tts = Arc::clone(&ctl.tts);
        let owned = text.to_owned();
        let synth = tokio::spawn(async move { tts.synthesize_stream(&owned, chunk_tx).await });

        while let Some(chunk) = chunk_rx.recv().await {
            if ctl.cancelled(seq) {
                break;
            }
            if !emit_chunk(ctl, seq, &chunk, first_audio_seq).await {
                synth.abort();
                return;
            }
            emitted_any = true;
        }
        drop(chunk_rx);
        match synth.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if !ctl.cancelled(seq) {
                    let _ = ctl.control_tx.send(ControlEvent::SpeechFailed {
                        seq,
                        error: e.to_string(),
                    });
                }
                return;
            }
            Err(e) => {
                let _ = ctl.control_tx.send(ControlEvent::SpeechFailed {
                    seq,
                    error: format!("synthesis task panicked: {e}"),
                });
                return;
            }
        }
    } else {
        match ctl.tts.synthesize(text).await {
            Ok(speech) => {
                if ctl.cancelled(seq) {
                    return;
                }
                if !emit_chunk(ctl, seq, &speech.audio, first_audio_seq).await {
                    return;
                }
                emitted_any = true;
            }
            Err(e) => {
                let _ = ctl.control_tx.send(ControlEvent::SpeechFailed {
                    seq,
                    error: e.to_string(),
                });
                return;
            }
        }
    }

    if emitted_any {
        // Even a partially played sentence can echo back through STT.
        ctl.record_echo(text, Instant::now());
        debug!(
            "sentence synthesized and emitted in {:?}: \"{text}\"",
            start.elapsed()
        );
    }
}

/// Emit one audio chunk to telephony. Returns false when the turn must
/// fail (send error already signalled).
async fn emit_chunk(
    ctl: &SpeechStageControl,
    seq: u64,
    chunk: &Bytes,
    first_audio_seq: &mut Option<u64>,
) -> bool {
    let now = Instant::now();
    if let Err(e) = ctl.telephony.send_audio(&ctl.call, chunk.clone()).await {
        let _ = ctl.control_tx.send(ControlEvent::SpeechFailed {
            seq,
            error: format!("outbound send failed: {e}"),
        });
        return false;
    }
    ctl.clock.extend(chunk.len(), now);
    ctl.flags.set_playback_started();
    ctl.record_agent_audio(chunk);
    if *first_audio_seq != Some(seq) {
        *first_audio_seq = Some(seq);
        let _ = ctl
            .control_tx
            .send(ControlEvent::FirstAudio { seq, at: now });
    }
    true
}
